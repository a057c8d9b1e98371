//! Pipeline state machine
//!
//! `Received → Analyzed → ContextBuilt → SqlGenerated → Executed →
//! Synthesized → Done`, with `Failed` reachable from any non-terminal state
//! and a degraded marker that sticks once a fallback tier is taken.

use crate::agent::fallback::FallbackTier;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Received,
    Analyzed,
    ContextBuilt,
    #[serde(rename = "SQLGenerated")]
    SqlGenerated,
    Executed,
    Synthesized,
    Done,
    Failed,
}

impl PipelineState {
    pub fn next(&self) -> Option<PipelineState> {
        match self {
            PipelineState::Received => Some(PipelineState::Analyzed),
            PipelineState::Analyzed => Some(PipelineState::ContextBuilt),
            PipelineState::ContextBuilt => Some(PipelineState::SqlGenerated),
            PipelineState::SqlGenerated => Some(PipelineState::Executed),
            PipelineState::Executed => Some(PipelineState::Synthesized),
            PipelineState::Synthesized => Some(PipelineState::Done),
            PipelineState::Done | PipelineState::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Received => "Received",
            PipelineState::Analyzed => "Analyzed",
            PipelineState::ContextBuilt => "ContextBuilt",
            PipelineState::SqlGenerated => "SQLGenerated",
            PipelineState::Executed => "Executed",
            PipelineState::Synthesized => "Synthesized",
            PipelineState::Done => "Done",
            PipelineState::Failed => "Failed",
        }
    }
}

/// Per-request record of visited states and fallback tiers taken.
#[derive(Debug, Clone)]
pub struct StateTracker {
    current: PipelineState,
    trace: Vec<PipelineState>,
    tiers: Vec<FallbackTier>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            current: PipelineState::Received,
            trace: vec![PipelineState::Received],
            tiers: Vec::new(),
        }
    }

    pub fn current(&self) -> PipelineState {
        self.current
    }

    /// Move to the successor state. Returns false, leaving the state
    /// unchanged, when `to` is not the successor.
    pub fn advance(&mut self, to: PipelineState) -> bool {
        if self.current.next() != Some(to) {
            return false;
        }
        debug!("State {} -> {}", self.current.as_str(), to.as_str());
        self.current = to;
        self.trace.push(to);
        true
    }

    pub fn fail(&mut self) {
        if !self.current.is_terminal() {
            debug!("State {} -> Failed", self.current.as_str());
            self.current = PipelineState::Failed;
            self.trace.push(PipelineState::Failed);
        }
    }

    /// Attach the degraded marker for a fallback tier; each tier is recorded
    /// once.
    pub fn degrade(&mut self, tier: FallbackTier) {
        if !self.tiers.contains(&tier) {
            self.tiers.push(tier);
        }
    }

    pub fn is_degraded(&self) -> bool {
        !self.tiers.is_empty()
    }

    pub fn tiers(&self) -> &[FallbackTier] {
        &self.tiers
    }

    pub fn trace(&self) -> &[PipelineState] {
        &self.trace
    }
}
