//! Question Analyzer
//!
//! Turns the raw question into a `ProcessedQuestion`: typed entities, a closed
//! intent tag, a complexity tier and table hints. Exact patterns run first
//! (identifiers, ISO dates, currency, percentages, numbers), then a looser
//! pass picks up quoted or capitalised category/brand tokens. Analysis never
//! fails; an uninterpretable question comes back as `Other`/`Simple` with
//! `ambiguous` set.

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tracing::debug;

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"\b\d{8,14}\b").unwrap();
    static ref KEYED_IDENTIFIER: Regex =
        Regex::new(r#"(?i)\b(?:upc|sku|gtin|ean|id|code)\s*(?:code\s*)?[:=#]?\s*['"]?([A-Za-z0-9][A-Za-z0-9-]{2,})['"]?"#).unwrap();
    static ref ISO_DATE: Regex = Regex::new(r"\b(\d{4}-\d{2}-\d{2})\b").unwrap();
    static ref YEAR: Regex = Regex::new(r"(?i)\b(?:in|for|during|since|of|from)\s+((?:19|20)\d{2})\b").unwrap();
    static ref CURRENCY: Regex = Regex::new(r"\$\s?(\d[\d,]*(?:\.\d+)?)").unwrap();
    static ref CURRENCY_WORD: Regex = Regex::new(r"(?i)\b(\d+(?:\.\d+)?)\s?(?:dollars|usd)\b").unwrap();
    static ref PERCENTAGE: Regex = Regex::new(r"(?i)\b(\d+(?:\.\d+)?)\s?(?:%|percent\b)").unwrap();
    static ref NUMBER: Regex = Regex::new(r"\b\d+(?:\.\d+)?\b").unwrap();
    static ref QUOTED: Regex = Regex::new(r#"(?:^|[\s(,=:])(?:'([^']{1,80})'|"([^"]{1,80})")"#).unwrap();
    static ref CAPITALISED: Regex = Regex::new(r"\b[A-Z][a-z][\w&'-]*(?:\s+[A-Z][a-z][\w&'-]*)*").unwrap();
    static ref RANKING: Regex = Regex::new(r"(?i)\b(?:top|bottom|best|worst)\s+(\d{1,4})\b").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// Words that start a question rather than name something.
const STOPWORDS: &[&str] = &[
    "what", "which", "how", "show", "list", "give", "find", "get", "the", "is", "are", "for",
    "compare", "display", "tell", "me", "who", "when", "where", "why", "top", "total", "average",
    "please", "can", "could", "do", "does", "i", "we", "a", "an", "in", "of",
];

const AGGREGATION_KEYWORDS: &[&str] = &[
    "total", "sum", "average", "avg", "mean", "count", "how many", "number of", "maximum",
    "minimum", "max", "min", "highest", "lowest", "top", "most", "least", "per", "each", "group",
];

const COMPARISON_KEYWORDS: &[&str] = &[
    "compare", "compared", "comparison", "versus", "vs", "difference", "between", "than",
    "relative to", "against",
];

const TREND_KEYWORDS: &[&str] = &[
    "trend", "over time", "monthly", "weekly", "daily", "yearly", "by month", "by week", "by day",
    "by year", "history", "historical", "change over", "timeline",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Pricing,
    Elasticity,
    Competitive,
    Sales,
    Margin,
    Other,
}

impl Intent {
    /// Scored intents in tie-break order.
    pub const SCORED: [Intent; 5] = [
        Intent::Elasticity,
        Intent::Margin,
        Intent::Competitive,
        Intent::Sales,
        Intent::Pricing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Pricing => "pricing",
            Intent::Elasticity => "elasticity",
            Intent::Competitive => "competitive",
            Intent::Sales => "sales",
            Intent::Margin => "margin",
            Intent::Other => "other",
        }
    }

    pub fn parse(tag: &str) -> Option<Intent> {
        match tag.trim().to_lowercase().as_str() {
            "pricing" => Some(Intent::Pricing),
            "elasticity" => Some(Intent::Elasticity),
            "competitive" => Some(Intent::Competitive),
            "sales" => Some(Intent::Sales),
            "margin" => Some(Intent::Margin),
            "other" => Some(Intent::Other),
            _ => None,
        }
    }

    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            Intent::Pricing => &[
                "price", "prices", "pricing", "priced", "cost", "costs", "msrp", "how much", "retail",
                "shelf price",
            ],
            Intent::Elasticity => &[
                "elasticity", "elastic", "inelastic", "sensitivity", "price change", "price increase",
                "price decrease", "demand response",
            ],
            Intent::Competitive => &[
                "competitor", "competitors", "competitive", "competition", "versus", "vs",
                "market share", "rival", "benchmark",
            ],
            Intent::Sales => &[
                "sales", "sold", "revenue", "units", "volume", "orders", "transactions", "selling",
                "sell",
            ],
            Intent::Margin => &[
                "margin", "margins", "profit", "profitability", "markup", "cogs", "gross",
            ],
            Intent::Other => &[],
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

impl Complexity {
    fn from_score(score: usize) -> Self {
        match score {
            0..=2 => Complexity::Simple,
            3..=5 => Complexity::Moderate,
            _ => Complexity::Complex,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Moderate => "moderate",
            Complexity::Complex => "complex",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Identifier,
    Date,
    Number,
    Currency,
    Percentage,
    Category,
}

/// A typed value found in the question. Values are raw text and must go
/// through literal escaping before they reach SQL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedEntity {
    pub kind: EntityKind,
    pub value: String,
    /// Byte range in the raw question
    pub span: (usize, usize),
    pub confidence: f64,
    /// Column the value most likely belongs to (`upc`, `sku`, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_hint: Option<String>,
}

/// Shape cues beyond the intent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QuestionSignals {
    pub aggregation: bool,
    pub comparison: bool,
    pub trend: bool,
    /// `top N` style row count
    pub ranking_limit: Option<usize>,
    /// Asks for lowest rather than highest
    pub ascending: bool,
    /// Asks for the current / most recent value
    pub latest: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedQuestion {
    pub raw: String,
    pub normalized: String,
    pub entities: Vec<ExtractedEntity>,
    pub intent: Intent,
    pub complexity: Complexity,
    pub table_hints: Vec<String>,
    pub signals: QuestionSignals,
    pub ambiguous: bool,
}

impl ProcessedQuestion {
    pub fn entities_of(&self, kind: EntityKind) -> impl Iterator<Item = &ExtractedEntity> + '_ {
        self.entities.iter().filter(move |e| e.kind == kind)
    }

    pub fn has_entity(&self, kind: EntityKind) -> bool {
        self.entities.iter().any(|e| e.kind == kind)
    }
}

#[derive(Debug, Clone, Default)]
pub struct QuestionAnalyzer {
    known_tables: Vec<String>,
    similarity_threshold: f64,
}

impl QuestionAnalyzer {
    pub fn new(known_tables: Vec<String>) -> Self {
        Self {
            known_tables,
            similarity_threshold: 0.92,
        }
    }

    pub fn analyze(&self, question: &str) -> ProcessedQuestion {
        self.analyze_with_hints(question, &[])
    }

    /// Analyze, adding caller-supplied table hints ahead of detected ones.
    pub fn analyze_with_hints(&self, question: &str, requested_tables: &[String]) -> ProcessedQuestion {
        let raw = question.to_string();
        let normalized = WHITESPACE
            .replace_all(question.trim(), " ")
            .to_lowercase();

        let entities = extract_entities(&raw);
        let intent = classify_intent(&normalized);
        let signals = detect_signals(&normalized, &raw);

        let mut table_hints: Vec<String> = requested_tables
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        for table in self.detect_tables(&normalized) {
            if !table_hints.contains(&table) {
                table_hints.push(table);
            }
        }

        let score = entities.len()
            + 2 * count_keywords(&normalized, AGGREGATION_KEYWORDS).min(1)
            + 2 * count_keywords(&normalized, COMPARISON_KEYWORDS).min(1)
            + 2 * table_hints.len().saturating_sub(1);
        let ambiguous = normalized.is_empty()
            || (intent == Intent::Other && entities.is_empty() && table_hints.is_empty());
        let complexity = if ambiguous {
            Complexity::Simple
        } else {
            Complexity::from_score(score)
        };

        debug!(
            "Analyzed question: intent={} complexity={} entities={} hints={:?}",
            intent,
            complexity.as_str(),
            entities.len(),
            table_hints
        );

        ProcessedQuestion {
            raw,
            normalized,
            entities,
            intent,
            complexity,
            table_hints,
            signals,
            ambiguous,
        }
    }

    /// Known tables named in the question, in order of mention.
    fn detect_tables(&self, normalized: &str) -> Vec<String> {
        let words: Vec<(usize, &str)> = word_offsets(normalized);
        let mut found: Vec<(usize, String)> = Vec::new();

        for table in &self.known_tables {
            let lowered = table.to_lowercase();
            let spaced = lowered.replace('_', " ");
            let position = normalized
                .find(&lowered)
                .or_else(|| if spaced != lowered { normalized.find(&spaced) } else { None })
                .or_else(|| {
                    words
                        .iter()
                        .find(|(_, w)| self.word_matches_table(w, &lowered))
                        .map(|(pos, _)| *pos)
                });
            if let Some(pos) = position {
                found.push((pos, lowered));
            }
        }

        found.sort_by_key(|(pos, _)| *pos);
        found.into_iter().map(|(_, t)| t).collect()
    }

    fn word_matches_table(&self, word: &str, table: &str) -> bool {
        if word.len() < 4 {
            return false;
        }
        let singular = |s: &str| s.trim_end_matches('s').to_string();
        singular(word) == singular(table) || jaro_winkler(word, table) >= self.similarity_threshold
    }
}

fn word_offsets(text: &str) -> Vec<(usize, &str)> {
    let mut words = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        let in_word = c.is_alphanumeric() || c == '_';
        match (in_word, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                words.push((s, &text[s..i]));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        words.push((s, &text[s..]));
    }
    words
}

fn contains_keyword(normalized: &str, keyword: &str) -> bool {
    if keyword.contains(' ') {
        return normalized.contains(keyword);
    }
    normalized
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .any(|w| w == keyword)
}

fn count_keywords(normalized: &str, keywords: &[&str]) -> usize {
    keywords.iter().filter(|k| contains_keyword(normalized, k)).count()
}

/// Highest-scoring intent with at least one keyword hit, `Other` otherwise.
pub fn classify_intent(normalized: &str) -> Intent {
    let mut best = Intent::Other;
    let mut best_score = 0;
    for intent in Intent::SCORED {
        let score: usize = intent
            .keywords()
            .iter()
            .filter(|k| contains_keyword(normalized, k))
            // phrases are more specific than single words
            .map(|k| if k.contains(' ') { 2 } else { 1 })
            .sum();
        if score > best_score {
            best = intent;
            best_score = score;
        }
    }
    best
}

fn detect_signals(normalized: &str, raw: &str) -> QuestionSignals {
    let ranking_limit = RANKING
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<usize>().ok())
        .filter(|n| *n > 0);
    let ascending = ["lowest", "cheapest", "bottom", "worst", "least", "smallest"]
        .iter()
        .any(|k| contains_keyword(normalized, k));
    let latest = ["current", "latest", "now", "today", "most recent"]
        .iter()
        .any(|k| contains_keyword(normalized, k));
    QuestionSignals {
        aggregation: count_keywords(normalized, AGGREGATION_KEYWORDS) > 0,
        comparison: count_keywords(normalized, COMPARISON_KEYWORDS) > 0,
        trend: count_keywords(normalized, TREND_KEYWORDS) > 0,
        ranking_limit,
        ascending,
        latest,
    }
}

fn overlaps(taken: &[(usize, usize)], span: (usize, usize)) -> bool {
    taken.iter().any(|(s, e)| span.0 < *e && *s < span.1)
}

struct EntityCollector<'a> {
    text: &'a str,
    entities: Vec<ExtractedEntity>,
    taken: Vec<(usize, usize)>,
}

impl<'a> EntityCollector<'a> {
    fn push(&mut self, kind: EntityKind, value: String, span: (usize, usize), confidence: f64) -> bool {
        if value.is_empty() || overlaps(&self.taken, span) {
            return false;
        }
        let column_hint = match kind {
            EntityKind::Identifier => identifier_column_hint(&self.text[..span.0]),
            _ => None,
        };
        self.taken.push(span);
        self.entities.push(ExtractedEntity {
            kind,
            value,
            span,
            confidence,
            column_hint,
        });
        true
    }
}

/// Keyword just before an identifier (`UPC code '...'` gives `upc`).
fn identifier_column_hint(prefix: &str) -> Option<String> {
    let tail: String = prefix.chars().rev().take(24).collect::<Vec<_>>().into_iter().rev().collect();
    let lowered = tail.to_lowercase();
    ["upc", "gtin", "ean", "sku", "id"]
        .iter()
        .filter_map(|k| {
            word_offsets(&lowered)
                .into_iter()
                .filter(|(_, w)| w == k)
                .map(|(pos, _)| pos)
                .last()
                .map(|pos| (pos, *k))
        })
        .max_by_key(|(pos, _)| *pos)
        .map(|(_, k)| k.to_string())
}

pub fn extract_entities(text: &str) -> Vec<ExtractedEntity> {
    let mut collector = EntityCollector {
        text,
        entities: Vec::new(),
        taken: Vec::new(),
    };

    // exact patterns
    for m in IDENTIFIER.find_iter(text) {
        collector.push(EntityKind::Identifier, m.as_str().to_string(), (m.start(), m.end()), 0.95);
    }
    for caps in KEYED_IDENTIFIER.captures_iter(text) {
        if let Some(m) = caps.get(1) {
            if m.as_str().chars().any(|c| c.is_ascii_digit()) {
                collector.push(EntityKind::Identifier, m.as_str().to_string(), (m.start(), m.end()), 0.85);
            }
        }
    }
    for caps in ISO_DATE.captures_iter(text) {
        if let Some(m) = caps.get(1) {
            if NaiveDate::parse_from_str(m.as_str(), "%Y-%m-%d").is_ok() {
                collector.push(EntityKind::Date, m.as_str().to_string(), (m.start(), m.end()), 0.95);
            }
        }
    }
    for caps in YEAR.captures_iter(text) {
        if let Some(m) = caps.get(1) {
            collector.push(EntityKind::Date, m.as_str().to_string(), (m.start(), m.end()), 0.7);
        }
    }
    for caps in CURRENCY.captures_iter(text).chain(CURRENCY_WORD.captures_iter(text)) {
        if let (Some(whole), Some(amount)) = (caps.get(0), caps.get(1)) {
            let value = amount.as_str().replace(',', "");
            collector.push(EntityKind::Currency, value, (whole.start(), whole.end()), 0.9);
        }
    }
    for caps in PERCENTAGE.captures_iter(text) {
        if let (Some(whole), Some(amount)) = (caps.get(0), caps.get(1)) {
            collector.push(EntityKind::Percentage, amount.as_str().to_string(), (whole.start(), whole.end()), 0.9);
        }
    }
    for m in NUMBER.find_iter(text) {
        collector.push(EntityKind::Number, m.as_str().to_string(), (m.start(), m.end()), 0.8);
    }

    // heuristic pass
    for caps in QUOTED.captures_iter(text) {
        if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
            let value = m.as_str().trim();
            if !value.is_empty() {
                collector.push(EntityKind::Category, value.to_string(), (m.start(), m.end()), 0.7);
            }
        }
    }
    let first_word = text.len() - text.trim_start().len();
    for m in CAPITALISED.find_iter(text) {
        // sentence case, not a name
        let skip_first = m.start() == first_word;
        if let Some((offset, phrase)) = strip_leading_stopwords(m.as_str(), skip_first) {
            let start = m.start() + offset;
            collector.push(EntityKind::Category, phrase.to_string(), (start, start + phrase.len()), 0.5);
        }
    }

    let mut entities = collector.entities;
    entities.sort_by_key(|e| e.span.0);
    entities
}

fn strip_leading_stopwords(phrase: &str, skip_first: bool) -> Option<(usize, &str)> {
    let mut offset = 0;
    for (idx, (pos, word)) in word_offsets(phrase).into_iter().enumerate() {
        if (skip_first && idx == 0) || STOPWORDS.contains(&word.to_lowercase().as_str()) {
            offset = pos + word.len();
        } else {
            offset = pos;
            break;
        }
    }
    let rest = phrase[offset..].trim_start();
    let offset = phrase.len() - rest.len();
    if rest.is_empty() || STOPWORDS.contains(&rest.to_lowercase().as_str()) {
        None
    } else {
        Some((offset, rest))
    }
}
