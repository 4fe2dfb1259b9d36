use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upstream log family a source belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Codex,
    Gemini,
    OpenCode,
}

impl Family {
    pub const ALL: [Family; 3] = [Family::Codex, Family::Gemini, Family::OpenCode];

    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Codex => "codex",
            Family::Gemini => "gemini",
            Family::OpenCode => "opencode",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "codex" => Some(Family::Codex),
            "gemini" => Some(Family::Gemini),
            "opencode" => Some(Family::OpenCode),
            _ => None,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenField {
    Input,
    CachedInput,
    CacheWrite,
    Output,
    Reasoning,
    Total,
}

impl TokenField {
    pub fn name(&self) -> &'static str {
        match self {
            TokenField::Input => "input_tokens",
            TokenField::CachedInput => "cached_input_tokens",
            TokenField::CacheWrite => "cache_write_tokens",
            TokenField::Output => "output_tokens",
            TokenField::Reasoning => "reasoning_tokens",
            TokenField::Total => "total_tokens",
        }
    }
}

/// Token counts for one measurement. `total_tokens` is optional because not
/// every family reports it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounters {
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub cache_write_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
    pub total_tokens: Option<u64>,
}

impl TokenCounters {
    pub fn get(&self, field: TokenField) -> Option<u64> {
        match field {
            TokenField::Input => Some(self.input_tokens),
            TokenField::CachedInput => Some(self.cached_input_tokens),
            TokenField::CacheWrite => Some(self.cache_write_tokens),
            TokenField::Output => Some(self.output_tokens),
            TokenField::Reasoning => Some(self.reasoning_tokens),
            TokenField::Total => self.total_tokens,
        }
    }
}

/// Tie-breaker half of an ordering key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Int(i64),
    Text(String),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Int(value) => write!(f, "{value}"),
            KeyPart::Text(value) => f.write_str(value),
        }
    }
}

/// Processing order of a measurement within its logical stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderKey {
    pub ts: DateTime<Utc>,
    pub tiebreak: KeyPart,
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ts
            .cmp(&other.ts)
            .then_with(|| self.tiebreak.cmp(&other.tiebreak))
    }
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ts.to_rfc3339(), self.tiebreak)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size_bytes: u64,
    pub mtime: DateTime<Utc>,
}

/// A tracked input stream. `identity` is durable, `location` is only a hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    pub family: Family,
    pub identity: String,
    pub location: String,
    pub active: bool,
    pub fingerprint: Option<Fingerprint>,
    pub cursor: Option<OrderKey>,
    pub read_cursor: Option<ReadCursor>,
    pub created_at: String,
    pub updated_at: String,
}

/// Where a tail-only read of an append-only log picks up: the byte offset
/// just past the last consumed record, its line number, and the stream
/// state in effect at that point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadCursor {
    pub byte_offset: u64,
    pub line: u64,
    /// Inode of the file the offset belongs to, where the platform has one.
    pub inode: Option<u64>,
    pub session_id: Option<String>,
    pub context: UsageContext,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub directory: Option<String>,
    pub title: Option<String>,
    pub project_id: Option<String>,
    pub project_worktree: Option<String>,
    pub version: Option<String>,
}

/// Attributes in effect when a measurement was taken.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageContext {
    pub model: Option<String>,
    pub provider: Option<String>,
    pub agent: Option<String>,
    pub mode: Option<String>,
    pub turn_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub family: Family,
    pub source_id: String,
    pub dedup_key: String,
    pub order: OrderKey,
    pub position: u64,
    pub event_ts: DateTime<Utc>,
    pub session_id: Option<String>,
    pub context: UsageContext,
    pub usage: TokenCounters,
    pub cumulative: Option<TokenCounters>,
    pub cost_usd: Option<f64>,
    pub completed_at: Option<DateTime<Utc>>,
    pub finish_reason: Option<String>,
}

impl UsageEvent {
    /// Whether two events sharing a dedup key report the same measurement.
    /// A cumulative snapshot, when present, is the measurement; the
    /// incremental counters of a re-emitted snapshot are not compared.
    /// With `with_model` the attributed model must match as well.
    pub fn same_payload(&self, other: &UsageEvent, with_model: bool) -> bool {
        let counters = match (&self.cumulative, &other.cumulative) {
            (Some(mine), Some(theirs)) => mine == theirs,
            (None, None) => self.usage == other.usage,
            _ => false,
        };
        counters && (!with_model || self.context.model == other.context.model)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenClass {
    Input,
    CachedInput,
    CacheWrite,
    Output,
}

/// Rate source for derived costs, in USD per million tokens.
pub trait RateLookup: Send + Sync {
    fn rate_per_1m(&self, model: &str, provider: Option<&str>, class: TokenClass) -> Option<f64>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRule {
    pub model_pattern: String,
    #[serde(default)]
    pub provider: Option<String>,
    pub input_per_1m: f64,
    pub cached_input_per_1m: f64,
    #[serde(default)]
    pub cache_write_per_1m: Option<f64>,
    pub output_per_1m: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    pub rules: Vec<PricingRule>,
}

impl PricingTable {
    pub fn new(rules: Vec<PricingRule>) -> Self {
        Self { rules }
    }

    fn rule_for(&self, model: &str, provider: Option<&str>) -> Option<&PricingRule> {
        self.rules.iter().find(|rule| {
            let provider_ok = match (&rule.provider, provider) {
                (None, _) => true,
                (Some(expected), Some(actual)) => expected.eq_ignore_ascii_case(actual),
                (Some(_), None) => false,
            };
            provider_ok && model_matches_pattern(model, &rule.model_pattern)
        })
    }
}

impl RateLookup for PricingTable {
    fn rate_per_1m(&self, model: &str, provider: Option<&str>, class: TokenClass) -> Option<f64> {
        let rule = self.rule_for(model, provider)?;
        match class {
            TokenClass::Input => Some(rule.input_per_1m),
            TokenClass::CachedInput => Some(rule.cached_input_per_1m),
            TokenClass::CacheWrite => rule.cache_write_per_1m,
            TokenClass::Output => Some(rule.output_per_1m),
        }
    }
}

pub fn model_matches_pattern(model: &str, pattern: &str) -> bool {
    let model = model.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return model == pattern;
    }
    let mut remainder = model.as_str();
    let mut first = true;
    for part in pattern.split('*') {
        if part.is_empty() {
            first = false;
            continue;
        }
        match remainder.find(part) {
            Some(index) if !(first && index != 0) => {
                remainder = &remainder[index + part.len()..];
                first = false;
            }
            _ => return false,
        }
    }
    pattern.ends_with('*') || remainder.is_empty()
}

/// Cost of one measurement, or `None` when any billed class has no rate.
pub fn estimate_cost(
    rates: &dyn RateLookup,
    model: &str,
    provider: Option<&str>,
    usage: &TokenCounters,
) -> Option<f64> {
    let non_cached_input = usage.input_tokens.saturating_sub(usage.cached_input_tokens);
    // Reasoning tokens are billed as part of output.
    let classes = [
        (TokenClass::Input, non_cached_input),
        (TokenClass::CachedInput, usage.cached_input_tokens),
        (TokenClass::CacheWrite, usage.cache_write_tokens),
        (TokenClass::Output, usage.output_tokens),
    ];
    let mut total = 0.0;
    for (class, tokens) in classes {
        if tokens == 0 {
            continue;
        }
        let rate = rates.rate_per_1m(model, provider, class)?;
        total += (tokens as f64 / 1_000_000.0) * rate;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PricingTable {
        PricingTable::new(vec![
            PricingRule {
                model_pattern: "gpt-5*".to_string(),
                provider: None,
                input_per_1m: 1.0,
                cached_input_per_1m: 0.1,
                cache_write_per_1m: None,
                output_per_1m: 10.0,
            },
            PricingRule {
                model_pattern: "claude-*".to_string(),
                provider: Some("anthropic".to_string()),
                input_per_1m: 3.0,
                cached_input_per_1m: 0.3,
                cache_write_per_1m: Some(3.75),
                output_per_1m: 15.0,
            },
        ])
    }

    #[test]
    fn cost_does_not_double_count_reasoning() {
        let usage = TokenCounters {
            input_tokens: 1_000_000,
            cached_input_tokens: 200_000,
            output_tokens: 1_000_000,
            reasoning_tokens: 400_000,
            ..TokenCounters::default()
        };
        let cost = estimate_cost(&table(), "gpt-5.2-codex", None, &usage).expect("cost");
        let expected = 0.8 + 0.02 + 10.0;
        assert!((cost - expected).abs() < 1e-9);
    }

    #[test]
    fn cost_is_unknown_without_a_rate() {
        let usage = TokenCounters {
            input_tokens: 10,
            ..TokenCounters::default()
        };
        assert_eq!(estimate_cost(&table(), "gemini-2.5-pro", None, &usage), None);
    }

    #[test]
    fn cost_is_unknown_when_a_billed_class_has_no_rate() {
        let usage = TokenCounters {
            input_tokens: 10,
            cache_write_tokens: 5,
            ..TokenCounters::default()
        };
        assert_eq!(estimate_cost(&table(), "gpt-5", None, &usage), None);
        assert!(estimate_cost(&table(), "claude-sonnet-4", Some("Anthropic"), &usage).is_some());
    }

    #[test]
    fn provider_scoped_rules_need_a_provider() {
        let rates = table();
        assert_eq!(
            rates.rate_per_1m("claude-sonnet-4", None, TokenClass::Input),
            None
        );
        assert_eq!(
            rates.rate_per_1m("claude-sonnet-4", Some("anthropic"), TokenClass::Input),
            Some(3.0)
        );
    }

    #[test]
    fn pattern_matching_handles_wildcards() {
        assert!(model_matches_pattern("gpt-5.2-codex", "gpt-5*"));
        assert!(model_matches_pattern("GPT-5", "gpt-5"));
        assert!(model_matches_pattern("o3-mini-high", "*mini*"));
        assert!(!model_matches_pattern("gpt-4o", "gpt-5*"));
        assert!(!model_matches_pattern("my-gpt-5", "gpt-5*"));
        assert!(model_matches_pattern("anything", "*"));
    }

    #[test]
    fn order_keys_sort_by_timestamp_then_tiebreak() {
        let ts = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let later = ts + chrono::Duration::milliseconds(1);
        let a = OrderKey {
            ts,
            tiebreak: KeyPart::Int(250),
        };
        let b = OrderKey {
            ts,
            tiebreak: KeyPart::Int(1000),
        };
        let c = OrderKey {
            ts: later,
            tiebreak: KeyPart::Int(5),
        };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn family_round_trips_through_names() {
        for family in Family::ALL {
            assert_eq!(Family::parse(family.as_str()), Some(family));
        }
        assert_eq!(Family::parse("OpenCode"), Some(Family::OpenCode));
        assert_eq!(Family::parse("claude"), None);
    }

    fn snapshot_event(total: u64, last: u64, model: &str) -> UsageEvent {
        let counters = |value: u64| TokenCounters {
            input_tokens: value,
            total_tokens: Some(value),
            ..TokenCounters::default()
        };
        let ts = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        UsageEvent {
            family: Family::Codex,
            source_id: "s".to_string(),
            dedup_key: total.to_string(),
            order: OrderKey {
                ts,
                tiebreak: KeyPart::Int(total as i64),
            },
            position: 1,
            event_ts: ts,
            session_id: None,
            context: UsageContext {
                model: Some(model.to_string()),
                ..UsageContext::default()
            },
            usage: counters(last),
            cumulative: Some(counters(total)),
            cost_usd: None,
            completed_at: None,
            finish_reason: None,
        }
    }

    #[test]
    fn payload_comparison_follows_the_cumulative_snapshot() {
        let first = snapshot_event(250, 150, "m1");
        assert!(first.same_payload(&snapshot_event(250, 0, "m1"), true));
        assert!(!first.same_payload(&snapshot_event(250, 0, "m2"), true));
        assert!(first.same_payload(&snapshot_event(250, 0, "m2"), false));

        let mut split = snapshot_event(250, 150, "m1");
        if let Some(cumulative) = split.cumulative.as_mut() {
            cumulative.input_tokens = 200;
            cumulative.output_tokens = 50;
        }
        assert!(!first.same_payload(&split, true));

        let mut plain = snapshot_event(250, 150, "m1");
        plain.cumulative = None;
        let mut other = plain.clone();
        assert!(plain.same_payload(&other, true));
        other.usage.output_tokens = 1;
        assert!(!plain.same_payload(&other, true));
    }
}
