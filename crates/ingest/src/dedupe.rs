use std::collections::{BTreeMap, HashMap};

use usage_core::UsageEvent;

use crate::strategy::{StreamStrategy, UpsertPolicy};
use crate::types::{IngestError, Result};

struct Seen {
    event: UsageEvent,
    committed: bool,
}

/// Keep-first collapse by dedup key with payload conflict detection.
pub struct Collapser<'a> {
    location: &'a str,
    upsert: UpsertPolicy,
    compare_model: bool,
    seen: HashMap<String, Seen>,
    kept: Vec<UsageEvent>,
    duplicates: usize,
}

#[derive(Debug, Default)]
pub struct Collapsed {
    pub kept: Vec<UsageEvent>,
    pub duplicates: usize,
}

impl<'a> Collapser<'a> {
    pub fn new(location: &'a str, strategy: &StreamStrategy) -> Self {
        Self {
            location,
            upsert: strategy.upsert,
            compare_model: strategy.context.require_model,
            seen: HashMap::new(),
            kept: Vec::new(),
            duplicates: 0,
        }
    }

    /// Registers already-committed events so that re-admitted boundary
    /// records are compared against them instead of re-emitted.
    pub fn seed_committed(&mut self, events: &[UsageEvent]) {
        for event in events {
            self.seen.insert(
                event.dedup_key.clone(),
                Seen {
                    event: event.clone(),
                    committed: true,
                },
            );
        }
    }

    pub fn push(&mut self, event: UsageEvent) -> Result<()> {
        match self.seen.get_mut(&event.dedup_key) {
            None => {
                self.seen.insert(
                    event.dedup_key.clone(),
                    Seen {
                        event: event.clone(),
                        committed: false,
                    },
                );
                self.kept.push(event);
                Ok(())
            }
            Some(seen) if seen.event.same_payload(&event, self.compare_model) => {
                self.duplicates += 1;
                Ok(())
            }
            Some(seen) if seen.committed && self.upsert == UpsertPolicy::LatestWins => {
                seen.event = event.clone();
                seen.committed = false;
                self.kept.push(event);
                Ok(())
            }
            Some(seen) => Err(IngestError::DuplicateConflict {
                location: self.location.to_string(),
                key: event.dedup_key,
                first: seen.event.position,
                second: event.position,
            }),
        }
    }

    pub fn finish(self) -> Collapsed {
        Collapsed {
            kept: self.kept,
            duplicates: self.duplicates,
        }
    }
}

fn cumulative_total(event: &UsageEvent) -> u64 {
    event
        .cumulative
        .and_then(|cumulative| cumulative.total_tokens)
        .unwrap_or(0)
}

/// Checks a collapsed sequence in stream order. `predecessor` is the last
/// committed event before the sequence, if any.
pub fn validate_sequence(
    strategy: &StreamStrategy,
    location: &str,
    predecessor: Option<&UsageEvent>,
    events: &[UsageEvent],
) -> Result<()> {
    if !strategy.is_monotonic() && strategy.delta_fields.is_empty() {
        return Ok(());
    }
    let mut previous = predecessor;
    for current in events {
        let Some(prev) = previous else {
            previous = Some(current);
            continue;
        };
        if strategy.is_monotonic() && cumulative_total(current) <= cumulative_total(prev) {
            return Err(IngestError::NonMonotonic {
                location: location.to_string(),
                position: current.position,
                previous_position: prev.position,
                previous: cumulative_total(prev),
                current: cumulative_total(current),
            });
        }
        if let (Some(prev_cum), Some(cur_cum)) = (prev.cumulative, current.cumulative) {
            for field in strategy.delta_fields {
                let (Some(before), Some(after), Some(step)) = (
                    prev_cum.get(*field),
                    cur_cum.get(*field),
                    current.usage.get(*field),
                ) else {
                    continue;
                };
                let delta = after as i128 - before as i128;
                if delta != step as i128 {
                    return Err(IngestError::DeltaMismatch {
                        location: location.to_string(),
                        position: current.position,
                        previous_position: prev.position,
                        field: field.name(),
                        expected: delta,
                        actual: step,
                    });
                }
            }
        }
        previous = Some(current);
    }
    Ok(())
}

/// Re-validates the whole committed history with `batch` applied on top of
/// it. Batch rows replace committed rows that share their dedup key.
pub fn validate_history(
    strategy: &StreamStrategy,
    location: &str,
    committed: &[UsageEvent],
    batch: &[UsageEvent],
) -> Result<()> {
    if !strategy.is_monotonic() {
        return Ok(());
    }
    let mut merged: BTreeMap<&str, &UsageEvent> = committed
        .iter()
        .map(|event| (event.dedup_key.as_str(), event))
        .collect();
    for event in batch {
        merged.insert(event.dedup_key.as_str(), event);
    }
    let mut ordered: Vec<UsageEvent> = merged.into_values().cloned().collect();
    ordered.sort_by(|a, b| a.order.cmp(&b.order));
    validate_sequence(strategy, location, None, &ordered)
}
