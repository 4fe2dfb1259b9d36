use usage_core::UsageContext;

use crate::record::{
    ContextUpdate, Positioned, RawMeasurement, Record, SkipReason, Slot, StreamIdentity,
};
use crate::types::{IngestError, Result};

/// How context flows between records of one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextPolicy {
    /// A measurement without a model in effect fails the input.
    pub require_model: bool,
    /// When false every measurement starts from an empty context and only
    /// its inline attributes apply.
    pub carry_forward: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stamped {
    pub position: u64,
    pub context: UsageContext,
    pub measurement: RawMeasurement,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Identity {
        position: u64,
        identity: StreamIdentity,
    },
    Measurement(Stamped),
    Skipped(SkipReason),
    Absorbed,
}

/// Attributes currently in effect for one logical stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextState {
    current: UsageContext,
}

fn apply_slot(target: &mut Option<String>, slot: Slot<String>) {
    match slot {
        Slot::Keep => {}
        Slot::Set(value) => *target = Some(value),
        Slot::Clear => *target = None,
    }
}

impl ContextState {
    /// State carried over from an earlier read of the same stream.
    pub fn resume(context: UsageContext) -> Self {
        Self { current: context }
    }

    pub fn current(&self) -> &UsageContext {
        &self.current
    }

    pub fn apply(mut self, update: ContextUpdate) -> Self {
        apply_slot(&mut self.current.model, update.model);
        apply_slot(&mut self.current.provider, update.provider);
        apply_slot(&mut self.current.agent, update.agent);
        apply_slot(&mut self.current.mode, update.mode);
        apply_slot(&mut self.current.turn_id, update.turn_id);
        self
    }

    /// Folds one record into the state, stamping measurements with the
    /// context in effect at their position.
    pub fn step(
        self,
        item: Positioned<Record>,
        policy: ContextPolicy,
        location: &str,
    ) -> Result<(Self, Step)> {
        let position = item.position;
        match item.record {
            Record::Identity(identity) => Ok((self, Step::Identity { position, identity })),
            Record::Context(update) => Ok((self.apply(update), Step::Absorbed)),
            Record::Skipped(reason) => Ok((self, Step::Skipped(reason))),
            Record::Measurement(mut measurement) => {
                let inline = std::mem::take(&mut measurement.inline);
                let (next, effective) = if policy.carry_forward {
                    let next = self.apply(inline);
                    let effective = next.current.clone();
                    (next, effective)
                } else {
                    let effective = ContextState::default().apply(inline).current;
                    (self, effective)
                };
                if policy.require_model && effective.model.is_none() {
                    return Err(IngestError::Unattributed {
                        location: location.to_string(),
                        position,
                    });
                }
                Ok((
                    next,
                    Step::Measurement(Stamped {
                        position,
                        context: effective,
                        measurement,
                    }),
                ))
            }
        }
    }
}
