use std::path::Path;

use usage_core::{Family, SourceRow};
use usage_db::Db;

use crate::strategy::StreamStrategy;
use crate::types::{IngestError, Result};

/// A registry transition that needs the caller's consent.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision<'a> {
    Register {
        family: Family,
        location: &'a str,
        identity: &'a str,
    },
    Reactivate {
        source: &'a SourceRow,
    },
    Relocate {
        source: &'a SourceRow,
        new_location: &'a str,
    },
}

impl Decision<'_> {
    pub fn describe(&self) -> String {
        match self {
            Decision::Register {
                family,
                location,
                identity,
            } => format!("register new {family} source {identity} at {location}"),
            Decision::Reactivate { source } => format!(
                "reactivate inactive {} source {} at {}",
                source.family, source.identity, source.location
            ),
            Decision::Relocate {
                source,
                new_location,
            } => format!(
                "move {} source {} from {} to {}",
                source.family, source.identity, source.location, new_location
            ),
        }
    }
}

/// Yes/no capability injected by the caller.
pub trait Decider: Sync {
    fn decide(&self, decision: &Decision<'_>) -> bool;
}

impl<F> Decider for F
where
    F: Fn(&Decision<'_>) -> bool + Sync,
{
    fn decide(&self, decision: &Decision<'_>) -> bool {
        self(decision)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAllow;

impl Decider for AlwaysAllow {
    fn decide(&self, _decision: &Decision<'_>) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysDeny;

impl Decider for AlwaysDeny {
    fn decide(&self, _decision: &Decision<'_>) -> bool {
        false
    }
}

/// Approves first registrations and defers everything else to `inner`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoRegister<D>(pub D);

impl<D: Decider> Decider for AutoRegister<D> {
    fn decide(&self, decision: &Decision<'_>) -> bool {
        match decision {
            Decision::Register { .. } => true,
            other => self.0.decide(other),
        }
    }
}

fn confirm(decider: &dyn Decider, decision: Decision<'_>) -> Result<()> {
    if decider.decide(&decision) {
        Ok(())
    } else {
        Err(IngestError::ConfirmationDeclined(decision.describe()))
    }
}

/// Resolves `identity` found at `location` against the registry, applying
/// at most one confirmed transition. Returns the active source row.
pub fn reconcile(
    db: &Db,
    strategy: &StreamStrategy,
    location: &str,
    identity: &str,
    decider: &dyn Decider,
) -> Result<SourceRow> {
    let family = strategy.family;
    if let Some(occupant) = db.get_source_by_location(family, location)?
        && occupant.active
        && occupant.identity != identity
    {
        return Err(IngestError::SourceConflict(format!(
            "{location} is registered to {family} source {} but now contains {identity}",
            occupant.identity
        )));
    }

    let Some(existing) = db.get_source(family, identity)? else {
        confirm(
            decider,
            Decision::Register {
                family,
                location,
                identity,
            },
        )?;
        let source = db.insert_source(family, identity, location)?;
        tracing::info!(family = %family, location, identity, "registered source");
        return Ok(source);
    };

    let mut source = existing;
    if source.location != location {
        let old = Path::new(&source.location);
        if old.is_file()
            && let Ok(old_identity) = strategy.extractor.read_identity(old)
            && old_identity == identity
        {
            return Err(IngestError::SourceConflict(format!(
                "{family} source {identity} exists at both {} and {location}",
                source.location
            )));
        }
        confirm(
            decider,
            Decision::Relocate {
                source: &source,
                new_location: location,
            },
        )?;
        db.update_source_location(family, identity, location)?;
        tracing::info!(
            family = %family,
            identity,
            from = %source.location,
            to = location,
            "relocated source"
        );
        source.location = location.to_string();
    }
    if !source.active {
        confirm(decider, Decision::Reactivate { source: &source })?;
        db.set_source_active(family, identity, true)?;
        tracing::info!(family = %family, location, identity, "reactivated source");
        source.active = true;
    }
    Ok(source)
}

/// Active sources of one family split by whether their location still exists.
#[derive(Debug, Clone, Default)]
pub struct ActiveSelection {
    pub present: Vec<SourceRow>,
    pub missing: Vec<SourceRow>,
    pub deactivated: usize,
}

pub fn select_active_sources(
    db: &mut Db,
    family: Family,
    auto_deactivate: bool,
) -> Result<ActiveSelection> {
    let mut selection = ActiveSelection::default();
    for source in db.list_active_sources(family)? {
        if Path::new(&source.location).exists() {
            selection.present.push(source);
        } else {
            tracing::warn!(
                family = %family,
                location = %source.location,
                identity = %source.identity,
                "active source location is missing"
            );
            selection.missing.push(source);
        }
    }
    if auto_deactivate && !selection.missing.is_empty() {
        let identities: Vec<String> = selection
            .missing
            .iter()
            .map(|source| source.identity.clone())
            .collect();
        selection.deactivated = db.deactivate_sources(family, &identities)?;
    }
    Ok(selection)
}
