use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rayon::prelude::*;
use usage_core::{Fingerprint, OrderKey, RateLookup, ReadCursor, SessionRecord, UsageEvent};
use usage_db::{Db, InputCommit};

use crate::checkpoint::{ResumePlan, is_unchanged, load_resume, resume_cursor};
use crate::context::{ContextState, Step};
use crate::dedupe::{Collapser, validate_history, validate_sequence};
use crate::record::SkipReason;
use crate::registry::{Decider, reconcile};
use crate::strategy::{ReadFrom, StreamStrategy, file_inode};
use crate::types::{IngestError, IngestStats, InputStats, Result};

/// Runtime knobs for one ingest run.
#[derive(Clone)]
pub struct IngestOptions {
    /// Bypass both gates and re-upsert every record.
    pub full_refresh: bool,
    pub workers: usize,
    pub cancel: Option<Arc<AtomicBool>>,
    pub rates: Option<Arc<dyn RateLookup>>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            full_refresh: false,
            workers: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(4),
            cancel: None,
            rates: None,
        }
    }
}

impl std::fmt::Debug for IngestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestOptions")
            .field("full_refresh", &self.full_refresh)
            .field("workers", &self.workers)
            .field("cancel", &self.cancel)
            .field("rates", &self.rates.is_some())
            .finish()
    }
}

impl IngestOptions {
    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

struct Candidate {
    path: PathBuf,
    location: String,
    identity: String,
}

struct InputTask {
    path: PathBuf,
    location: String,
    identity: String,
    fingerprint: Fingerprint,
    inode: Option<u64>,
    /// Where a tail-only read starts; `None` reads the whole input.
    start: Option<ReadCursor>,
    resume: ResumePlan,
}

struct PreparedInput {
    sessions: Vec<SessionRecord>,
    events: Vec<UsageEvent>,
    read_cursor: Option<ReadCursor>,
    stats: InputStats,
}

/// Canonicalizes inputs, reads their identities, and fails every input whose
/// identity shows up at more than one location.
fn collect_candidates(
    strategy: &StreamStrategy,
    locations: Vec<PathBuf>,
    stats: &mut IngestStats,
) -> Result<Vec<Candidate>> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for path in locations {
        let label = path.display().to_string();
        let canonical = match fs::canonicalize(&path) {
            Ok(canonical) => canonical,
            Err(err) => {
                stats.sources_scanned += 1;
                stats.fail(&label, None, &IngestError::io(&label, err));
                continue;
            }
        };
        if !seen.insert(canonical.clone()) {
            continue;
        }
        stats.sources_scanned += 1;
        let location = canonical.display().to_string();
        match strategy.extractor.read_identity(&canonical) {
            Ok(identity) => candidates.push(Candidate {
                path: canonical,
                location,
                identity,
            }),
            Err(err) if err.is_run_fatal() => return Err(err),
            Err(err) => stats.fail(&location, None, &err),
        }
    }

    let mut by_identity: HashMap<&str, Vec<&str>> = HashMap::new();
    for candidate in &candidates {
        by_identity
            .entry(candidate.identity.as_str())
            .or_default()
            .push(candidate.location.as_str());
    }
    let clashing: HashMap<String, String> = by_identity
        .into_iter()
        .filter(|(_, locations)| locations.len() > 1)
        .map(|(identity, locations)| (identity.to_string(), locations.join(", ")))
        .collect();
    if clashing.is_empty() {
        return Ok(candidates);
    }
    let mut kept = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match clashing.get(&candidate.identity) {
            Some(locations) => {
                let err = IngestError::SourceConflict(format!(
                    "{} source {} found at multiple locations: {locations}",
                    strategy.family, candidate.identity
                ));
                stats.fail(&candidate.location, Some(&candidate.identity), &err);
            }
            None => kept.push(candidate),
        }
    }
    Ok(kept)
}

/// Registry reconciliation and both gates. `None` means the input is
/// unchanged since its last successful run.
fn plan_input(
    db: &Db,
    strategy: &StreamStrategy,
    candidate: Candidate,
    decider: &dyn Decider,
    options: &IngestOptions,
) -> Result<Option<InputTask>> {
    let source = reconcile(
        db,
        strategy,
        &candidate.location,
        &candidate.identity,
        decider,
    )?;
    let fingerprint = strategy.extractor.fingerprint(&candidate.path)?;
    if !options.full_refresh && is_unchanged(&source, &fingerprint) {
        tracing::debug!(
            family = %strategy.family,
            location = %candidate.location,
            "input unchanged; skipping"
        );
        return Ok(None);
    }
    let resume = load_resume(db, strategy, &source.identity, options.full_refresh)?;
    let inode = file_inode(&candidate.path);
    let start = if options.full_refresh {
        None
    } else {
        resume_cursor(&source, inode, &fingerprint)
    };
    tracing::debug!(
        family = %strategy.family,
        location = %candidate.location,
        checkpoint = ?resume.gate.checkpoint().map(ToString::to_string),
        byte_offset = start.as_ref().map(|cursor| cursor.byte_offset),
        "planned input"
    );
    Ok(Some(InputTask {
        path: candidate.path,
        location: candidate.location,
        identity: candidate.identity,
        fingerprint,
        inode,
        start,
        resume,
    }))
}

/// Extract, stamp, gate, collapse and validate one input. Nothing here
/// touches the store.
fn process_input(
    strategy: &StreamStrategy,
    task: &InputTask,
    options: &IngestOptions,
) -> Result<PreparedInput> {
    let started = Instant::now();
    let location = task.location.as_str();
    let gate = &task.resume.gate;
    let rates = options.rates.as_deref();

    let mut stats = InputStats::default();
    let mut sessions: BTreeMap<String, SessionRecord> = BTreeMap::new();
    let resumed = task.start.is_some();
    let (mut state, mut current_session) = match &task.start {
        Some(cursor) => (
            ContextState::resume(cursor.context.clone()),
            cursor.session_id.clone(),
        ),
        None => (ContextState::default(), None),
    };
    // A read cursor is only ever recorded after the stream's identity.
    let mut identity_seen = resumed;
    let mut read_cursor = task.start.clone();
    let mut newest: Option<OrderKey> = None;
    let mut collapser = Collapser::new(location, strategy);
    collapser.seed_committed(&task.resume.boundary);

    let from = ReadFrom {
        checkpoint: gate.checkpoint().cloned(),
        cursor: task.start.clone(),
    };
    for item in strategy.extractor.records(&task.path, &from)? {
        let item = item?;
        let (position, end) = (item.position, item.end);
        let (next, step) = state.step(item, strategy.context, location)?;
        state = next;
        match step {
            Step::Identity { position, identity } => {
                if identity.id != task.identity {
                    return Err(IngestError::IdentityMismatch {
                        location: location.to_string(),
                        position,
                        expected: task.identity.clone(),
                        found: identity.id,
                    });
                }
                identity_seen = true;
                if let Some(session) = identity.session {
                    current_session = Some(session.session_id.clone());
                    sessions.insert(session.session_id.clone(), session);
                }
            }
            Step::Skipped(SkipReason::InfoNull) => stats.skipped_info_null += 1,
            Step::Absorbed => {}
            Step::Measurement(mut stamped) => {
                if strategy.identity_in_stream && !identity_seen {
                    return Err(IngestError::MissingIdentity {
                        location: location.to_string(),
                    });
                }
                stats.records_seen += 1;
                let session_id = match stamped.measurement.session.take() {
                    Some(session) => {
                        let id = session.session_id.clone();
                        sessions.insert(id.clone(), session);
                        Some(id)
                    }
                    None => current_session.clone(),
                };
                let event =
                    strategy.build_event(&task.identity, session_id, stamped, location, rates)?;
                if newest.as_ref().is_none_or(|known| event.order > *known) {
                    newest = Some(event.order.clone());
                }
                if gate.admits(&event.order) {
                    collapser.push(event)?;
                } else {
                    stats.skipped_before_checkpoint += 1;
                }
            }
        }
        if let Some(end) = end {
            read_cursor = Some(ReadCursor {
                byte_offset: end,
                line: position,
                inode: task.inode,
                session_id: current_session.clone(),
                context: state.current().clone(),
            });
        }
    }

    // An empty tail read says nothing about the committed prefix.
    if strategy.append_only
        && let Some(checkpoint) = gate.checkpoint()
        && newest
            .as_ref()
            .map_or(!resumed, |newest| newest < checkpoint)
    {
        return Err(IngestError::AppendOnlyViolation {
            location: location.to_string(),
            newest: newest
                .map(|key| key.to_string())
                .unwrap_or_else(|| "none".to_string()),
            checkpoint: checkpoint.to_string(),
        });
    }

    let collapsed = collapser.finish();
    if options.full_refresh {
        validate_history(strategy, location, &task.resume.history, &collapsed.kept)?;
    } else {
        validate_sequence(strategy, location, task.resume.predecessor(), &collapsed.kept)?;
    }
    stats.duplicates_collapsed = collapsed.duplicates;
    stats.records_kept = collapsed.kept.len();
    tracing::debug!(
        family = %strategy.family,
        location,
        records = stats.records_kept,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "parsed input"
    );
    Ok(PreparedInput {
        sessions: sessions.into_values().collect(),
        events: collapsed.kept,
        read_cursor,
        stats,
    })
}

fn commit_input(
    db: &mut Db,
    strategy: &StreamStrategy,
    task: &InputTask,
    prepared: PreparedInput,
    stats: &mut IngestStats,
) -> Result<()> {
    let started = Instant::now();
    let outcome = db.commit_input(InputCommit {
        family: strategy.family,
        source_id: &task.identity,
        sessions: &prepared.sessions,
        events: &prepared.events,
        fingerprint: Some(task.fingerprint),
        read_cursor: prepared.read_cursor.as_ref(),
    })?;
    stats.absorb(&prepared.stats);
    stats.sources_ingested += 1;
    stats.records_inserted += outcome.inserted;
    stats.records_updated += outcome.updated;
    stats.records_unchanged += outcome.unchanged;
    stats.sessions_upserted += outcome.sessions_upserted;
    tracing::info!(
        family = %strategy.family,
        location = %task.location,
        identity = %task.identity,
        records = prepared.stats.records_seen,
        inserted = outcome.inserted,
        updated = outcome.updated,
        db_ms = started.elapsed().as_millis() as u64,
        "ingested input"
    );
    Ok(())
}

/// Runs one family's pipeline over `locations`. Per-input failures are
/// recorded in the returned stats and rolled back; only run-fatal errors
/// come back as `Err`.
pub fn run_pipeline(
    db: &mut Db,
    strategy: &'static StreamStrategy,
    locations: Vec<PathBuf>,
    decider: &dyn Decider,
    options: &IngestOptions,
) -> Result<IngestStats> {
    let mut stats = IngestStats::default();
    let candidates = collect_candidates(strategy, locations, &mut stats)?;
    if candidates.is_empty() {
        return Ok(stats);
    }
    let workers = options.workers.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()?;

    let mut pending = candidates.into_iter().peekable();
    while pending.peek().is_some() {
        let mut tasks = Vec::with_capacity(workers);
        for candidate in pending.by_ref().take(workers) {
            if options.is_cancelled() {
                stats.cancelled = true;
                break;
            }
            let location = candidate.location.clone();
            let identity = candidate.identity.clone();
            match plan_input(db, strategy, candidate, decider, options) {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => stats.sources_skipped_unchanged += 1,
                Err(err) if err.is_run_fatal() => return Err(err),
                Err(err) => stats.fail(&location, Some(&identity), &err),
            }
        }

        let prepared: Vec<(InputTask, Result<PreparedInput>)> = pool.install(|| {
            tasks
                .into_par_iter()
                .map(|task| {
                    let result = process_input(strategy, &task, options);
                    (task, result)
                })
                .collect()
        });

        for (task, result) in prepared {
            if options.is_cancelled() {
                stats.cancelled = true;
                break;
            }
            let outcome =
                result.and_then(|prepared| commit_input(db, strategy, &task, prepared, &mut stats));
            match outcome {
                Ok(()) => {}
                Err(err) if err.is_run_fatal() => return Err(err),
                Err(err) => stats.fail(&task.location, Some(&task.identity), &err),
            }
        }
        if stats.cancelled {
            tracing::warn!(family = %strategy.family, "ingest cancelled");
            break;
        }
    }
    Ok(stats)
}
