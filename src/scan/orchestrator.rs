use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::aggregator::{AnalyzedMessage, AnalyzerResult, DrainFilter, ResultAggregator};
use super::extractor::MessageExtractor;
use super::fingerprint::{Fingerprinter, MessageFingerprint};
use super::router::GroupRouter;
use super::state::{Cursor, GroupState, GroupStats};
use super::{RawMessage, ScanError, UiPosition};
use crate::analyzer::{AnalysisError, Analyzer, StructuredResult};
use crate::scenarios::{ScenarioId, ScenarioRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ScanningHistory,
    Polling,
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
    /// Fatal analysis attempts before a message is committed anyway.
    pub max_fatal_retries: u32,
    pub analyze_timeout: Duration,
    /// New messages analyzed per group per pass; the rest wait for a later pass.
    pub limit: Option<usize>,
    /// Live mode only. 0 disables the baseline.
    pub baseline_scroll_steps: u32,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            max_fatal_retries: 3,
            analyze_timeout: Duration::from_secs(120),
            limit: None,
            baseline_scroll_steps: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PassSummary {
    pub group: String,
    pub pass: u64,
    pub extracted: usize,
    pub emitted: usize,
    pub extraction_failed: bool,
}

/// What a run did at the scheduling level. Per-group counters live in
/// [`ScanOrchestrator::group_stats`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: Uuid,
    pub scanned: Vec<String>,
    /// Groups reported as unknown during this run. Each is reported once per
    /// orchestrator lifetime.
    pub unknown_groups: Vec<String>,
    pub passes: Vec<PassSummary>,
}

impl RunReport {
    fn new(scanned: Vec<String>, unknown_groups: Vec<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            scanned,
            unknown_groups,
            passes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PassMode {
    History { max_scroll_steps: u32 },
    Incremental,
}

/// Everything a single group's pass needs. Cloned into each live loop.
#[derive(Clone)]
struct PassContext {
    extractor: MessageExtractor,
    fingerprinter: Fingerprinter,
    router: GroupRouter,
    analyzer: Arc<dyn Analyzer>,
    settings: ScanSettings,
}

impl PassContext {
    async fn run_pass(
        &self,
        state: &mut GroupState,
        mode: PassMode,
        aggregator: &mut ResultAggregator,
    ) -> PassSummary {
        let group = state.group().to_string();
        state.stats.passes += 1;
        let pass = state.stats.passes;
        aggregator.begin_pass(&group, pass);

        let extraction = match mode {
            PassMode::History { max_scroll_steps } => {
                self.extractor.extract_history(&group, max_scroll_steps).await
            }
            PassMode::Incremental => self.extractor.extract_new(&group, state.cursor).await,
        };
        let extraction = match extraction {
            Ok(extraction) => extraction,
            Err(e) => {
                state.stats.extraction_failures += 1;
                warn!(
                    "Pass {} for '{}' yielded no messages ({} failure(s) so far): {}",
                    pass, group, state.stats.extraction_failures, e
                );
                return PassSummary {
                    group,
                    pass,
                    extracted: 0,
                    emitted: 0,
                    extraction_failed: true,
                };
            }
        };

        let extracted = extraction.messages.len();
        state.stats.extracted += extracted as u64;
        state.stats.skipped_empty += extraction.skipped_empty as u64;
        state.stats.skipped_own += extraction.skipped_own as u64;
        // Anything below this was read by an earlier pass.
        let frontier = state.frontier;
        state.advance_frontier(extraction.next_cursor);

        let mut fresh = Vec::new();
        let mut fingerprints: HashMap<u64, MessageFingerprint> = HashMap::new();
        let mut in_pass: HashSet<MessageFingerprint> = HashSet::new();
        for message in extraction.messages {
            let fingerprint = match self.fingerprinter.fingerprint(&message) {
                Ok(fingerprint) => fingerprint,
                Err(e) => {
                    state.stats.invalid += 1;
                    warn!("Dropping message {} in '{}': {}", message.position, group, e);
                    continue;
                }
            };
            if !state.dedup.is_new(&fingerprint) {
                if matches!(mode, PassMode::Incremental) && !frontier.admits(message.position) {
                    state.stats.rereads += 1;
                } else {
                    state.stats.duplicates += 1;
                }
                continue;
            }
            if !in_pass.insert(fingerprint) {
                state.stats.duplicates += 1;
                continue;
            }
            fingerprints.insert(message.extraction_order, fingerprint);
            fresh.push(message);
        }

        // Lowest position left uncommitted by this pass.
        let mut hold: Option<UiPosition> = None;

        if let Some(limit) = self.settings.limit {
            if fresh.len() > limit {
                let deferred = fresh.split_off(limit);
                state.stats.deferred += deferred.len() as u64;
                hold = deferred.first().map(|m| m.position);
                info!(
                    "'{}': {} new message(s) over the limit of {}, deferring to a later pass",
                    group,
                    deferred.len(),
                    limit
                );
            }
        }

        let partition = GroupRouter::partition(fresh, self.router.bindings());
        for message in &partition.unrouted {
            state.stats.deferred += 1;
            hold = lower(hold, message.position);
            warn!(
                "No scenario bound to '{}'; message {} left unseen",
                group, message.position
            );
        }

        let mut emitted = 0;
        for (scenario, messages) in partition.by_scenario {
            for message in messages {
                let Some(&fingerprint) = fingerprints.get(&message.extraction_order) else {
                    continue;
                };
                let outcome = self.analyze(&scenario, &message).await;
                match &outcome {
                    Ok(_) => {
                        state.commit(fingerprint);
                        state.stats.analyzed += 1;
                    }
                    Err(e) if !e.fatal => {
                        state.commit(fingerprint);
                        state.stats.recoverable_errors += 1;
                        warn!(
                            "Message {} from {} in '{}' recorded with error: {}",
                            message.position, message.sender, group, e
                        );
                    }
                    Err(e) => {
                        state.stats.fatal_errors += 1;
                        let attempts = state.record_fatal_attempt(fingerprint);
                        if attempts >= self.settings.max_fatal_retries {
                            state.commit(fingerprint);
                            state.stats.permanently_failed += 1;
                            error!(
                                "Message {} from {} in '{}' permanently failed after {} attempt(s): {}",
                                message.position, message.sender, group, attempts, e
                            );
                        } else {
                            hold = lower(hold, message.position);
                            warn!(
                                "Message {} in '{}' failed (attempt {}/{}), retrying next pass: {}",
                                message.position,
                                group,
                                attempts,
                                self.settings.max_fatal_retries,
                                e
                            );
                        }
                    }
                }
                let result = AnalyzerResult {
                    scenario: scenario.clone(),
                    outcome,
                };
                if aggregator.ingest(&group, message, result) {
                    emitted += 1;
                }
            }
        }

        state.cursor = match hold {
            Some(position) => Cursor::at(position),
            None => extraction.next_cursor,
        };

        debug!(
            "Pass {} for '{}': {} extracted, {} emitted, cursor {:?}",
            pass,
            group,
            extracted,
            emitted,
            state.cursor.position()
        );

        PassSummary {
            group,
            pass,
            extracted,
            emitted,
            extraction_failed: false,
        }
    }

    async fn analyze(
        &self,
        scenario: &ScenarioId,
        message: &RawMessage,
    ) -> Result<StructuredResult, AnalysisError> {
        let timeout = self.settings.analyze_timeout;
        match tokio::time::timeout(timeout, self.analyzer.analyze(scenario, message)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AnalysisError::recoverable(format!(
                "analysis timed out after {:?}",
                timeout
            ))),
        }
    }

    /// Mark existing history seen without analysing it. Returns how many
    /// messages were committed.
    async fn baseline(&self, state: &mut GroupState, scroll_steps: u32) -> Result<usize, ScanError> {
        let extraction = self
            .extractor
            .extract_history(state.group(), scroll_steps)
            .await?;
        state.stats.skipped_empty += extraction.skipped_empty as u64;
        state.stats.skipped_own += extraction.skipped_own as u64;

        let mut marked = 0;
        for message in &extraction.messages {
            match self.fingerprinter.fingerprint(message) {
                Ok(fingerprint) => {
                    if state.dedup.is_new(&fingerprint) {
                        state.commit(fingerprint);
                        marked += 1;
                    }
                }
                Err(e) => {
                    state.stats.invalid += 1;
                    warn!(
                        "Baseline dropping message {} in '{}': {}",
                        message.position,
                        state.group(),
                        e
                    );
                }
            }
        }
        state.cursor = extraction.next_cursor;
        state.advance_frontier(extraction.next_cursor);
        Ok(marked)
    }

    async fn poll_group(
        self,
        mut state: GroupState,
        mut aggregator: ResultAggregator,
        interval: Duration,
        cancel: CancellationToken,
        sink: mpsc::UnboundedSender<Vec<AnalyzedMessage>>,
    ) -> GroupState {
        let group = state.group().to_string();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let baseline_steps = self.settings.baseline_scroll_steps;
        let mut needs_baseline = baseline_steps > 0 && state.dedup.is_empty();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if needs_baseline {
                match self.baseline(&mut state, baseline_steps).await {
                    Ok(marked) => {
                        info!("'{}': baseline marked {} existing message(s) seen", group, marked);
                        needs_baseline = false;
                    }
                    Err(e) => {
                        state.stats.extraction_failures += 1;
                        warn!("'{}': baseline failed, retrying next tick: {}", group, e);
                        continue;
                    }
                }
            }

            self.run_pass(&mut state, PassMode::Incremental, &mut aggregator)
                .await;
            let results = aggregator.drain();
            if !results.is_empty() && sink.send(results).is_err() {
                warn!("Result sink closed, stopping '{}'", group);
                break;
            }
        }

        debug!("'{}': polling stopped after {} pass(es)", group, state.stats.passes);
        state
    }
}

fn lower(current: Option<UiPosition>, position: UiPosition) -> Option<UiPosition> {
    Some(current.map_or(position, |held| held.min(position)))
}

/// Drives historical backfill and live polling over a set of groups.
pub struct ScanOrchestrator {
    context: PassContext,
    registry: Arc<ScenarioRegistry>,
    aggregator: ResultAggregator,
    states: HashMap<String, GroupState>,
    excluded: BTreeSet<String>,
    phase: Phase,
}

impl ScanOrchestrator {
    /// Fails with `NoScenarios` when the registry is empty.
    pub fn new(
        extractor: MessageExtractor,
        fingerprinter: Fingerprinter,
        registry: Arc<ScenarioRegistry>,
        analyzer: Arc<dyn Analyzer>,
        settings: ScanSettings,
    ) -> Result<Self, ScanError> {
        let router = GroupRouter::new(registry.clone())?;
        Ok(Self {
            context: PassContext {
                extractor,
                fingerprinter,
                router,
                analyzer,
                settings,
            },
            aggregator: ResultAggregator::new(&registry),
            registry,
            states: HashMap::new(),
            excluded: BTreeSet::new(),
            phase: Phase::Idle,
        })
    }

    fn set_phase(&mut self, phase: Phase) {
        debug!("Orchestrator {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// Split `groups` into schedulable ones and newly reported unknown ones.
    /// Groups reported earlier are skipped silently.
    fn schedule(&mut self, groups: &[String]) -> (Vec<String>, Vec<String>) {
        let mut scanned = Vec::new();
        let mut unknown = Vec::new();
        for group in groups {
            if self.excluded.contains(group) || scanned.contains(group) {
                continue;
            }
            match self.context.router.scenario_for(group) {
                Ok(_) => scanned.push(group.clone()),
                Err(e) => {
                    warn!("Skipping group: {}", e);
                    self.excluded.insert(group.clone());
                    unknown.push(group.clone());
                }
            }
        }
        (scanned, unknown)
    }

    /// One historical pass per group, one group after another. Results stay
    /// queued until [`drain_with`](Self::drain_with).
    pub async fn run_history(&mut self, groups: &[String], max_scroll_steps: u32) -> RunReport {
        let (scanned, unknown) = self.schedule(groups);
        let mut report = RunReport::new(scanned, unknown);
        info!(
            "History run {} over {} group(s), up to {} scroll step(s)",
            report.run_id,
            report.scanned.len(),
            max_scroll_steps
        );

        self.set_phase(Phase::ScanningHistory);
        for group in &report.scanned {
            let state = self
                .states
                .entry(group.clone())
                .or_insert_with(|| GroupState::new(group.clone()));
            let summary = self
                .context
                .run_pass(
                    state,
                    PassMode::History { max_scroll_steps },
                    &mut self.aggregator,
                )
                .await;
            if !summary.extraction_failed {
                info!(
                    "'{}' pass {}: {} extracted, {} emitted",
                    summary.group, summary.pass, summary.extracted, summary.emitted
                );
            }
            report.passes.push(summary);
        }
        self.set_phase(Phase::Idle);

        report
    }

    /// Poll every group on its own task until `cancel` fires. Each pass's
    /// results are sent to `sink` as one batch.
    pub async fn run_live(
        &mut self,
        groups: &[String],
        interval: Duration,
        cancel: CancellationToken,
        sink: mpsc::UnboundedSender<Vec<AnalyzedMessage>>,
    ) -> RunReport {
        let (scanned, unknown) = self.schedule(groups);
        let report = RunReport::new(scanned, unknown);
        info!(
            "Live run {} polling {} group(s) every {:?}",
            report.run_id,
            report.scanned.len(),
            interval
        );

        self.set_phase(Phase::Polling);
        let mut handles = Vec::with_capacity(report.scanned.len());
        for group in &report.scanned {
            let state = self
                .states
                .remove(group)
                .unwrap_or_else(|| GroupState::new(group.clone()));
            let task = self.context.clone().poll_group(
                state,
                ResultAggregator::new(&self.registry),
                interval,
                cancel.clone(),
                sink.clone(),
            );
            handles.push((group.clone(), tokio::spawn(task)));
        }
        drop(sink);

        let finished = join_all(
            handles
                .into_iter()
                .map(|(group, handle)| async move { (group, handle.await) }),
        )
        .await;
        for (group, joined) in finished {
            match joined {
                Ok(state) => {
                    self.states.insert(group, state);
                }
                Err(e) => {
                    error!("Polling task for '{}' ended abnormally: {}", group, e);
                }
            }
        }
        self.set_phase(Phase::Idle);

        report
    }

    pub fn drain_with(&mut self, filter: &DrainFilter) -> Vec<AnalyzedMessage> {
        self.aggregator.drain_with(filter)
    }

    pub fn group_stats(&self) -> BTreeMap<String, GroupStats> {
        self.states
            .iter()
            .map(|(group, state)| (group.clone(), state.stats.clone()))
            .collect()
    }

    pub fn seen_len(&self, group: &str) -> usize {
        self.states.get(group).map_or(0, GroupState::seen_len)
    }
}
