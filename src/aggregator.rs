//! Dual evaluation aggregator.
//!
//! Tracks exactly one current position and merges tablebase and engine results for it.
//! The position key is the cancellation token: every provider callback is applied with
//! `send_if_modified` only when it is tagged with the current key, so late results for
//! an earlier position are dropped regardless of arrival order.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{broadcast::error::RecvError, watch},
    task::JoinHandle,
};

use crate::chess::PositionKey;
use crate::config::TablebaseConfig;
use crate::engine::EngineAnalysisService;
use crate::evaluation::{EngineEvaluation, TablebaseMove, TablebaseResult};
use crate::tablebase::{LookupResult, TablebaseService};

// =============================================================================
// Evaluation snapshots
// =============================================================================

/// Tablebase side of an evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum TablebaseState {
    /// Not yet available.
    Pending,
    Found { result: TablebaseResult },
    /// The tablebase has no entry for this position.
    NoEntry,
    /// The lookup failed or timed out.
    Failed { error: String },
}

impl TablebaseState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, TablebaseState::Pending)
    }
}

impl From<Option<TablebaseResult>> for TablebaseState {
    fn from(result: Option<TablebaseResult>) -> Self {
        match result {
            Some(result) => TablebaseState::Found { result },
            None => TablebaseState::NoEntry,
        }
    }
}

/// Everything known about one position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedEvaluation {
    pub position: PositionKey,
    pub tablebase: TablebaseState,
    pub engine: Option<EngineEvaluation>,
}

/// The value to show for a position, tablebase first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationView<'a> {
    Tablebase(&'a TablebaseResult),
    Engine(&'a EngineEvaluation),
    Pending,
    Unavailable,
}

impl AggregatedEvaluation {
    pub fn pending(position: PositionKey) -> Self {
        Self {
            position,
            tablebase: TablebaseState::Pending,
            engine: None,
        }
    }

    pub fn tablebase_result(&self) -> Option<&TablebaseResult> {
        match &self.tablebase {
            TablebaseState::Found { result } => Some(result),
            _ => None,
        }
    }

    /// Whether the tablebase side ended in an error.
    pub fn has_error(&self) -> bool {
        matches!(self.tablebase, TablebaseState::Failed { .. })
    }

    pub fn best(&self) -> EvaluationView<'_> {
        match (&self.tablebase, &self.engine) {
            (TablebaseState::Found { result }, _) => EvaluationView::Tablebase(result),
            (_, Some(engine)) => EvaluationView::Engine(engine),
            (TablebaseState::Pending, None) => EvaluationView::Pending,
            (_, None) => EvaluationView::Unavailable,
        }
    }
}

// =============================================================================
// Aggregator
// =============================================================================

struct Shared {
    tablebase: Arc<dyn TablebaseService>,
    config: TablebaseConfig,
    current: watch::Sender<Option<AggregatedEvaluation>>,
    tablebase_cache: DashMap<PositionKey, Option<TablebaseResult>>,
    engine_cache: DashMap<PositionKey, EngineEvaluation>,
}

impl Shared {
    fn is_current(&self, position: &PositionKey) -> bool {
        self.current
            .borrow()
            .as_ref()
            .is_some_and(|current| current.position == *position)
    }

    /// Apply `update` to the snapshot if it still belongs to `position`.
    fn update_if_current(
        &self,
        position: &PositionKey,
        update: impl FnOnce(&mut AggregatedEvaluation),
    ) -> bool {
        let applied = self.current.send_if_modified(|current| match current {
            Some(current) if current.position == *position => {
                update(current);
                true
            }
            _ => false,
        });
        if !applied {
            trace!("Dropped stale result for {}", position);
        }
        applied
    }

    fn cached_tablebase(&self, position: &PositionKey) -> Option<Option<TablebaseResult>> {
        self.tablebase_cache.get(position).map(|entry| entry.clone())
    }

    fn remember_tablebase(&self, position: &PositionKey, result: Option<TablebaseResult>) {
        bounded_insert(&self.tablebase_cache, self.config.cache_capacity, position, result);
    }

    fn remember_engine(&self, evaluation: EngineEvaluation) {
        let position = evaluation.position.clone();
        bounded_insert(&self.engine_cache, self.config.cache_capacity, &position, evaluation);
    }

    async fn fetch_with_retry(self: Arc<Self>, position: PositionKey) {
        let mut attempt = 0;
        loop {
            match self.tablebase.lookup(&position).await {
                Ok(result) => {
                    self.remember_tablebase(&position, result.clone());
                    self.update_if_current(&position, |current| current.tablebase = result.into());
                    return;
                }
                Err(e) => {
                    warn!("Tablebase lookup for {} failed: {}", position, e);
                    let error = e.to_string();
                    if !self.update_if_current(&position, |current| {
                        current.tablebase = TablebaseState::Failed { error }
                    }) {
                        return;
                    }
                }
            }

            if attempt >= self.config.max_background_retries {
                debug!("Giving up on tablebase lookup for {}", position);
                return;
            }
            tokio::time::sleep(self.config.retry_delay(attempt)).await;
            attempt += 1;

            if !self.is_current(&position) {
                debug!("Abandoning retry for {}: position changed", position);
                return;
            }
            debug!("Retrying tablebase lookup for {} (attempt {})", position, attempt);
        }
    }
}

/// Merges tablebase and engine results for the current position.
pub struct EvaluationAggregator {
    shared: Arc<Shared>,
    engine: Option<Arc<dyn EngineAnalysisService>>,
    listener: Option<JoinHandle<()>>,
}

impl EvaluationAggregator {
    /// Must be called inside a tokio runtime when an engine is given.
    pub fn new(
        tablebase: Arc<dyn TablebaseService>,
        engine: Option<Arc<dyn EngineAnalysisService>>,
        config: TablebaseConfig,
    ) -> Self {
        let (current, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            tablebase,
            config,
            current,
            tablebase_cache: DashMap::new(),
            engine_cache: DashMap::new(),
        });

        let listener = engine
            .as_ref()
            .map(|engine| tokio::spawn(listen_to_engine(shared.clone(), engine.subscribe())));

        Self {
            shared,
            engine,
            listener,
        }
    }

    /// Make `position` the one active position.
    ///
    /// Earlier in-flight tablebase work is orphaned and the engine is moved to the new
    /// position. Cached results are used immediately.
    pub async fn set_position(&self, position: PositionKey) {
        let cached = self.shared.cached_tablebase(&position);
        let engine = self.shared.engine_cache.get(&position).map(|e| e.clone());
        let needs_fetch = cached.is_none();

        debug!("Current position: {}", position);
        let mut snapshot = AggregatedEvaluation::pending(position.clone());
        if let Some(cached) = cached {
            snapshot.tablebase = cached.into();
        }
        snapshot.engine = engine;
        self.shared.current.send_replace(Some(snapshot));

        if needs_fetch {
            tokio::spawn(self.shared.clone().fetch_with_retry(position.clone()));
        }

        if let Some(engine) = &self.engine {
            if let Err(e) = engine.analyze(position).await {
                warn!("Engine analysis request failed: {}", e);
            }
        }
    }

    pub fn current_position(&self) -> Option<PositionKey> {
        self.shared.current.borrow().as_ref().map(|e| e.position.clone())
    }

    pub fn current(&self) -> Option<AggregatedEvaluation> {
        self.shared.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<AggregatedEvaluation>> {
        self.shared.current.subscribe()
    }

    /// Forget engine evaluations, e.g. when a new session starts.
    pub fn clear_engine_cache(&self) {
        self.shared.engine_cache.clear();
    }

    /// Latest engine evaluation seen for `position`, if any.
    pub fn engine_evaluation(&self, position: &PositionKey) -> Option<EngineEvaluation> {
        self.shared.engine_cache.get(position).map(|e| e.clone())
    }

    /// Settled evaluation of `position`, waiting at most `timeout` for the tablebase.
    ///
    /// Serves the cache first. For the current position it waits on the in-flight
    /// fetch; any other position gets one timed lookup. Never fails: timeouts and
    /// provider errors come back as [`TablebaseState::Failed`].
    pub async fn evaluate(
        &self,
        position: &PositionKey,
        timeout: Duration,
    ) -> AggregatedEvaluation {
        if let Some(cached) = self.shared.cached_tablebase(position) {
            return AggregatedEvaluation {
                position: position.clone(),
                tablebase: cached.into(),
                engine: self.engine_evaluation(position),
            };
        }

        if self.shared.is_current(position) {
            let waited = tokio::time::timeout(timeout, async {
                let mut receiver = self.shared.current.subscribe();
                receiver
                    .wait_for(|current| match current {
                        Some(current) if current.position == *position => {
                            current.tablebase.is_settled()
                        }
                        _ => true,
                    })
                    .await
                    .ok()
                    .and_then(|snapshot| {
                        snapshot.as_ref().filter(|e| e.position == *position).cloned()
                    })
            })
            .await;

            match waited {
                Ok(Some(evaluation)) => return evaluation,
                // Position changed while waiting; look it up directly.
                Ok(None) => {}
                Err(_) => return self.timed_out(position, timeout),
            }
        }

        match tokio::time::timeout(timeout, self.shared.tablebase.lookup(position)).await {
            Ok(Ok(result)) => {
                self.shared.remember_tablebase(position, result.clone());
                AggregatedEvaluation {
                    position: position.clone(),
                    tablebase: result.into(),
                    engine: self.engine_evaluation(position),
                }
            }
            Ok(Err(e)) => {
                warn!("Tablebase lookup for {} failed: {}", position, e);
                AggregatedEvaluation {
                    position: position.clone(),
                    tablebase: TablebaseState::Failed { error: e.to_string() },
                    engine: self.engine_evaluation(position),
                }
            }
            Err(_) => self.timed_out(position, timeout),
        }
    }

    /// Best `n` moves for the side to move, served from the cache when possible.
    pub async fn top_moves(
        &self,
        position: &PositionKey,
        n: usize,
    ) -> LookupResult<Vec<TablebaseMove>> {
        if let Some(cached) = self.shared.cached_tablebase(position) {
            return Ok(cached
                .map(|result| result.moves.into_iter().take(n).collect())
                .unwrap_or_default());
        }
        self.shared.tablebase.top_moves(position, n).await
    }

    fn timed_out(&self, position: &PositionKey, timeout: Duration) -> AggregatedEvaluation {
        warn!("Tablebase evaluation of {} timed out after {:?}", position, timeout);
        AggregatedEvaluation {
            position: position.clone(),
            tablebase: TablebaseState::Failed {
                error: format!("timed out after {} ms", timeout.as_millis()),
            },
            engine: self.engine_evaluation(position),
        }
    }
}

impl Drop for EvaluationAggregator {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

/// Insert into a cache holding at most `capacity` positions. A full cache is emptied
/// before the new entry goes in.
fn bounded_insert<V>(
    cache: &DashMap<PositionKey, V>,
    capacity: usize,
    position: &PositionKey,
    value: V,
) {
    if cache.len() >= capacity.max(1) && !cache.contains_key(position) {
        debug!("Cache full at {} positions, clearing", cache.len());
        cache.clear();
    }
    cache.insert(position.clone(), value);
}

async fn listen_to_engine(
    shared: Arc<Shared>,
    mut evaluations: tokio::sync::broadcast::Receiver<EngineEvaluation>,
) {
    info!("Listening for engine evaluations");
    loop {
        match evaluations.recv().await {
            Ok(evaluation) => {
                let position = evaluation.position.clone();
                shared.remember_engine(evaluation.clone());
                shared.update_if_current(&position, |current| current.engine = Some(evaluation));
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!("Skipped {} engine evaluations", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Engine evaluation stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::Wdl;
    use crate::test_support::*;

    fn fast_retries() -> TablebaseConfig {
        TablebaseConfig {
            retry_base_delay_ms: 10,
            ..TablebaseConfig::default()
        }
    }

    async fn wait_until(
        aggregator: &EvaluationAggregator,
        predicate: impl FnMut(&Option<AggregatedEvaluation>) -> bool,
    ) -> AggregatedEvaluation {
        let mut receiver = aggregator.subscribe();
        let snapshot = tokio::time::timeout(Duration::from_secs(2), receiver.wait_for(predicate))
            .await
            .expect("condition not reached")
            .unwrap()
            .clone();
        snapshot.unwrap()
    }

    #[tokio::test]
    async fn test_stale_results_are_dropped() {
        let tablebase = Arc::new(kpk_tablebase());
        tablebase.delay(KPK_START, Duration::from_millis(150));
        let engine = Arc::new(FakeEngine::new());
        let aggregator =
            EvaluationAggregator::new(tablebase.clone(), Some(engine.clone()), fast_retries());

        let p1 = key(KPK_START);
        let p2 = key(KPK_AFTER_KD6);
        aggregator.set_position(p1.clone()).await;
        aggregator.set_position(p2.clone()).await;
        assert_eq!(engine.analyzed(), vec![p1.clone(), p2.clone()]);

        // Engine output for P1 arrives after P2 became current, then P2's own.
        engine.emit(engine_eval(&p1, 480, None));
        engine.emit(engine_eval(&p2, -470, None));
        let current =
            wait_until(&aggregator, |c| c.as_ref().is_some_and(|c| c.engine.is_some())).await;
        assert_eq!(current.position, p2);
        assert_eq!(current.engine.unwrap().score_centipawns, -470);

        // P1's slow tablebase answer lands after P2 was set.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let current = aggregator.current().unwrap();
        assert_eq!(current.position, p2);
        assert_eq!(current.tablebase_result().unwrap().wdl, Wdl::LOSS);
        // Stale engine output is still cached under its own position.
        assert!(aggregator.engine_evaluation(&p1).is_some());
    }

    #[tokio::test]
    async fn test_no_entry_is_unavailable() {
        let tablebase = Arc::new(FakeTablebase::new());
        let aggregator = EvaluationAggregator::new(tablebase, None, fast_retries());
        let position = key(KPK_START);

        aggregator.set_position(position.clone()).await;
        let evaluation = aggregator.evaluate(&position, Duration::from_secs(1)).await;
        assert_eq!(evaluation.tablebase, TablebaseState::NoEntry);
        assert_eq!(evaluation.best(), EvaluationView::Unavailable);
    }

    #[tokio::test]
    async fn test_failure_keeps_engine_value() {
        let tablebase = Arc::new(kpk_tablebase());
        tablebase.set_failing(true);
        let engine = Arc::new(FakeEngine::new());
        let aggregator = EvaluationAggregator::new(tablebase, Some(engine.clone()), fast_retries());
        let position = key(KPK_START);

        aggregator.set_position(position.clone()).await;
        engine.emit(engine_eval(&position, 650, None));

        let current = wait_until(&aggregator, |c| {
            c.as_ref().is_some_and(|c| c.engine.is_some() && c.has_error())
        })
        .await;
        assert!(matches!(current.best(), EvaluationView::Engine(e) if e.score_centipawns == 650));
    }

    #[tokio::test]
    async fn test_background_retry_recovers() {
        let tablebase = Arc::new(kpk_tablebase());
        tablebase.set_failing(true);
        let aggregator = EvaluationAggregator::new(tablebase.clone(), None, fast_retries());
        let position = key(KPK_START);

        aggregator.set_position(position.clone()).await;
        wait_until(&aggregator, |c| c.as_ref().is_some_and(|c| c.has_error())).await;

        tablebase.set_failing(false);
        let current = wait_until(&aggregator, |c| {
            c.as_ref().is_some_and(|c| c.tablebase_result().is_some())
        })
        .await;
        assert_eq!(current.tablebase_result().unwrap().wdl, Wdl::WIN);
    }

    #[tokio::test]
    async fn test_evaluate_times_out() {
        let tablebase = Arc::new(kpk_tablebase());
        tablebase.delay(KPK_AFTER_KD6, Duration::from_millis(500));
        let aggregator = EvaluationAggregator::new(tablebase, None, fast_retries());

        let evaluation = aggregator
            .evaluate(&key(KPK_AFTER_KD6), Duration::from_millis(50))
            .await;
        assert!(evaluation.has_error());
    }

    #[tokio::test]
    async fn test_cache_serves_repeat_queries() {
        let tablebase = Arc::new(kpk_tablebase());
        let aggregator = EvaluationAggregator::new(tablebase.clone(), None, fast_retries());
        let position = key(KPK_START);

        let first = aggregator.evaluate(&position, Duration::from_secs(1)).await;
        assert!(first.tablebase_result().is_some());
        tablebase.set_failing(true);

        let second = aggregator.evaluate(&position, Duration::from_secs(1)).await;
        assert_eq!(first, second);
        let top = aggregator.top_moves(&position, 1).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].uci, "e6d6");
        assert_eq!(tablebase.lookup_count(), 1);
    }

    #[tokio::test]
    async fn test_caches_are_bounded() {
        let tablebase = Arc::new(kpk_tablebase());
        let engine = Arc::new(FakeEngine::new());
        let config = TablebaseConfig {
            cache_capacity: 2,
            ..fast_retries()
        };
        let aggregator = EvaluationAggregator::new(tablebase.clone(), Some(engine.clone()), config);

        for fen in [KPK_START, KPK_AFTER_KD6, KPK_AFTER_KD8] {
            aggregator.evaluate(&key(fen), Duration::from_secs(1)).await;
        }
        assert!(aggregator.shared.tablebase_cache.len() <= 2);
        assert!(aggregator.shared.tablebase_cache.contains_key(&key(KPK_AFTER_KD8)));

        let position = key(KPK_START);
        aggregator.set_position(position.clone()).await;
        engine.emit(engine_eval(&position, 500, None));
        wait_until(&aggregator, |c| c.as_ref().is_some_and(|c| c.engine.is_some())).await;
        assert!(aggregator.engine_evaluation(&position).is_some());

        aggregator.clear_engine_cache();
        assert!(aggregator.engine_evaluation(&position).is_none());
    }
}
