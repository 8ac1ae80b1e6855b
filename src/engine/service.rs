//! Long-lived engine worker.
//!
//! A single task owns the engine process and reacts to [`EngineCommand`]s and engine
//! output. When a new position arrives mid-search it sends `stop`, waits for `bestmove`
//! and only then starts the next search, so every evaluation it publishes is tagged with
//! the position that was actually being searched. An overdue `bestmove` is waited for
//! with repeated `stop`s; the next search never starts before it arrives.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
    time::{sleep_until, Duration, Instant},
};
use vampirc_uci::UciMessage;

use super::{
    communication::{is_bestmove, parse_info_attributes, UciCommunicator},
    process::EngineProcess,
    types::{
        EngineCommand, EngineError, EngineResult, COMMAND_CHANNEL_CAPACITY,
        EVALUATION_CHANNEL_CAPACITY,
    },
};
use crate::chess::PositionKey;
use crate::config::EngineConfig;
use crate::evaluation::EngineEvaluation;

/// Background search engine.
#[async_trait]
pub trait EngineAnalysisService: Send + Sync {
    /// Abandon the current search and analyze `position`.
    async fn analyze(&self, position: PositionKey) -> EngineResult<()>;

    /// Stop searching.
    async fn stop(&self) -> EngineResult<()>;

    /// Evaluations as they are produced, each tagged with its position.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvaluation>;
}

// =============================================================================
// Search scheduling
// =============================================================================

/// What the worker has to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchAction {
    Start(PositionKey),
    SendStop,
}

/// Search bookkeeping, free of I/O.
#[derive(Debug, Default)]
pub struct SearchScheduler {
    searching: Option<PositionKey>,
    pending: Option<PositionKey>,
    stopping: bool,
}

impl SearchScheduler {
    /// Position the engine is currently searching, used to tag `info` lines.
    pub fn searching(&self) -> Option<&PositionKey> {
        self.searching.as_ref()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn request(&mut self, position: PositionKey) -> Option<SearchAction> {
        match &self.searching {
            None => {
                self.searching = Some(position.clone());
                Some(SearchAction::Start(position))
            }
            Some(current) if !self.stopping && *current == position => None,
            Some(_) if self.stopping => {
                self.pending = Some(position);
                None
            }
            Some(_) => {
                self.pending = Some(position);
                self.stopping = true;
                Some(SearchAction::SendStop)
            }
        }
    }

    pub fn request_stop(&mut self) -> Option<SearchAction> {
        self.pending = None;
        if self.searching.is_some() && !self.stopping {
            self.stopping = true;
            Some(SearchAction::SendStop)
        } else {
            None
        }
    }

    /// `bestmove` arrived. Starts the pending position.
    pub fn on_search_finished(&mut self) -> Option<SearchAction> {
        self.searching = None;
        self.stopping = false;
        let next = self.pending.take()?;
        self.searching = Some(next.clone());
        Some(SearchAction::Start(next))
    }

    /// A search could not be started.
    pub fn on_start_failed(&mut self) {
        self.searching = None;
        self.stopping = false;
    }
}

// =============================================================================
// UCI engine service
// =============================================================================

/// [`EngineAnalysisService`] over a UCI engine child process.
pub struct UciEngineService {
    commands: mpsc::Sender<EngineCommand>,
    evaluations: broadcast::Sender<EngineEvaluation>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UciEngineService {
    /// Start the engine named in `config` and its worker task.
    pub async fn spawn(config: &EngineConfig) -> EngineResult<Self> {
        let path = config.path.as_ref().ok_or(EngineError::NoEnginePath)?;
        let (process, reader) = EngineProcess::new(path, &config.uci_options()).await?;

        let (commands, receiver) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (evaluations, _) = broadcast::channel(EVALUATION_CHANNEL_CAPACITY);

        let worker = tokio::spawn(run_worker(
            process,
            UciCommunicator::new(reader),
            receiver,
            evaluations.clone(),
            config.stop_timeout(),
        ));

        Ok(Self {
            commands,
            evaluations,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Quit the engine and wait for the worker to finish.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(EngineCommand::Quit).await;
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                warn!("Engine worker ended abnormally: {}", e);
            }
        }
    }

    async fn send(&self, command: EngineCommand) -> EngineResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::WorkerStopped)
    }
}

#[async_trait]
impl EngineAnalysisService for UciEngineService {
    async fn analyze(&self, position: PositionKey) -> EngineResult<()> {
        self.send(EngineCommand::Analyze(position)).await
    }

    async fn stop(&self) -> EngineResult<()> {
        self.send(EngineCommand::Stop).await
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvaluation> {
        self.evaluations.subscribe()
    }
}

async fn run_worker(
    mut process: EngineProcess,
    mut communicator: UciCommunicator,
    mut commands: mpsc::Receiver<EngineCommand>,
    evaluations: broadcast::Sender<EngineEvaluation>,
    stop_timeout: Duration,
) {
    info!("Engine worker started");
    let mut scheduler = SearchScheduler::default();
    let mut stop_deadline: Option<Instant> = None;

    loop {
        let action = tokio::select! {
            command = commands.recv() => match command {
                Some(EngineCommand::Analyze(position)) => {
                    debug!("Analyze requested: {}", position);
                    scheduler.request(position)
                }
                Some(EngineCommand::Stop) => scheduler.request_stop(),
                Some(EngineCommand::Quit) | None => break,
            },
            line = communicator.next_line() => match line {
                Ok(Some(line)) => match communicator.parse_message(&line) {
                    UciMessage::Info(attrs) => {
                        if let Some(position) = scheduler.searching() {
                            if let Some(evaluation) = parse_info_attributes(attrs, position) {
                                // No subscribers is fine.
                                let _ = evaluations.send(evaluation);
                            }
                        }
                        None
                    }
                    message if is_bestmove(&message) => {
                        if let Err(e) = process.handle_bestmove() {
                            warn!("Unexpected bestmove: {}", e);
                        }
                        stop_deadline = None;
                        scheduler.on_search_finished()
                    }
                    _ => None,
                },
                Ok(None) => {
                    warn!("Engine closed its output");
                    break;
                }
                Err(e) => {
                    error!("Engine output failed: {}", e);
                    break;
                }
            },
            _ = sleep_until(stop_deadline.unwrap_or_else(Instant::now)),
                if stop_deadline.is_some() =>
            {
                // The search is still running; its output keeps its old tag.
                warn!("No bestmove within {:?} of stop", stop_timeout);
                if let Err(e) = process.repeat_stop().await {
                    error!("Failed to repeat stop: {}", e);
                    break;
                }
                stop_deadline = Some(Instant::now() + stop_timeout);
                None
            }
        };

        match action {
            Some(SearchAction::Start(position)) => {
                if let Err(e) = process.start_search(&position).await {
                    error!("Failed to start search for {}: {}", position, e);
                    scheduler.on_start_failed();
                    if matches!(e, EngineError::BrokenPipe) {
                        break;
                    }
                }
            }
            Some(SearchAction::SendStop) => match process.request_stop().await {
                Ok(()) => stop_deadline = Some(Instant::now() + stop_timeout),
                Err(e) => {
                    error!("Failed to stop search: {}", e);
                    break;
                }
            },
            None => {}
        }
    }

    if let Err(e) = process.kill().await {
        warn!("Error while terminating engine: {}", e);
    }
    info!("Engine worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(fen: &str) -> PositionKey {
        PositionKey::from_fen(fen).unwrap()
    }

    #[test]
    fn test_first_request_starts_search() {
        let p1 = key("4k3/8/4K3/4P3/8/8/8/8 w - - 0 1");
        let mut scheduler = SearchScheduler::default();

        assert_eq!(scheduler.request(p1.clone()), Some(SearchAction::Start(p1.clone())));
        assert_eq!(scheduler.searching(), Some(&p1));
        // Same position again is a no-op.
        assert_eq!(scheduler.request(p1), None);
    }

    #[test]
    fn test_new_position_waits_for_bestmove() {
        let p1 = key("4k3/8/4K3/4P3/8/8/8/8 w - - 0 1");
        let p2 = key("4k3/8/3K4/4P3/8/8/8/8 b - - 0 1");
        let p3 = key("3k4/8/3K4/4P3/8/8/8/8 w - - 0 1");
        let mut scheduler = SearchScheduler::default();

        scheduler.request(p1.clone());
        assert_eq!(scheduler.request(p2), Some(SearchAction::SendStop));
        assert!(scheduler.is_stopping());
        // Info lines still belong to the old search until bestmove arrives.
        assert_eq!(scheduler.searching(), Some(&p1));

        // A newer position replaces the pending one without a second stop.
        assert_eq!(scheduler.request(p3.clone()), None);

        assert_eq!(scheduler.on_search_finished(), Some(SearchAction::Start(p3.clone())));
        assert_eq!(scheduler.searching(), Some(&p3));
        assert!(!scheduler.is_stopping());
    }

    #[test]
    fn test_stop_clears_pending() {
        let p1 = key("4k3/8/4K3/4P3/8/8/8/8 w - - 0 1");
        let p2 = key("4k3/8/3K4/4P3/8/8/8/8 b - - 0 1");
        let mut scheduler = SearchScheduler::default();

        assert_eq!(scheduler.request_stop(), None);
        scheduler.request(p1);
        scheduler.request(p2);
        assert_eq!(scheduler.request_stop(), None);
        assert_eq!(scheduler.on_search_finished(), None);
        assert_eq!(scheduler.searching(), None);
    }

    /// A minimal UCI engine: one `info` per `go`, another plus `bestmove` per `stop`.
    /// The first `stop` is answered only after `first_stop_delay`.
    #[cfg(unix)]
    fn scripted_engine(dir: &std::path::Path, first_stop_delay: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = r#"#!/bin/sh
n=0
searching=0
stops=0
while read -r cmd rest; do
  case "$cmd" in
    uci) echo "id name scripted"; echo "uciok" ;;
    isready) echo "readyok" ;;
    go) n=$((n + 1)); searching=1; echo "info depth 1 score cp ${n}00 pv e6d6" ;;
    stop)
      if [ "$searching" = 1 ]; then
        stops=$((stops + 1))
        if [ "$stops" = 1 ]; then sleep FIRST_STOP_DELAY; fi
        echo "info depth 2 score cp ${n}11 pv e6d6"
        echo "bestmove e6d6"
        searching=0
      fi ;;
    quit) exit 0 ;;
  esac
done
"#
        .replace("FIRST_STOP_DELAY", first_stop_delay);

        let path = dir.join("engine.sh");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Collect `(score, position)` pairs until `last_score` shows up.
    #[cfg(unix)]
    async fn collect_until(
        receiver: &mut broadcast::Receiver<EngineEvaluation>,
        last_score: i32,
    ) -> Vec<(i32, PositionKey)> {
        let mut seen = Vec::new();
        let collect = async {
            while let Ok(evaluation) = receiver.recv().await {
                let done = evaluation.score_centipawns == last_score;
                seen.push((evaluation.score_centipawns, evaluation.position));
                if done {
                    break;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), collect)
            .await
            .expect("engine output not received");
        seen
    }

    #[cfg(unix)]
    async fn spawn_scripted(
        dir: &std::path::Path,
        first_stop_delay: &str,
        stop_timeout_ms: u64,
    ) -> UciEngineService {
        let config = EngineConfig {
            path: Some(scripted_engine(dir, first_stop_delay)),
            stop_timeout_ms,
            ..EngineConfig::default()
        };
        UciEngineService::spawn(&config).await.unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_tags_each_search_with_its_position() {
        let dir = tempfile::tempdir().unwrap();
        let engine = spawn_scripted(dir.path(), "0", 8000).await;
        let mut evaluations = engine.subscribe();
        let p1 = key("4k3/8/4K3/4P3/8/8/8/8 w - - 0 1");
        let p2 = key("4k3/8/3K4/4P3/8/8/8/8 b - - 0 1");

        engine.analyze(p1.clone()).await.unwrap();
        assert_eq!(collect_until(&mut evaluations, 100).await, vec![(100, p1.clone())]);

        // Switching sends stop; the output before bestmove still belongs to p1.
        engine.analyze(p2.clone()).await.unwrap();
        assert_eq!(
            collect_until(&mut evaluations, 200).await,
            vec![(111, p1), (200, p2.clone())]
        );

        engine.stop().await.unwrap();
        assert_eq!(collect_until(&mut evaluations, 211).await, vec![(211, p2)]);
        engine.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_overdue_bestmove_keeps_old_tag() {
        let dir = tempfile::tempdir().unwrap();
        let engine = spawn_scripted(dir.path(), "1", 200).await;
        let mut evaluations = engine.subscribe();
        let p1 = key("4k3/8/4K3/4P3/8/8/8/8 w - - 0 1");
        let p2 = key("4k3/8/3K4/4P3/8/8/8/8 b - - 0 1");

        engine.analyze(p1.clone()).await.unwrap();
        collect_until(&mut evaluations, 100).await;

        // bestmove arrives long after the stop timeout; p2 must wait for it.
        engine.analyze(p2.clone()).await.unwrap();
        assert_eq!(
            collect_until(&mut evaluations, 200).await,
            vec![(111, p1), (200, p2)]
        );
        engine.shutdown().await;
    }

    #[test]
    fn test_failed_start_resets() {
        let p1 = key("4k3/8/4K3/4P3/8/8/8/8 w - - 0 1");
        let mut scheduler = SearchScheduler::default();

        scheduler.request(p1.clone());
        scheduler.on_start_failed();
        assert_eq!(scheduler.request(p1.clone()), Some(SearchAction::Start(p1)));
    }
}
