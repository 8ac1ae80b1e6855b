//! In-memory providers for tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::chess::PositionKey;
use crate::engine::{EngineAnalysisService, EngineResult};
use crate::evaluation::{Category, EngineEvaluation, TablebaseMove, TablebaseResult, Wdl};
use crate::tablebase::{LookupResult, TablebaseError, TablebaseService};

pub const KPK_START: &str = "4k3/8/4K3/4P3/8/8/8/8 w - - 0 1";
pub const KPK_AFTER_KD6: &str = "4k3/8/3K4/4P3/8/8/8/8 b - - 0 1";
pub const KPK_AFTER_KD8: &str = "3k4/8/3K4/4P3/8/8/8/8 w - - 0 1";
pub const KPK_AFTER_KC5: &str = "3k4/8/8/2K1P3/8/8/8/8 b - - 0 1";

pub fn key(fen: &str) -> PositionKey {
    PositionKey::from_fen(fen).unwrap()
}

/// A ranked move; `wdl` and `dtm` are for the side to move after it.
pub fn tb_move(uci: &str, san: &str, wdl: i8, dtm: Option<i32>) -> TablebaseMove {
    let wdl = Wdl::new(wdl).unwrap();
    TablebaseMove {
        uci: uci.to_string(),
        san: san.to_string(),
        category: Category::from_wdl(wdl),
        wdl,
        dtz: None,
        dtm,
    }
}

pub fn tb_result(wdl: i8, dtm: Option<i32>, moves: Vec<TablebaseMove>) -> TablebaseResult {
    let wdl = Wdl::new(wdl).unwrap();
    TablebaseResult {
        category: Category::from_wdl(wdl),
        wdl,
        dtz: None,
        dtm,
        precise: true,
        moves,
    }
}

pub fn engine_eval(position: &PositionKey, cp: i32, mate: Option<i32>) -> EngineEvaluation {
    EngineEvaluation {
        position: position.clone(),
        score_centipawns: cp,
        mate_in_moves: mate,
        depth: 20,
        principal_variation: vec![],
    }
}

/// Scripted tablebase data for the K+P vs K line used across tests.
pub fn kpk_tablebase() -> FakeTablebase {
    let tablebase = FakeTablebase::new();
    tablebase.insert(
        KPK_START,
        tb_result(
            2,
            Some(19),
            vec![
                tb_move("e6d6", "Kd6", -2, Some(-18)),
                tb_move("e6f6", "Kf6", -2, Some(-18)),
                tb_move("e6d5", "Kd5", 0, None),
                tb_move("e6f5", "Kf5", 0, None),
            ],
        ),
    );
    tablebase.insert(
        KPK_AFTER_KD6,
        tb_result(
            -2,
            Some(-18),
            vec![
                tb_move("e8d8", "Kd8", 2, Some(17)),
                tb_move("e8f8", "Kf8", 2, Some(15)),
                tb_move("e8f7", "Kf7", 2, Some(15)),
            ],
        ),
    );
    tablebase.insert(
        KPK_AFTER_KD8,
        tb_result(
            2,
            Some(17),
            vec![
                tb_move("e5e6", "e6", -2, Some(-16)),
                tb_move("d6c6", "Kc6", -2, Some(-16)),
                tb_move("d6e6", "Ke6", -2, Some(-16)),
                tb_move("d6c5", "Kc5", 0, None),
            ],
        ),
    );
    tablebase.insert(KPK_AFTER_KC5, tb_result(0, None, vec![]));
    tablebase
}

#[derive(Default)]
pub struct FakeTablebase {
    entries: Mutex<HashMap<PositionKey, TablebaseResult>>,
    delays: Mutex<HashMap<PositionKey, Duration>>,
    failing: AtomicBool,
    lookups: AtomicUsize,
}

impl FakeTablebase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, fen: &str, result: TablebaseResult) {
        self.entries.lock().unwrap().insert(key(fen), result);
    }

    pub fn delay(&self, fen: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(key(fen), delay);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TablebaseService for FakeTablebase {
    async fn lookup(&self, position: &PositionKey) -> LookupResult<Option<TablebaseResult>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.lock().unwrap().get(position).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TablebaseError::Unavailable("offline".to_string()));
        }
        Ok(self.entries.lock().unwrap().get(position).cloned())
    }
}

pub struct FakeEngine {
    sender: broadcast::Sender<EngineEvaluation>,
    analyzed: Mutex<Vec<PositionKey>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            sender,
            analyzed: Mutex::new(Vec::new()),
        }
    }

    pub fn emit(&self, evaluation: EngineEvaluation) {
        let _ = self.sender.send(evaluation);
    }

    pub fn analyzed(&self) -> Vec<PositionKey> {
        self.analyzed.lock().unwrap().clone()
    }
}

#[async_trait]
impl EngineAnalysisService for FakeEngine {
    async fn analyze(&self, position: PositionKey) -> EngineResult<()> {
        self.analyzed.lock().unwrap().push(position);
        Ok(())
    }

    async fn stop(&self) -> EngineResult<()> {
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvaluation> {
        self.sender.subscribe()
    }
}
