use std::num::NonZeroU32;

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{direct::NotKeyed, InMemoryState},
    Quota, RateLimiter,
};
use log::{debug, trace, warn};
use nonzero_ext::nonzero;
use reqwest::Client;
use serde::Deserialize;

use super::{LookupResult, TablebaseError, TablebaseService};
use crate::chess::PositionKey;
use crate::config::TablebaseConfig;
use crate::evaluation::{Category, TablebaseMove, TablebaseResult};

/// Lichess tablebase HTTP client (`GET {base_url}/standard?fen=...`).
pub struct LichessTablebase {
    client: Client,
    base_url: String,
    max_pieces: usize,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
}

impl LichessTablebase {
    pub fn new(config: &TablebaseConfig) -> LookupResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("endgame-trainer/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(nonzero!(1u32));

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_pieces: config.max_pieces,
            rate_limiter: RateLimiter::direct(Quota::per_second(per_second)),
        })
    }
}

#[async_trait]
impl TablebaseService for LichessTablebase {
    async fn lookup(&self, position: &PositionKey) -> LookupResult<Option<TablebaseResult>> {
        let pieces = position.piece_count();
        if pieces > self.max_pieces {
            debug!("{} pieces in {}, outside the tablebase", pieces, position);
            return Ok(None);
        }

        self.rate_limiter.until_ready().await;

        let fen = position.to_fen();
        debug!("Tablebase lookup: {}", fen);
        let response = self
            .client
            .get(format!("{}/standard", self.base_url))
            .query(&[("fen", fen.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            warn!("Tablebase lookup for {} failed: {}", position, response.status());
            return Err(TablebaseError::Status(response.status().as_u16()));
        }

        let body = response.text().await?;
        trace!("Tablebase response for {}: {}", position, body);
        parse_response(&body)
    }
}

// =============================================================================
// Wire format
// =============================================================================

#[derive(Debug, Deserialize)]
struct WireResult {
    category: String,
    dtz: Option<i32>,
    precise_dtz: Option<i32>,
    dtm: Option<i32>,
    #[serde(default)]
    moves: Vec<WireMove>,
}

#[derive(Debug, Deserialize)]
struct WireMove {
    uci: String,
    san: String,
    category: String,
    dtz: Option<i32>,
    precise_dtz: Option<i32>,
    dtm: Option<i32>,
}

/// Decode a tablebase response body. An `unknown` category yields `Ok(None)`.
/// Moves with an unknown category are dropped; the provider's order is kept.
pub fn parse_response(body: &str) -> LookupResult<Option<TablebaseResult>> {
    let wire: WireResult =
        serde_json::from_str(body).map_err(|e| TablebaseError::Decode(e.to_string()))?;

    let Some((category, precise)) = Category::parse_provider(&wire.category) else {
        return Ok(None);
    };

    let moves = wire
        .moves
        .into_iter()
        .filter_map(|m| {
            let (category, _) = Category::parse_provider(&m.category)?;
            Some(TablebaseMove {
                uci: m.uci,
                san: m.san,
                category,
                wdl: category.wdl(),
                dtz: m.precise_dtz.or(m.dtz),
                dtm: m.dtm,
            })
        })
        .collect();

    Ok(Some(TablebaseResult {
        category,
        wdl: category.wdl(),
        dtz: wire.precise_dtz.or(wire.dtz),
        dtm: wire.dtm,
        precise,
        moves,
    }))
}
