use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::stream::Stream;
use mintstreet_core::{
    candles::pool_candles,
    config::{AppConfig, WebhookConfig},
    error::IndexerError,
    helius_client::{AssetDisplay, HeliusClient},
    history::{HistoryPage, HistoryService, ServiceStats},
    live_overlay::{ConnectionState, LiveOverlay},
    models::{
        Candle, Collection, HistoryItem, NftGridItem, Pool, PoolMetrics, StreamEnvelope,
        StreamEventType,
    },
    nft_pool_map::NftPoolMapper,
    pools::{collect_collections, collect_pools, pool_metrics, pool_nfts, trending_pools},
    rpc_client::NetworkClient,
    throttle::Throttle,
    webhook::{process_delivery, publish_derived, verify_signature},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

async fn health() -> &'static str {
    "ok"
}

#[derive(Clone)]
struct AppState {
    service: Arc<HistoryService>,
    helius: Arc<HeliusClient>,
    mapper: Arc<NftPoolMapper>,
    hub: broadcast::Sender<StreamEnvelope>,
    overlay_state: watch::Receiver<ConnectionState>,
    shutdown: watch::Receiver<bool>,
    webhook: WebhookConfig,
    heartbeat_secs: u64,
    live_window_secs: i64,
    environment: String,
    // getAsset answers, keyed by collection address.
    hydrated: Arc<RwLock<HashMap<String, AssetDisplay>>>,
}

impl AppState {
    async fn records(&self) -> Vec<HistoryItem> {
        self.service.records_snapshot().await
    }

    async fn collection_display(&self, asset: &str) -> Option<AssetDisplay> {
        if let Some(found) = self.hydrated.read().await.get(asset) {
            return Some(found.clone());
        }
        match self.helius.get_asset_display(asset).await {
            Ok(Some(display)) => {
                self.hydrated
                    .write()
                    .await
                    .insert(asset.to_string(), display.clone());
                Some(display)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(asset, "collection metadata hydration failed: {e}");
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct SseQuery {
    #[serde(rename = "clientId")]
    client_id: Option<String>,
}

async fn collections_sse_handler(
    State(state): State<AppState>,
    Query(q): Query<SseQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let client_id = q
        .client_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    tracing::debug!(%client_id, "sse client connected");

    let hello = StreamEnvelope::now(
        StreamEventType::Connection,
        serde_json::json!({ "clientId": client_id, "message": "connected" }),
    );

    let events = BroadcastStream::new(state.hub.subscribe()).filter_map(|r| r.ok());

    let period = Duration::from_secs(state.heartbeat_secs.max(1));
    let heartbeats = IntervalStream::new(tokio::time::interval_at(
        tokio::time::Instant::now() + period,
        period,
    ))
    .map(|_| StreamEnvelope::now(StreamEventType::Heartbeat, serde_json::json!({})));

    let stream = tokio_stream::once(hello)
        .chain(events.merge(heartbeats))
        .map(|envelope| {
            Ok(Event::default()
                .data(serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string())))
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let signature = headers
        .get(&state.webhook.signature_header)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verify_signature(&state.webhook.secret, &body, signature) {
        tracing::warn!("webhook delivery rejected: bad signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let outcome = process_delivery(&state.service, &body).await.map_err(|e| {
        tracing::warn!("webhook delivery malformed: {e}");
        StatusCode::BAD_REQUEST
    })?;
    publish_derived(&state.hub, &outcome.fresh);

    Ok(Json(serde_json::json!({
        "processed": outcome.processed,
        "fresh": outcome.fresh.len(),
    })))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    before: Option<String>,
}

async fn history_handler(
    State(state): State<AppState>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<HistoryPage>, StatusCode> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let page = state
        .service
        .history_page(limit, q.before.as_deref())
        .await
        .map_err(|e| {
            tracing::error!("history page failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(page))
}

async fn pools_handler(State(state): State<AppState>) -> Json<Vec<Pool>> {
    let records = state.records().await;
    let refs: Vec<&HistoryItem> = records.iter().collect();
    Json(collect_pools(&refs))
}

#[derive(Debug, Deserialize)]
struct TrendingQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct TrendingEntry {
    pool: Pool,
    metrics: PoolMetrics,
}

async fn trending_pools_handler(
    State(state): State<AppState>,
    Query(q): Query<TrendingQuery>,
) -> Json<Vec<TrendingEntry>> {
    let limit = q.limit.unwrap_or(10).clamp(1, 100);
    let records = state.records().await;
    let refs: Vec<&HistoryItem> = records.iter().collect();
    let ranked = trending_pools(&refs, Utc::now(), limit)
        .into_iter()
        .map(|(pool, metrics)| TrendingEntry { pool, metrics })
        .collect();
    Json(ranked)
}

#[derive(Debug, Serialize)]
struct PoolDetail {
    pool: Pool,
    collection: Option<Collection>,
    collection_display: Option<AssetDisplay>,
    metrics: PoolMetrics,
}

async fn pool_detail_handler(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<PoolDetail>, StatusCode> {
    let records = state.records().await;
    let refs: Vec<&HistoryItem> = records.iter().collect();

    let pool = collect_pools(&refs)
        .into_iter()
        .find(|p| p.address == address)
        .ok_or(StatusCode::NOT_FOUND)?;
    let collection = collect_collections(&refs)
        .into_iter()
        .find(|c| c.pool.as_deref() == Some(address.as_str()));
    let collection_display = match &collection {
        Some(c) => state.collection_display(&c.address).await,
        None => None,
    };
    let metrics = pool_metrics(&refs, &address, Utc::now());

    Ok(Json(PoolDetail {
        pool,
        collection,
        collection_display,
        metrics,
    }))
}

async fn pool_metrics_handler(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Json<PoolMetrics> {
    let records = state.records().await;
    let refs: Vec<&HistoryItem> = records.iter().collect();
    Json(pool_metrics(&refs, &address, Utc::now()))
}

#[derive(Debug, Deserialize)]
struct CandlesQuery {
    interval_secs: Option<i64>,
    limit: Option<usize>,
}

async fn pool_candles_handler(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(q): Query<CandlesQuery>,
) -> Json<Vec<Candle>> {
    let interval = q.interval_secs.unwrap_or(60).clamp(1, 86_400);
    let limit = q.limit.unwrap_or(500).clamp(1, 5_000);
    let records = state.records().await;
    let refs: Vec<&HistoryItem> = records.iter().collect();
    Json(pool_candles(
        &refs,
        &address,
        interval,
        state.live_window_secs,
        limit,
    ))
}

async fn pool_nfts_handler(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Json<Vec<NftGridItem>> {
    let records = state.records().await;
    let refs: Vec<&HistoryItem> = records.iter().collect();
    Json(pool_nfts(&refs, &address))
}

#[derive(Debug, Deserialize)]
struct NftPoolsQuery {
    /// Comma-separated mint addresses.
    mints: Option<String>,
}

async fn wallet_nft_pools_handler(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    Query(q): Query<NftPoolsQuery>,
) -> Result<Json<HashMap<String, String>>, StatusCode> {
    let mints: Vec<String> = q
        .mints
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if mints.is_empty() {
        return Ok(Json(HashMap::new()));
    }

    let records = state.records().await;
    let mapping = state
        .mapper
        .resolve(&owner, &mints, &records, &state.shutdown)
        .await
        .map_err(|e| match e {
            IndexerError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            other => {
                tracing::error!(%owner, "nft-pool resolution failed: {other}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })?;
    Ok(Json(mapping))
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    service: ServiceStats,
    overlay: ConnectionState,
    environment: String,
}

async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        service: state.service.stats().await,
        overlay: *state.overlay_state.borrow(),
        environment: state.environment.clone(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::from_env()?;
    tracing::info!(
        environment = %config.runtime.environment,
        program = %config.program.id,
        "starting api server"
    );

    let throttle = Arc::new(Throttle::new(&config.throttle));
    let helius = Arc::new(HeliusClient::new(config.helius.clone(), throttle.clone()));
    let network = Arc::new(NetworkClient::new(config.rpc.clone(), throttle.clone()));
    let service = Arc::new(HistoryService::new(
        config.program.id.clone(),
        config.helius.page_limit,
        &config.cache,
        config.price.clone(),
        config.backfill.clone(),
        helius.clone(),
    ));
    let mapper = Arc::new(NftPoolMapper::new(
        config.mapping.clone(),
        config.program.id.clone(),
        helius.clone(),
    ));

    let (hub, _hub_rx) = broadcast::channel::<StreamEnvelope>(config.api.event_buffer);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (overlay, overlay_state) = LiveOverlay::new(config.overlay.clone());

    // Cold starts serve an empty cache until the first poll; pull one page
    // up front so the first request already has history.
    match service.load_more().await {
        Ok(outcome) => tracing::info!(
            fetched = outcome.fetched,
            fresh = outcome.fresh,
            "warmed history cache"
        ),
        Err(e) => tracing::warn!("initial history load failed: {e}"),
    }

    // Background: poll for new transactions and backfill sell prices.
    {
        let service = service.clone();
        let network = network.clone();
        let hub = hub.clone();
        let mut shutdown = shutdown_rx.clone();
        let period = Duration::from_secs(config.overlay.poll_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                match service.poll_newest().await {
                    Ok(fresh) if !fresh.is_empty() => {
                        tracing::info!(fresh = fresh.len(), "poll found new transactions");
                        publish_derived(&hub, &fresh);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("poll failed: {e}"),
                }
                let outcome = service.backfill_sell_prices(network.as_ref()).await;
                if outcome.resolved > 0 {
                    tracing::info!(resolved = outcome.resolved, "sell prices backfilled");
                }
            }
        });
    }

    // Background: live overlay stream (poll keeps running either way).
    {
        let service = service.clone();
        let hub = hub.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            overlay.run(service, hub, shutdown).await;
        });
    }

    // Background: program account watcher, when a websocket endpoint is set.
    if !config.rpc.ws_url.is_empty() {
        let network = network.clone();
        let hub = hub.clone();
        let shutdown = shutdown_rx.clone();
        let program_id = config.program.id.clone();
        tokio::spawn(async move {
            if let Err(e) = network
                .watch_program_accounts(&program_id, hub, shutdown)
                .await
            {
                tracing::error!("program account watcher ended: {e}");
            }
        });
    }

    let state = AppState {
        service,
        helius,
        mapper,
        hub,
        overlay_state,
        shutdown: shutdown_rx,
        webhook: config.webhook.clone(),
        heartbeat_secs: config.api.heartbeat_secs,
        live_window_secs: config.overlay.live_window_secs,
        environment: config.runtime.environment.clone(),
        hydrated: Arc::new(RwLock::new(HashMap::new())),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/collections/sse", get(collections_sse_handler))
        .route("/api/webhook", post(webhook_handler))
        .route("/api/history", get(history_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/pools", get(pools_handler))
        .route("/api/pools/trending", get(trending_pools_handler))
        .route("/api/pools/:address", get(pool_detail_handler))
        .route("/api/pools/:address/metrics", get(pool_metrics_handler))
        .route("/api/pools/:address/candles", get(pool_candles_handler))
        .route("/api/pools/:address/nfts", get(pool_nfts_handler))
        .route("/api/wallets/:owner/nft-pools", get(wallet_nft_pools_handler))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = config.api.bind_addr.parse()?;
    tracing::info!("listening on {addr}");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    Ok(())
}
