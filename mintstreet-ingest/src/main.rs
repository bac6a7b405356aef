use anyhow::Result;
use clap::Parser;
use mintstreet_core::{
    config::AppConfig, helius_client::HeliusClient, history::HistoryService,
    rpc_client::NetworkClient, throttle::Throttle,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Headless ingest tool: page the program's transaction history into the
/// snapshot cache and backfill sell prices, without the API server.
#[derive(Debug, Parser)]
#[command(name = "mintstreet-ingest")]
struct Args {
    /// Pages to fetch before stopping. 0 keeps paging until history is
    /// exhausted.
    #[arg(long, default_value_t = 0)]
    pages: usize,

    /// Override the configured page size.
    #[arg(long)]
    page_limit: Option<usize>,

    /// Skip the sell-price backfill pass.
    #[arg(long, default_value_t = false)]
    skip_sell_prices: bool,

    /// Drop the cached history (snapshot file included) before ingesting.
    #[arg(long, default_value_t = false)]
    clear: bool,

    /// After the historical walk, keep polling for new transactions until
    /// interrupted.
    #[arg(long, default_value_t = false)]
    follow: bool,

    /// Write the snapshot somewhere other than the configured path.
    #[arg(long)]
    snapshot: Option<std::path::PathBuf>,

    /// Print final ingest stats as JSON on stdout.
    #[arg(long, default_value_t = false)]
    stats_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = AppConfig::from_env()?;
    if let Some(path) = args.snapshot.clone() {
        config.cache.snapshot_path = Some(path);
    }
    let page_limit = args.page_limit.unwrap_or(config.helius.page_limit);

    tracing::info!(program = %config.program.id, page_limit, "starting ingest");

    let throttle = Arc::new(Throttle::new(&config.throttle));
    let helius = Arc::new(HeliusClient::new(config.helius.clone(), throttle.clone()));
    let network = NetworkClient::new(config.rpc.clone(), throttle);
    let service = HistoryService::new(
        config.program.id.clone(),
        page_limit,
        &config.cache,
        config.price.clone(),
        config.backfill.clone(),
        helius,
    );

    if args.clear {
        service.clear().await?;
    }

    let mut pages = 0usize;
    while service.can_load_more() {
        if args.pages != 0 && pages >= args.pages {
            break;
        }
        let outcome = service.load_more().await?;
        pages += 1;
        tracing::info!(
            page = pages,
            fetched = outcome.fetched,
            fresh = outcome.fresh,
            "page ingested"
        );
    }

    if !args.skip_sell_prices {
        let outcome = service.backfill_sell_prices(&network).await;
        tracing::info!(
            scanned = outcome.scanned,
            resolved = outcome.resolved,
            unresolvable = outcome.unresolvable,
            "sell price backfill finished"
        );
    }

    let stats = service.stats().await;
    tracing::info!(
        cached = stats.cached_records,
        decoded = stats.records_decoded,
        priced = stats.prices_resolved,
        exhausted = !stats.can_load_more,
        "ingest pass complete"
    );
    if args.stats_json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }

    if args.follow {
        tracing::info!(
            interval_secs = config.overlay.poll_interval_secs,
            "following new transactions, ctrl-c to stop"
        );
        let period = Duration::from_secs(config.overlay.poll_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut ctrl_c => break,
            }
            match service.poll_newest().await {
                Ok(fresh) if !fresh.is_empty() => {
                    tracing::info!(fresh = fresh.len(), "new transactions merged");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("poll failed: {e}"),
            }
            if !args.skip_sell_prices {
                let outcome = service.backfill_sell_prices(&network).await;
                if outcome.resolved > 0 {
                    tracing::info!(resolved = outcome.resolved, "sell prices backfilled");
                }
            }
        }
        tracing::info!("stopping");
    }

    Ok(())
}
