use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    #[serde(default = "default_environment")]
    pub environment: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProgramConfig {
    /// Program id of the marketplace bonding-curve program, base58.
    pub id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HeliusConfig {
    /// Enhanced transactions API host.
    #[serde(default = "default_helius_base_url")]
    pub base_url: String,
    /// JSON-RPC host for DAS calls (getAsset).
    #[serde(default = "default_helius_rpc_url")]
    pub rpc_url: String,
    pub api_key: String,
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RpcConfig {
    pub http_url: String,
    #[serde(default)]
    pub ws_url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ThrottleConfig {
    #[serde(default = "default_min_spacing_ms")]
    pub min_spacing_ms: u64,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_calls_per_window")]
    pub max_calls_per_window: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_max_cache_size")]
    pub max_size: usize,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub snapshot_path: Option<std::path::PathBuf>,
}

/// Strategy for picking among several payer-to-escrow transfers in one
/// transaction. The default keeps the historical behavior (largest wins).
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransferSelection {
    Largest,
    First,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PriceConfig {
    #[serde(default = "default_dust_threshold")]
    pub dust_threshold_lamports: u64,
    #[serde(default = "default_transfer_selection")]
    pub transfer_selection: TransferSelection,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OverlayConfig {
    /// Remote SSE endpoint. Absent means the overlay is disabled and only
    /// polling feeds the cache.
    #[serde(default)]
    pub sse_url: Option<String>,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_live_window_secs")]
    pub live_window_secs: i64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    pub secret: String,
    #[serde(default = "default_signature_header")]
    pub signature_header: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackfillConfig {
    #[serde(default = "default_backfill_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_inter_batch_delay_ms")]
    pub inter_batch_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MappingConfig {
    /// Directory for per-wallet NFT-to-pool cache files. Absent disables
    /// persistence; lookups still run.
    #[serde(default)]
    pub cache_dir: Option<std::path::PathBuf>,
    #[serde(default = "default_mapping_max_pages")]
    pub max_pages_per_mint: usize,
    #[serde(default = "default_mapping_page_limit")]
    pub page_limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub runtime: RuntimeConfig,
    pub api: ApiConfig,
    pub program: ProgramConfig,
    pub helius: HeliusConfig,
    pub rpc: RpcConfig,
    #[serde(default = "default_throttle")]
    pub throttle: ThrottleConfig,
    #[serde(default = "default_cache")]
    pub cache: CacheConfig,
    #[serde(default = "default_price")]
    pub price: PriceConfig,
    #[serde(default = "default_overlay")]
    pub overlay: OverlayConfig,
    pub webhook: WebhookConfig,
    #[serde(default = "default_backfill")]
    pub backfill: BackfillConfig,
    #[serde(default = "default_mapping")]
    pub mapping: MappingConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        // Load base config from `config/default.(toml|yaml|json)` relative to the
        // current working directory (the workspace root), then override with
        // `MINTSTREET__...` environment variables.
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::Environment::with_prefix("MINTSTREET").separator("__"))
            .build()?;

        settings.try_deserialize().map_err(Into::into)
    }
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_event_buffer() -> usize {
    10_000
}

fn default_helius_base_url() -> String {
    "https://api.helius.xyz".to_string()
}

fn default_helius_rpc_url() -> String {
    "https://mainnet.helius-rpc.com".to_string()
}

fn default_page_limit() -> usize {
    50
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_min_spacing_ms() -> u64 {
    200
}

fn default_window_ms() -> u64 {
    1_000
}

fn default_max_calls_per_window() -> usize {
    8
}

fn default_max_in_flight() -> usize {
    4
}

fn default_max_cache_size() -> usize {
    1_000
}

fn default_ttl_secs() -> u64 {
    86_400
}

fn default_dust_threshold() -> u64 {
    1_000
}

fn default_transfer_selection() -> TransferSelection {
    TransferSelection::Largest
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_delay_ms() -> u64 {
    2_000
}

fn default_live_window_secs() -> i64 {
    120
}

fn default_poll_interval_secs() -> u64 {
    15
}

fn default_signature_header() -> String {
    "x-webhook-signature".to_string()
}

fn default_backfill_batch_size() -> usize {
    5
}

fn default_inter_batch_delay_ms() -> u64 {
    400
}

fn default_throttle() -> ThrottleConfig {
    ThrottleConfig {
        min_spacing_ms: default_min_spacing_ms(),
        window_ms: default_window_ms(),
        max_calls_per_window: default_max_calls_per_window(),
        max_in_flight: default_max_in_flight(),
    }
}

fn default_cache() -> CacheConfig {
    CacheConfig {
        max_size: default_max_cache_size(),
        ttl_secs: default_ttl_secs(),
        snapshot_path: None,
    }
}

fn default_price() -> PriceConfig {
    PriceConfig {
        dust_threshold_lamports: default_dust_threshold(),
        transfer_selection: default_transfer_selection(),
    }
}

fn default_overlay() -> OverlayConfig {
    OverlayConfig {
        sse_url: None,
        max_reconnect_attempts: default_max_reconnect_attempts(),
        reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
        live_window_secs: default_live_window_secs(),
        poll_interval_secs: default_poll_interval_secs(),
    }
}

fn default_backfill() -> BackfillConfig {
    BackfillConfig {
        batch_size: default_backfill_batch_size(),
        inter_batch_delay_ms: default_inter_batch_delay_ms(),
    }
}

fn default_mapping_max_pages() -> usize {
    3
}

fn default_mapping_page_limit() -> usize {
    25
}

fn default_mapping() -> MappingConfig {
    MappingConfig {
        cache_dir: None,
        max_pages_per_mint: default_mapping_max_pages(),
        page_limit: default_mapping_page_limit(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_config_defaults() {
        let cfg = default_price();
        assert_eq!(cfg.dust_threshold_lamports, 1_000);
        assert_eq!(cfg.transfer_selection, TransferSelection::Largest);
    }

    #[test]
    fn test_transfer_selection_parses_lowercase() {
        let cfg: PriceConfig =
            serde_json::from_str(r#"{"transfer_selection":"first"}"#).unwrap();
        assert_eq!(cfg.transfer_selection, TransferSelection::First);
        assert_eq!(cfg.dust_threshold_lamports, 1_000);
    }
}
