// Client for the enhanced-transactions indexer API (Helius shape): paginated
// history for an address via `before` cursors, plus the DAS getAsset call
// used to hydrate collection display metadata. All requests go through the
// shared throttle; 429s retry with doubling backoff, honoring Retry-After.

use crate::config::HeliusConfig;
use crate::error::{IndexerError, Result};
use crate::models::EnhancedTransaction;
use crate::throttle::{retry_request, Throttle, INDEXER_BACKOFF_FACTOR};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Page-oriented source of enhanced transactions. The production
/// implementation is `HeliusClient`; tests script their own.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch_page(
        &self,
        address: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<EnhancedTransaction>>;
}

pub struct HeliusClient {
    http: reqwest::Client,
    config: HeliusConfig,
    throttle: Arc<Throttle>,
}

impl HeliusClient {
    pub fn new(config: HeliusConfig, throttle: Arc<Throttle>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            throttle,
        }
    }

    fn transactions_url(&self, address: &str, limit: usize, before: Option<&str>) -> String {
        // The API caps pages at 100.
        let limit = limit.clamp(1, 100);
        let mut url = format!(
            "{}/v0/addresses/{}/transactions?api-key={}&limit={}",
            self.config.base_url.trim_end_matches('/'),
            address,
            self.config.api_key,
            limit
        );
        if let Some(before) = before {
            url.push_str("&before=");
            url.push_str(before);
        }
        url
    }

    async fn get_page_once(&self, url: &str) -> Result<Vec<EnhancedTransaction>> {
        let _permit = self.throttle.acquire().await?;
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(IndexerError::RateLimited {
                retry_after_ms: parse_retry_after(resp.headers()),
            });
        }
        if !status.is_success() {
            return Err(IndexerError::Status(status.as_u16()));
        }
        Ok(resp.json().await?)
    }

    async fn post_rpc_once(&self, url: &str, body: &Value) -> Result<Value> {
        let _permit = self.throttle.acquire().await?;
        let resp = self.http.post(url).json(body).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(IndexerError::RateLimited {
                retry_after_ms: parse_retry_after(resp.headers()),
            });
        }
        if !status.is_success() {
            return Err(IndexerError::Status(status.as_u16()));
        }
        Ok(resp.json().await?)
    }

    /// DAS getAsset, reduced to the display fields the registry cares about.
    /// Assets the API does not know yield `Ok(None)`.
    pub async fn get_asset_display(&self, asset_id: &str) -> Result<Option<AssetDisplay>> {
        let url = format!(
            "{}/?api-key={}",
            self.config.rpc_url.trim_end_matches('/'),
            self.config.api_key
        );
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getAsset",
            "params": { "id": asset_id },
        });

        let value = retry_request(
            self.config.max_retries,
            Duration::from_millis(self.config.base_delay_ms),
            INDEXER_BACKOFF_FACTOR,
            || self.post_rpc_once(&url, &body),
        )
        .await?;

        Ok(asset_display_from_value(&value))
    }
}

#[async_trait]
impl HistorySource for HeliusClient {
    async fn fetch_page(
        &self,
        address: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<EnhancedTransaction>> {
        let url = self.transactions_url(address, limit, before);
        let page = retry_request(
            self.config.max_retries,
            Duration::from_millis(self.config.base_delay_ms),
            INDEXER_BACKOFF_FACTOR,
            || self.get_page_once(&url),
        )
        .await?;
        tracing::debug!(address, fetched = page.len(), "fetched history page");
        Ok(page)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssetDisplay {
    pub name: String,
    pub symbol: String,
    pub uri: String,
}

fn asset_display_from_value(v: &Value) -> Option<AssetDisplay> {
    let content = v.get("result")?.get("content")?;
    let metadata = content.get("metadata");
    let name = metadata
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let symbol = metadata
        .and_then(|m| m.get("symbol"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let uri = content
        .get("json_uri")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if name.is_empty() && symbol.is_empty() && uri.is_empty() {
        None
    } else {
        Some(AssetDisplay { name, symbol, uri })
    }
}

/// Retry-After in whole seconds, converted to milliseconds. Date-form values
/// are ignored and fall back to computed backoff.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| secs * 1_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThrottleConfig;
    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

    fn client() -> HeliusClient {
        HeliusClient::new(
            HeliusConfig {
                base_url: "https://api.helius.xyz/".to_string(),
                rpc_url: "https://mainnet.helius-rpc.com".to_string(),
                api_key: "test-key".to_string(),
                page_limit: 50,
                max_retries: 3,
                base_delay_ms: 500,
            },
            Arc::new(Throttle::new(&ThrottleConfig {
                min_spacing_ms: 0,
                window_ms: 1_000,
                max_calls_per_window: 100,
                max_in_flight: 4,
            })),
        )
    }

    #[test]
    fn test_transactions_url_first_page() {
        let url = client().transactions_url("Prog111", 50, None);
        assert_eq!(
            url,
            "https://api.helius.xyz/v0/addresses/Prog111/transactions?api-key=test-key&limit=50"
        );
    }

    #[test]
    fn test_transactions_url_with_cursor_and_clamp() {
        let url = client().transactions_url("Prog111", 500, Some("sig_abc"));
        assert_eq!(
            url,
            "https://api.helius.xyz/v0/addresses/Prog111/transactions?api-key=test-key&limit=100&before=sig_abc"
        );
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(parse_retry_after(&headers), Some(2_000));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);

        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn test_asset_display_extraction() {
        let v: Value = serde_json::from_str(
            r#"{
                "jsonrpc": "2.0",
                "id": 1,
                "result": {
                    "id": "mint1",
                    "content": {
                        "json_uri": "https://arweave.net/meta.json",
                        "metadata": { "name": "Street Cats", "symbol": "CATS" }
                    }
                }
            }"#,
        )
        .unwrap();

        let display = asset_display_from_value(&v).unwrap();
        assert_eq!(display.name, "Street Cats");
        assert_eq!(display.symbol, "CATS");
        assert_eq!(display.uri, "https://arweave.net/meta.json");
    }

    #[test]
    fn test_asset_display_missing_content() {
        let v: Value = serde_json::from_str(r#"{"result": {"id": "mint1"}}"#).unwrap();
        assert!(asset_display_from_value(&v).is_none());

        let err: Value =
            serde_json::from_str(r#"{"error": {"code": -32602, "message": "no asset"}}"#).unwrap();
        assert!(asset_display_from_value(&err).is_none());
    }
}
