//! Core library for the MintStreet market indexer: transaction decoding,
//! price reconstruction, the deduplicated history cache, and the services
//! that keep it fed from polling, webhooks, and the live event stream.

pub mod cache;
pub mod candles;
pub mod config;
pub mod error;
pub mod helius_client;
pub mod history;
pub mod instruction_parser;
pub mod live_overlay;
pub mod models;
pub mod nft_pool_map;
pub mod pools;
pub mod price_extractor;
pub mod rpc_client;
pub mod throttle;
pub mod webhook;
