//! Market-data feed implementations.

pub mod sim;

use std::sync::Arc;

use crate::core::{AdapterConfig, Error, Result};
use crate::marketdata::{FeedHandle, MarketDataAdapter};

/// Resolve a feed factory from a config section.
pub fn create(cfg: &AdapterConfig, handle: FeedHandle) -> Result<Arc<dyn MarketDataAdapter>> {
    match cfg.adapter.as_str() {
        "sim" => Ok(sim::SimFeed::new(cfg, handle)),
        other => Err(Error::Config(format!(
            "unknown market data adapter '{}'",
            other
        ))),
    }
}
