use serde::{Deserialize, Serialize};

pub mod accuracy;
pub mod api;
pub mod config;
pub mod dr;
pub mod live;
pub mod market;
pub mod migrate;
pub mod rating;
pub mod scanner;
pub mod snapshot;
pub mod store;
pub mod symbol;

/// Last observed market data for an underlying, carried alongside every
/// rating write so the dashboards can render price context.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MarketData {
    pub currency: String,
    pub price: Option<f64>,
    pub change_pct: Option<f64>,
    pub change_abs: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
}

/// Cancellable sleep. Returns false when the token fired first; loops use
/// that to unwind without starting another batch.
pub async fn sleep_or_cancel(
    token: &tokio_util::sync::CancellationToken,
    duration: std::time::Duration,
) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

pub fn init_logger(filter: &str) {
    env_logger::Builder::new()
        .parse_filters(filter)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
}
