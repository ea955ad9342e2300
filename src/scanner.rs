use std::time::Duration;

use anyhow::Context;
use log::warn;
use reqwest::{Client, StatusCode, header};
use serde_json::Value;
use tokio::time;

use crate::MarketData;
use crate::config::Config;

/// Query fields requested from the scanner, in its own naming.
pub const SCANNER_FIELDS: &str =
    "Recommend.All,Recommend.All|1W,close,change,change_abs,high,low,volume,currency";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// One scanner observation for a symbol: the two recommendation summary
/// values plus last-seen market data. Label classification is the
/// caller's job since live and snapshot paths use different schemes.
#[derive(Clone, Debug, Default)]
pub struct Quote {
    pub daily_val: Option<f64>,
    pub weekly_val: Option<f64>,
    pub market_data: MarketData,
}

#[async_trait::async_trait]
pub trait QuoteFetcher: Send + Sync {
    async fn fetch_quote(&self, symbol: &str) -> anyhow::Result<Quote>;
}

pub struct ScannerClient {
    client: Client,
    base_url: String,
    request_timeout: Duration,
}

impl ScannerClient {
    pub fn new(config: &Config) -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .gzip(true)
            .deflate(true)
            .build()
            .expect("Failed to build HTTP client");
        Self {
            client,
            base_url: config.tv_base.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    /// Single symbol lookup with the scanner's retry contract: an initial
    /// random delay, `2 * 2^attempt` seconds on HTTP 429, one second on
    /// any other failure, three attempts total.
    pub async fn fetch(&self, symbol: &str) -> anyhow::Result<Quote> {
        let jitter = rand::random_range(50..500);
        time::sleep(Duration::from_millis(jitter)).await;

        let mut last_err = None;
        for attempt in 0..3u32 {
            match self.fetch_once(symbol).await {
                Ok(quote) => return Ok(quote),
                Err(FetchError::RateLimited) => {
                    let wait = 2 * 2u64.pow(attempt);
                    warn!("Scanner rate-limited on {symbol}, backing off {wait}s");
                    time::sleep(Duration::from_secs(wait)).await;
                    last_err = Some(anyhow::anyhow!("rate limited (429)"));
                }
                Err(FetchError::Other(e)) => {
                    warn!("Scanner fetch failed for {symbol} (attempt {}/3): {e:#}", attempt + 1);
                    time::sleep(Duration::from_secs(1)).await;
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no attempts made")))
            .with_context(|| format!("Failed to fetch {symbol} after 3 attempts"))
    }

    async fn fetch_once(&self, symbol: &str) -> Result<Quote, FetchError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("symbol", symbol),
                ("fields", SCANNER_FIELDS),
                ("no_404", "true"),
                ("label-product", "popup-technicals"),
            ])
            .header(header::ORIGIN, "https://www.tradingview.com")
            .header(header::REFERER, "https://www.tradingview.com/")
            .header(header::ACCEPT, "application/json, text/plain, */*")
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| FetchError::Other(e.into()))?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited);
        }
        let payload: Value = response
            .error_for_status()
            .map_err(|e| FetchError::Other(e.into()))?
            .json()
            .await
            .map_err(|e| FetchError::Other(e.into()))?;

        Ok(parse_payload(&payload))
    }
}

enum FetchError {
    RateLimited,
    Other(anyhow::Error),
}

#[async_trait::async_trait]
impl QuoteFetcher for ScannerClient {
    async fn fetch_quote(&self, symbol: &str) -> anyhow::Result<Quote> {
        self.fetch(symbol).await
    }
}

// ── Payload parsing ──────────────────────────────────────────────────────────

/// The scanner usually answers `{"data": {...}}` but intermittently nests
/// the same fields a level or two deeper, so each field is looked up at
/// `data.*` first and then anywhere in the tree.
fn parse_payload(payload: &Value) -> Quote {
    let field = |key: &str| -> Option<&Value> {
        payload
            .get("data")
            .filter(|d| d.is_object())
            .and_then(|d| d.get(key))
            .or_else(|| find_key(payload, key))
    };

    let currency = field("currency")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    Quote {
        daily_val: safe_float(field("Recommend.All")),
        weekly_val: safe_float(field("Recommend.All|1W")),
        market_data: MarketData {
            currency,
            price: safe_float(field("close")),
            change_pct: safe_float(field("change")),
            change_abs: safe_float(field("change_abs")),
            high: safe_float(field("high")),
            low: safe_float(field("low")),
        },
    }
}

/// Depth-first search for the first occurrence of `key` anywhere in the
/// JSON tree. Null leaves are treated as absent so a shallow null does not
/// shadow a nested value.
pub fn find_key<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => {
            if let Some(v) = map.get(key) {
                if !v.is_null() {
                    return Some(v);
                }
            }
            map.values().find_map(|v| find_key(v, key))
        }
        Value::Array(items) => items.iter().find_map(|v| find_key(v, key)),
        _ => None,
    }
}

/// Lenient numeric coercion: numbers and numeric strings pass through,
/// non-finite values and everything else become None.
fn safe_float(value: Option<&Value>) -> Option<f64> {
    let v = value?;
    let parsed = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_flat_data_object() {
        let payload = json!({
            "data": {
                "Recommend.All": 0.52,
                "Recommend.All|1W": -0.2,
                "close": 187.3,
                "change": 1.25,
                "change_abs": 2.31,
                "high": 189.0,
                "low": 185.5,
                "currency": "USD"
            }
        });
        let q = parse_payload(&payload);
        assert_eq!(q.daily_val, Some(0.52));
        assert_eq!(q.weekly_val, Some(-0.2));
        assert_eq!(q.market_data.price, Some(187.3));
        assert_eq!(q.market_data.currency, "USD");
    }

    #[test]
    fn falls_back_to_recursive_lookup() {
        let payload = json!({
            "data": {
                "result": [
                    {"wrapped": {"Recommend.All": "0.31", "close": 42.0}}
                ]
            },
            "meta": {"currency": "HKD"}
        });
        let q = parse_payload(&payload);
        assert_eq!(q.daily_val, Some(0.31));
        assert_eq!(q.weekly_val, None);
        assert_eq!(q.market_data.price, Some(42.0));
        assert_eq!(q.market_data.currency, "HKD");
    }

    #[test]
    fn find_key_skips_null_leaves() {
        let payload = json!({
            "a": {"close": null},
            "b": {"close": 7.5}
        });
        assert_eq!(find_key(&payload, "close").and_then(|v| v.as_f64()), Some(7.5));
        assert_eq!(find_key(&payload, "missing"), None);
    }

    #[test]
    fn safe_float_rejects_non_finite() {
        assert_eq!(safe_float(Some(&json!("NaN"))), None);
        assert_eq!(safe_float(Some(&json!("inf"))), None);
        assert_eq!(safe_float(Some(&json!("1.5"))), Some(1.5));
        assert_eq!(safe_float(Some(&json!(true))), None);
        assert_eq!(safe_float(None), None);
    }
}
