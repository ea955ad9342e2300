use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use reqwest::Client;
use serde::Deserialize;

use crate::config::Config;

/// One row of the upstream DR list. All fields are free-form and may be
/// absent; resolution happens later in [`crate::symbol`].
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DrRow {
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub underlying: String,
    #[serde(default, rename = "underlyingName")]
    pub underlying_name: String,
    #[serde(default, rename = "underlyingExchange")]
    pub underlying_exchange: String,
}

#[derive(Debug, Deserialize)]
struct DrListResponse {
    #[serde(default)]
    rows: Vec<DrRow>,
}

/// A deduplicated underlying to track: the canonical ticker identity the
/// rating tables key on.
#[derive(Clone, Debug)]
pub struct DrTicker {
    pub u_code: String,
    pub name: String,
    pub exchange: String,
    pub dr_symbol: String,
}

pub struct DrClient {
    client: Client,
    url: String,
}

impl DrClient {
    pub fn new(config: &Config) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            client,
            url: config.dr_list_url.clone(),
        }
    }

    pub async fn fetch(&self) -> anyhow::Result<Vec<DrRow>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("DR list request failed")?
            .error_for_status()
            .context("DR list returned an error status")?
            .json::<DrListResponse>()
            .await
            .context("DR list response is not valid JSON")?;
        Ok(response.rows)
    }
}

/// Canonical underlying code for a DR row: the uppercased underlying, or
/// the DR symbol with its two-digit series suffix stripped when the list
/// omits the underlying entirely.
pub fn u_code_of(row: &DrRow) -> Option<String> {
    let underlying = row.underlying.trim();
    if !underlying.is_empty() {
        return Some(underlying.to_uppercase());
    }
    let symbol = row.symbol.trim();
    let digits = symbol.bytes().rev().take_while(|b| b.is_ascii_digit()).count();
    let stripped = if digits == 2 { &symbol[..symbol.len() - 2] } else { symbol };
    (!stripped.is_empty()).then(|| stripped.to_uppercase())
}

/// Collapse the DR list to one record per underlying, preserving first-seen
/// order. Several DR series can track the same underlying; the record that
/// actually names an exchange wins so market mapping stays possible.
pub fn unique_underlyings(rows: &[DrRow]) -> Vec<DrTicker> {
    let mut order = Vec::new();
    let mut by_code: HashMap<String, DrTicker> = HashMap::new();

    for row in rows {
        let Some(u_code) = u_code_of(row) else {
            continue;
        };
        let take = match by_code.get(&u_code) {
            None => {
                order.push(u_code.clone());
                true
            }
            Some(existing) => {
                existing.exchange.trim().is_empty() && !row.underlying_exchange.trim().is_empty()
            }
        };
        if take {
            by_code.insert(
                u_code.clone(),
                DrTicker {
                    u_code,
                    name: row.underlying_name.clone(),
                    exchange: row.underlying_exchange.clone(),
                    dr_symbol: row.symbol.clone(),
                },
            );
        }
    }

    order
        .into_iter()
        .filter_map(|code| by_code.remove(&code))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn row(symbol: &str, underlying: &str, exchange: &str) -> DrRow {
        DrRow {
            symbol: symbol.to_string(),
            underlying: underlying.to_string(),
            underlying_name: String::new(),
            underlying_exchange: exchange.to_string(),
        }
    }

    #[test]
    fn dedup_prefers_record_with_exchange() {
        let rows = vec![
            row("AAPL80", "AAPL", ""),
            row("AAPL19", "AAPL", "The Nasdaq Stock Market"),
            row("MSFT80", "MSFT", "The Nasdaq Stock Market"),
        ];
        let unique = unique_underlyings(&rows);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].u_code, "AAPL");
        assert_eq!(unique[0].exchange, "The Nasdaq Stock Market");
        assert_eq!(unique[0].dr_symbol, "AAPL19");
        assert_eq!(unique[1].u_code, "MSFT");
    }

    #[test]
    fn dedup_keeps_first_seen_order() {
        let rows = vec![
            row("NVDA80", "NVDA", "NASDAQ"),
            row("TSM80", "TSM", "NYSE"),
            row("NVDA19", "NVDA", "NASDAQ"),
        ];
        let unique = unique_underlyings(&rows);
        let codes: Vec<&str> = unique.iter().map(|t| t.u_code.as_str()).collect();
        assert_eq!(codes, ["NVDA", "TSM"]);
    }

    #[test]
    fn u_code_falls_back_to_stripped_dr_symbol() {
        assert_eq!(u_code_of(&row("AAPL80", "", "")), Some("AAPL".to_string()));
        assert_eq!(u_code_of(&row("0700", "", "")), Some("0700".to_string()));
        assert_eq!(u_code_of(&row("", "", "")), None);
        assert_eq!(u_code_of(&row("X80", "aapl", "")), Some("AAPL".to_string()));
    }
}
