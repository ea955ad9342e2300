use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use itertools::Itertools;
use log::info;
use serde::Deserialize;

use crate::store::Store;

const OLD_STATS_FILE: &str = "ratings_stats.json";
const OLD_HISTORY_FILE: &str = "ratings_history.json";

/// Entry of the legacy per-timeframe JSON files, keyed `"TICKER_1D"` /
/// `"TICKER_1W"`.
#[derive(Debug, Deserialize)]
struct LegacyEntry {
    timestamp: String,
    rating: String,
}

type LegacyMap = HashMap<String, Vec<LegacyEntry>>;

/// Combined row destined for the current schema:
/// `(ticker, timestamp, daily_rating, weekly_rating)`.
type CombinedRow = (String, String, Option<String>, Option<String>);

/// One-shot ingestion of the legacy JSON state files. Runs only while the
/// stats table is still empty; each ingested file is renamed to
/// `<name>.migrated` so the next boot skips it.
pub async fn migrate_from_json_if_needed(store: &Store, dir: &Path) -> anyhow::Result<()> {
    let stats_path = dir.join(OLD_STATS_FILE);
    let history_path = dir.join(OLD_HISTORY_FILE);
    if !stats_path.exists() && !history_path.exists() {
        return Ok(());
    }

    if store.stats_count().await? > 0 {
        info!("[Migrate] Database already contains data, skipping JSON migration");
        return Ok(());
    }

    if stats_path.exists() {
        let rows = load_combined(&stats_path)?;
        let count = store
            .insert_migrated_stats(&rows)
            .await
            .context("failed to insert migrated stats")?;
        mark_migrated(&stats_path)?;
        info!("[Migrate] Ingested {count} rows from {OLD_STATS_FILE}");
    }

    if history_path.exists() {
        let rows = load_combined(&history_path)?;
        let count = store
            .insert_migrated_history(&rows)
            .await
            .context("failed to insert migrated history")?;
        mark_migrated(&history_path)?;
        info!("[Migrate] Ingested {count} rows from {OLD_HISTORY_FILE}");
    }

    Ok(())
}

fn load_combined(path: &Path) -> anyhow::Result<Vec<CombinedRow>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Couldn't read {path:?}"))?;
    let map: LegacyMap =
        serde_json::from_str(&content).with_context(|| format!("Couldn't parse {path:?}"))?;
    Ok(combine(map))
}

fn mark_migrated(path: &Path) -> anyhow::Result<()> {
    let mut migrated = path.as_os_str().to_owned();
    migrated.push(".migrated");
    std::fs::rename(path, &migrated)
        .with_context(|| format!("Couldn't rename {path:?} to {migrated:?}"))?;
    Ok(())
}

/// Fold the legacy per-timeframe entries into one row per
/// `(ticker, timestamp)` carrying both labels.
fn combine(map: LegacyMap) -> Vec<CombinedRow> {
    let mut rows: HashMap<(String, String), (Option<String>, Option<String>)> = HashMap::new();

    for (key, entries) in map {
        let Some((ticker, timeframe)) = split_key(&key) else {
            continue;
        };
        for entry in entries {
            let slot = rows
                .entry((ticker.to_string(), entry.timestamp.clone()))
                .or_default();
            match timeframe {
                "1D" => slot.0 = Some(entry.rating),
                "1W" => slot.1 = Some(entry.rating),
                _ => {}
            }
        }
    }

    rows.into_iter()
        .map(|((ticker, ts), (daily, weekly))| (ticker, ts, daily, weekly))
        .sorted()
        .collect()
}

/// `"AAPL_1D"` -> `("AAPL", "1D")`; tickers may themselves contain
/// underscores, so only the last segment is the timeframe.
fn split_key(key: &str) -> Option<(&str, &str)> {
    let (ticker, timeframe) = key.rsplit_once('_')?;
    (!ticker.is_empty()).then_some((ticker, timeframe))
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(ts: &str, rating: &str) -> LegacyEntry {
        LegacyEntry {
            timestamp: ts.to_string(),
            rating: rating.to_string(),
        }
    }

    #[test]
    fn combine_merges_timeframes_by_timestamp() {
        let mut map = LegacyMap::new();
        map.insert(
            "AAPL_1D".to_string(),
            vec![entry("2024-06-03T10:00:00", "Buy"), entry("2024-06-04T10:00:00", "Sell")],
        );
        map.insert(
            "AAPL_1W".to_string(),
            vec![entry("2024-06-03T10:00:00", "Strong Buy")],
        );

        let rows = combine(map);
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0],
            (
                "AAPL".to_string(),
                "2024-06-03T10:00:00".to_string(),
                Some("Buy".to_string()),
                Some("Strong Buy".to_string())
            )
        );
        assert_eq!(rows[1].2.as_deref(), Some("Sell"));
        assert_eq!(rows[1].3, None);
    }

    #[test]
    fn split_key_keeps_underscored_tickers_intact() {
        assert_eq!(split_key("MAERSK_B_1D"), Some(("MAERSK_B", "1D")));
        assert_eq!(split_key("AAPL_1W"), Some(("AAPL", "1W")));
        assert_eq!(split_key("NOSUFFIX"), None);
    }

    #[tokio::test]
    async fn migrated_rows_land_in_stats_table() -> anyhow::Result<()> {
        let store = Store::open_memory().await?;
        store
            .insert_migrated_stats(&[(
                "AAPL".to_string(),
                "2024-06-03T10:00:00".to_string(),
                Some("Buy".to_string()),
                None,
            )])
            .await?;
        assert_eq!(store.stats_count().await?, 1);
        Ok(())
    }
}
