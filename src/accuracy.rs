use anyhow::Context;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::rating::Rating;
use crate::store::{AccuracyRecord, SnapshotPoint, Store, WindowRow};

pub const DEFAULT_WINDOW_DAYS: i64 = 90;

/// Prediction scoreboard for one timeframe over the lookback window.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimeframeAccuracy {
    /// Latest qualifying rating/prev pair in the window, kept for display.
    pub rating: Option<String>,
    pub prev: Option<String>,
    pub sample_size: i64,
    pub correct: i64,
    pub incorrect: i64,
    pub accuracy: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AccuracySummary {
    pub daily: TimeframeAccuracy,
    pub weekly: TimeframeAccuracy,
}

/// Score a window of snapshots, newest first, independently per timeframe.
///
/// A row is skipped when either label is missing/Neutral/Unknown, when
/// `change_pct` is missing, or when the rating did not transition. A
/// transition counts as correct only when it crossed sides in the
/// direction the subsequent price move confirmed.
pub fn score_window(rows: &[WindowRow]) -> AccuracySummary {
    AccuracySummary {
        daily: score_side(rows.iter().map(|r| {
            (r.daily_rating.as_deref(), r.daily_prev.as_deref(), r.change_pct)
        })),
        weekly: score_side(rows.iter().map(|r| {
            (r.weekly_rating.as_deref(), r.weekly_prev.as_deref(), r.change_pct)
        })),
    }
}

fn score_side<'a>(
    rows: impl Iterator<Item = (Option<&'a str>, Option<&'a str>, Option<f64>)>,
) -> TimeframeAccuracy {
    let mut out = TimeframeAccuracy::default();

    for (rating_label, prev_label, change_pct) in rows {
        let (Some(rating_label), Some(prev_label), Some(change_pct)) =
            (rating_label, prev_label, change_pct)
        else {
            continue;
        };
        if rating_label.is_empty() || prev_label.is_empty() {
            continue;
        }
        let rating = Rating::parse(rating_label);
        let prev = Rating::parse(prev_label);
        if matches!(rating, Rating::Neutral | Rating::Unknown)
            || matches!(prev, Rating::Neutral | Rating::Unknown)
        {
            continue;
        }

        if out.rating.is_none() {
            out.rating = Some(rating_label.to_string());
            out.prev = Some(prev_label.to_string());
        }

        if rating == prev {
            continue;
        }
        let correct = if prev.is_sell_side() && rating.is_buy_side() {
            change_pct > 0.0
        } else if prev.is_buy_side() && rating.is_sell_side() {
            change_pct < 0.0
        } else {
            // Same-side moves (Buy -> Strong Buy) are transitions that
            // never validate, matching the persisted metric's contract.
            false
        };
        if correct {
            out.correct += 1;
        } else {
            out.incorrect += 1;
        }
    }

    out.sample_size = out.correct + out.incorrect;
    out.accuracy = if out.sample_size > 0 {
        round2(out.correct as f64 / out.sample_size as f64 * 100.0)
    } else {
        0.0
    };
    out
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ── Persistence ──────────────────────────────────────────────────────────────

/// The snapshot that prompted a recompute, with its price context.
#[derive(Clone, Debug)]
pub struct SnapshotTrigger {
    pub ticker: String,
    pub timestamp: String,
    pub price: Option<f64>,
    pub change_pct: Option<f64>,
    pub currency: Option<String>,
    pub high: Option<f64>,
    pub low: Option<f64>,
}

impl SnapshotTrigger {
    pub fn from_point(ticker: &str, point: &SnapshotPoint) -> SnapshotTrigger {
        SnapshotTrigger {
            ticker: ticker.to_uppercase(),
            timestamp: point.timestamp.clone(),
            price: point.price,
            change_pct: point.change_pct,
            currency: point.currency.clone(),
            high: point.high,
            low: point.low,
        }
    }
}

/// Recompute the window ending at the trigger and upsert one
/// `rating_accuracy` row keyed by `(ticker, timestamp)`. Returns false
/// when the ticker has no history in the window.
pub async fn compute_and_store(
    store: &Store,
    trigger: &SnapshotTrigger,
    window_days: i64,
) -> anyhow::Result<bool> {
    let ticker = trigger.ticker.to_uppercase();
    let rows = store
        .history_window_desc(&ticker, &trigger.timestamp, window_days)
        .await
        .context("failed to read history window")?;
    if rows.is_empty() {
        return Ok(false);
    }

    let summary = score_window(&rows);
    let price_prev = store
        .prev_history_price(&ticker, &trigger.timestamp)
        .await
        .context("failed to read previous snapshot price")?;

    store
        .upsert_accuracy(&AccuracyRecord {
            ticker,
            timestamp: trigger.timestamp.clone(),
            price: trigger.price,
            price_prev,
            change_pct: trigger.change_pct,
            currency: trigger.currency.clone(),
            high: trigger.high,
            low: trigger.low,
            window_day: window_days,
            daily_rating: summary.daily.rating,
            daily_prev: summary.daily.prev,
            samplesize_daily: summary.daily.sample_size,
            correct_daily: summary.daily.correct,
            incorrect_daily: summary.daily.incorrect,
            accuracy_daily: summary.daily.accuracy,
            weekly_rating: summary.weekly.rating,
            weekly_prev: summary.weekly.prev,
            samplesize_weekly: summary.weekly.sample_size,
            correct_weekly: summary.weekly.correct,
            incorrect_weekly: summary.weekly.incorrect,
            accuracy_weekly: summary.weekly.accuracy,
        })
        .await
        .context("failed to upsert accuracy row")?;
    Ok(true)
}

/// Startup back-fill: recompute accuracy for every snapshot already in
/// `rating_history`, so restored databases serve metrics immediately.
pub async fn backfill_on_startup(store: &Store, token: &CancellationToken) -> anyhow::Result<()> {
    let pairs = store.snapshot_pairs().await?;
    if pairs.is_empty() {
        info!("[Accuracy] No snapshots to back-fill");
        return Ok(());
    }
    info!("[Accuracy] Back-filling {} snapshot rows", pairs.len());

    let mut populated = 0usize;
    let mut errors = 0usize;
    for (ticker, timestamp) in pairs {
        if token.is_cancelled() {
            info!("[Accuracy] Back-fill interrupted by shutdown");
            return Ok(());
        }
        let point = match store.snapshot_point(&ticker, &timestamp).await {
            Ok(Some(point)) => point,
            Ok(None) => continue,
            Err(e) => {
                errors += 1;
                warn!("[Accuracy] Failed to read snapshot {ticker}@{timestamp}: {e}");
                continue;
            }
        };
        let trigger = SnapshotTrigger::from_point(&ticker, &point);
        match compute_and_store(store, &trigger, DEFAULT_WINDOW_DAYS).await {
            Ok(_) => populated += 1,
            Err(e) => {
                errors += 1;
                warn!("[Accuracy] Back-fill failed for {ticker}@{timestamp}: {e:#}");
            }
        }
        if populated % 100 == 0 && populated > 0 {
            info!("[Accuracy] Back-fill progress: {populated} rows");
        }
    }
    info!("[Accuracy] Back-fill completed: {populated} rows, {errors} errors");
    Ok(())
}

// ── Frontend-logic accuracy (served, never persisted) ────────────────────────

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct FrontendAccuracy {
    pub accuracy: f64,
    pub correct: i64,
    pub incorrect: i64,
    pub total: i64,
}

/// The dashboard's own scoring rule: an unchanged rating is also a
/// signal (Buy-side expects the price up, Sell-side down), and a changed
/// rating is judged by whether the move and the price share a direction.
/// `filter_rating` restricts scoring to rows whose current rating matches.
pub fn frontend_accuracy<'a>(
    signals: impl IntoIterator<Item = (&'a str, &'a str, f64)>,
    filter_rating: Option<&str>,
) -> FrontendAccuracy {
    let mut out = FrontendAccuracy::default();

    for (rating_label, prev_label, change_pct) in signals {
        if rating_label.is_empty() || prev_label.is_empty() {
            continue;
        }
        if let Some(filter) = filter_rating {
            if !rating_label.eq_ignore_ascii_case(filter) {
                continue;
            }
        }

        let curr_score = Rating::parse(rating_label).score();
        let prev_score = Rating::parse(prev_label).score();
        let direction = curr_score - prev_score;
        let buy_side = curr_score >= 4;

        let correct = if direction == 0 {
            if buy_side { change_pct > 0.0 } else { change_pct < 0.0 }
        } else {
            (direction > 0 && change_pct > 0.0) || (direction < 0 && change_pct < 0.0)
        };
        if correct {
            out.correct += 1;
        } else {
            out.incorrect += 1;
        }
    }

    out.total = out.correct + out.incorrect;
    out.accuracy = if out.total > 0 {
        round2(out.correct as f64 / out.total as f64 * 100.0)
    } else {
        0.0
    };
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MarketData;
    use crate::market::MarketCode;
    use crate::rating::Rating;
    use crate::store::SnapshotRow;

    fn window_row(rating: &str, prev: &str, change_pct: Option<f64>) -> WindowRow {
        let opt = |s: &str| (!s.is_empty()).then(|| s.to_string());
        WindowRow {
            daily_rating: opt(rating),
            daily_prev: opt(prev),
            change_pct,
            weekly_rating: None,
            weekly_prev: None,
        }
    }

    #[test]
    fn scores_cross_side_transitions() {
        let rows = vec![
            window_row("Buy", "Sell", Some(1.2)),
            window_row("Sell", "Buy", Some(-0.3)),
            window_row("Buy", "Buy", Some(0.5)),
            window_row("Sell", "Strong Buy", Some(0.4)),
        ];
        let summary = score_window(&rows);
        assert_eq!(summary.daily.correct, 2);
        assert_eq!(summary.daily.incorrect, 1);
        assert_eq!(summary.daily.sample_size, 3);
        assert_eq!(summary.daily.accuracy, 66.67);
        // Weekly side of these rows is empty.
        assert_eq!(summary.weekly.sample_size, 0);
        assert_eq!(summary.weekly.accuracy, 0.0);
    }

    #[test]
    fn skips_neutral_unknown_and_missing() {
        let rows = vec![
            window_row("Neutral", "Buy", Some(1.0)),
            window_row("Buy", "Unknown", Some(1.0)),
            window_row("Buy", "Sell", None),
            window_row("", "Sell", Some(1.0)),
        ];
        let summary = score_window(&rows);
        assert_eq!(summary.daily.sample_size, 0);
        assert!(summary.daily.rating.is_none());
    }

    #[test]
    fn latest_qualifying_labels_are_kept() {
        // Rows arrive newest first; the first row that survives the
        // missing/neutral filters supplies the display labels, even when
        // it is a no-transition row.
        let rows = vec![
            window_row("Neutral", "Buy", Some(1.0)),
            window_row("Strong Buy", "Strong Buy", Some(0.2)),
            window_row("Buy", "Sell", Some(1.0)),
        ];
        let summary = score_window(&rows);
        assert_eq!(summary.daily.rating.as_deref(), Some("Strong Buy"));
        assert_eq!(summary.daily.prev.as_deref(), Some("Strong Buy"));
        assert_eq!(summary.daily.sample_size, 1);
        assert_eq!(summary.daily.correct, 1);
    }

    #[test]
    fn same_side_moves_count_incorrect() {
        let rows = vec![window_row("Strong Buy", "Buy", Some(5.0))];
        let summary = score_window(&rows);
        assert_eq!(summary.daily.incorrect, 1);
        assert_eq!(summary.daily.correct, 0);
    }

    #[test]
    fn frontend_logic_scores_unchanged_ratings() {
        let signals = vec![
            ("Buy", "Buy", 1.0),    // buy-side, price up -> correct
            ("Buy", "Buy", -1.0),   // buy-side, price down -> incorrect
            ("Sell", "Sell", -2.0), // sell-side, price down -> correct
            ("Buy", "Sell", 1.5),   // upgraded, price up -> correct
            ("Sell", "Buy", 0.5),   // downgraded, price up -> incorrect
        ];
        let result = frontend_accuracy(signals, None);
        assert_eq!(result.correct, 3);
        assert_eq!(result.incorrect, 2);
        assert_eq!(result.total, 5);
        assert_eq!(result.accuracy, 60.0);
    }

    #[test]
    fn frontend_filter_restricts_to_current_rating() {
        let signals = vec![
            ("Buy", "Buy", 1.0),
            ("Sell", "Sell", -2.0),
            ("Buy", "Sell", -1.5),
        ];
        let result = frontend_accuracy(signals, Some("buy"));
        assert_eq!(result.total, 2);
        assert_eq!(result.correct, 1);
        assert_eq!(result.incorrect, 1);
    }

    fn snapshot(ticker: &str, ts: &str, daily: Rating, prev_pct: f64, price: f64) -> SnapshotRow {
        SnapshotRow {
            ticker: ticker.to_string(),
            timestamp: ts.to_string(),
            date: ts[..10].to_string(),
            daily_val: Some(0.2),
            daily_rating: daily,
            weekly_val: Some(0.2),
            weekly_rating: daily,
            exchange: "NASDAQ".to_string(),
            market: MarketCode::Us,
            market_data: MarketData {
                currency: "USD".to_string(),
                price: Some(price),
                change_pct: Some(prev_pct),
                change_abs: None,
                high: None,
                low: None,
            },
        }
    }

    #[tokio::test]
    async fn compute_and_store_persists_one_row_per_trigger() -> anyhow::Result<()> {
        let store = Store::open_memory().await?;
        store
            .insert_snapshots(&[
                snapshot("X", "2024-06-03T03:00:00.000000", Rating::Sell, -0.4, 10.0),
                snapshot("X", "2024-06-04T03:00:00.000000", Rating::Buy, 1.2, 11.0),
            ])
            .await?;

        let point = store.latest_snapshot_point("X").await?.unwrap();
        let trigger = SnapshotTrigger::from_point("X", &point);
        assert!(compute_and_store(&store, &trigger, 90).await?);

        let rows = store.accuracy_rows_desc("X").await?;
        assert_eq!(rows.len(), 1);
        let rec = &rows[0];
        // Day 2 transitioned Sell -> Buy with a positive move.
        assert_eq!(rec.correct_daily, 1);
        assert_eq!(rec.incorrect_daily, 0);
        assert_eq!(rec.accuracy_daily, 100.0);
        assert_eq!(rec.price_prev, Some(10.0));
        assert_eq!(rec.window_day, 90);
        Ok(())
    }

    #[tokio::test]
    async fn backfill_covers_every_snapshot() -> anyhow::Result<()> {
        let store = Store::open_memory().await?;
        store
            .insert_snapshots(&[
                snapshot("X", "2024-06-03T03:00:00.000000", Rating::Sell, -0.4, 10.0),
                snapshot("X", "2024-06-04T03:00:00.000000", Rating::Buy, 1.2, 11.0),
                snapshot("Y", "2024-06-04T03:00:00.000000", Rating::Buy, 0.2, 5.0),
            ])
            .await?;

        backfill_on_startup(&store, &CancellationToken::new()).await?;
        assert_eq!(store.accuracy_rows_desc("X").await?.len(), 2);
        assert_eq!(store.accuracy_rows_desc("Y").await?.len(), 1);
        Ok(())
    }
}
