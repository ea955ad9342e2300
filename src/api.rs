use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use chrono_tz::Asia::Bangkok;
use log::{error, info};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::accuracy::{self, FrontendAccuracy, SnapshotTrigger};
use crate::config::Config;
use crate::store::{AccuracyRecord, MainRow, Store};

#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<Config>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/ratings/from-dr-api", get(ratings_from_dr_api))
        .route("/ratings/history-with-accuracy/{ticker}", get(history_with_accuracy))
        .route("/ratings/recalculate-accuracy/{ticker}", post(recalculate_accuracy))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── GET / ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    message: &'static str,
}

async fn root() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        message: "Ratings API is running",
    })
}

// ── GET /ratings/from-dr-api ─────────────────────────────────────────────────

#[derive(Serialize)]
struct RatingsResponse {
    updated_at: String,
    count: usize,
    rows: Vec<TickerRatings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct TickerRatings {
    ticker: String,
    currency: String,
    price: Option<f64>,
    #[serde(rename = "changePercent")]
    change_percent: Option<f64>,
    change: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    daily: TimeframeState,
    weekly: TimeframeState,
}

#[derive(Serialize)]
struct TimeframeState {
    recommend_all: Option<f64>,
    rating: String,
    prev: String,
    changed_at: Option<String>,
    history: Vec<HistoryEntry>,
}

#[derive(Serialize)]
struct HistoryEntry {
    rating: String,
    timestamp: String,
}

/// Merged current state plus per-timeframe change histories for every
/// tracked ticker. A transiently locked database degrades to an empty
/// row set with an `error` string so the dashboard keeps rendering.
async fn ratings_from_dr_api(State(state): State<ApiState>) -> Json<RatingsResponse> {
    let updated_at = db_updated_at(&state.config.db_file);
    match build_ratings(&state, updated_at.clone()).await {
        Ok(response) => Json(response),
        Err(e) => {
            error!("[API] from-dr-api failed: {e:#}");
            Json(RatingsResponse {
                updated_at,
                count: 0,
                rows: Vec::new(),
                error: Some(e.to_string()),
            })
        }
    }
}

async fn build_ratings(state: &ApiState, updated_at: String) -> anyhow::Result<RatingsResponse> {
    let store = Store::open_read(&state.config.db_file).await?;
    let tickers = store.main_tickers().await.context("listing tickers")?;

    let mut rows = Vec::with_capacity(tickers.len());
    for ticker in tickers {
        let Some(main) = store.latest_main_row(&ticker).await? else {
            continue;
        };
        let history = store.history_labels_asc(&ticker).await?;

        let daily_history = history
            .iter()
            .filter_map(|h| {
                Some(HistoryEntry {
                    rating: h.daily_rating.clone().filter(|r| !r.is_empty())?,
                    timestamp: h.daily_changed_at.clone().filter(|t| !t.is_empty())?,
                })
            })
            .collect();
        let weekly_history = history
            .iter()
            .filter_map(|h| {
                Some(HistoryEntry {
                    rating: h.weekly_rating.clone().filter(|r| !r.is_empty())?,
                    timestamp: h.weekly_changed_at.clone().filter(|t| !t.is_empty())?,
                })
            })
            .collect();

        rows.push(ticker_ratings(ticker, &main, daily_history, weekly_history));
    }
    store.close().await;

    Ok(RatingsResponse {
        count: rows.len(),
        rows,
        updated_at,
        error: None,
    })
}

fn ticker_ratings(
    ticker: String,
    main: &MainRow,
    daily_history: Vec<HistoryEntry>,
    weekly_history: Vec<HistoryEntry>,
) -> TickerRatings {
    let label = |value: &Option<String>| {
        value
            .clone()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "Unknown".to_string())
    };
    TickerRatings {
        ticker,
        currency: main.currency.clone().unwrap_or_default(),
        price: main.price,
        change_percent: main.change_pct,
        change: main.change_abs,
        high: main.high,
        low: main.low,
        daily: TimeframeState {
            recommend_all: main.daily_val,
            rating: label(&main.daily_rating),
            prev: label(&main.daily_prev),
            changed_at: main.daily_changed_at.clone(),
            history: daily_history,
        },
        weekly: TimeframeState {
            recommend_all: main.weekly_val,
            rating: label(&main.weekly_rating),
            prev: label(&main.weekly_prev),
            changed_at: main.weekly_changed_at.clone(),
            history: weekly_history,
        },
    }
}

/// `updated_at` is the database file's mtime rendered in Bangkok time,
/// "-" when the file does not exist yet.
fn db_updated_at(db_file: &str) -> String {
    std::fs::metadata(db_file)
        .and_then(|meta| meta.modified())
        .map(|mtime| {
            DateTime::<Utc>::from(mtime)
                .with_timezone(&Bangkok)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|_| "-".to_string())
}

// ── GET /ratings/history-with-accuracy/{ticker} ──────────────────────────────

fn default_timeframe() -> String {
    "1D".to_string()
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_timeframe")]
    timeframe: String,
    filter_rating: Option<String>,
}

#[derive(Serialize)]
struct HistoryResponse {
    ticker: String,
    currency: String,
    price: f64,
    #[serde(rename = "changePercent")]
    change_percent: f64,
    change: f64,
    high: f64,
    low: f64,
    current_rating: String,
    prev_rating: String,
    history: Vec<HistoryItem>,
    accuracy: FrontendAccuracy,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct HistoryItem {
    rating: String,
    prev: String,
    timestamp: String,
    date: String,
    prev_close: f64,
    result_price: f64,
    change_pct: f64,
    change_abs: f64,
}

impl HistoryResponse {
    fn empty(ticker: String, error: Option<String>) -> HistoryResponse {
        HistoryResponse {
            ticker,
            currency: String::new(),
            price: 0.0,
            change_percent: 0.0,
            change: 0.0,
            high: 0.0,
            low: 0.0,
            current_rating: "Unknown".to_string(),
            prev_rating: "Unknown".to_string(),
            history: Vec::new(),
            accuracy: FrontendAccuracy::default(),
            error,
        }
    }
}

async fn history_with_accuracy(
    State(state): State<ApiState>,
    Path(ticker): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Json<HistoryResponse> {
    let ticker = ticker.to_uppercase();
    match build_history(&state, &ticker, &query).await {
        Ok(response) => Json(response),
        Err(e) => {
            error!("[API] history-with-accuracy failed for {ticker}: {e:#}");
            Json(HistoryResponse::empty(ticker, Some(e.to_string())))
        }
    }
}

async fn build_history(
    state: &ApiState,
    ticker: &str,
    query: &HistoryQuery,
) -> anyhow::Result<HistoryResponse> {
    let store = Store::open_read(&state.config.db_file).await?;
    let acc_rows = store.accuracy_rows_desc(ticker).await?;
    store.close().await;

    let Some(latest) = acc_rows.first() else {
        return Ok(HistoryResponse::empty(ticker.to_string(), None));
    };

    let weekly = query.timeframe.eq_ignore_ascii_case("1W");
    let history = history_items(&acc_rows, weekly);
    let accuracy = accuracy::frontend_accuracy(
        history
            .iter()
            .map(|item| (item.rating.as_str(), item.prev.as_str(), item.change_pct)),
        query.filter_rating.as_deref(),
    );

    let (current_rating, prev_rating) = timeframe_labels(latest, weekly);
    let price = latest.price.unwrap_or_default();
    let change_pct = latest.change_pct.unwrap_or_default();
    // change_abs is reconstructed from the percent move.
    let change_abs = if price != 0.0 && change_pct != 0.0 {
        price - price / (1.0 + change_pct / 100.0)
    } else {
        0.0
    };

    Ok(HistoryResponse {
        ticker: ticker.to_string(),
        currency: latest.currency.clone().unwrap_or_default(),
        price,
        change_percent: change_pct,
        change: change_abs,
        high: latest.high.unwrap_or_default(),
        low: latest.low.unwrap_or_default(),
        current_rating,
        prev_rating,
        history,
        accuracy,
        error: None,
    })
}

fn timeframe_labels(row: &AccuracyRecord, weekly: bool) -> (String, String) {
    let (rating, prev) = if weekly {
        (&row.weekly_rating, &row.weekly_prev)
    } else {
        (&row.daily_rating, &row.daily_prev)
    };
    let or_unknown = |v: &Option<String>| {
        v.clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "Unknown".to_string())
    };
    (or_unknown(rating), or_unknown(prev))
}

/// Rows the dashboard can chart: Neutral/Unknown entries and entries with
/// an Unknown prev are dropped; missing prices degrade to zeros.
fn history_items(rows: &[AccuracyRecord], weekly: bool) -> Vec<HistoryItem> {
    rows.iter()
        .filter_map(|row| {
            let (rating, prev) = if weekly {
                (&row.weekly_rating, &row.weekly_prev)
            } else {
                (&row.daily_rating, &row.daily_prev)
            };
            let rating = rating.clone().filter(|r| !r.is_empty())?;
            let lower = rating.to_lowercase();
            if lower == "neutral" || lower == "unknown" {
                return None;
            }
            if let Some(prev) = prev {
                if prev.is_empty() || prev.eq_ignore_ascii_case("unknown") {
                    return None;
                }
            }

            let price = row.price.unwrap_or_default();
            let prev_close = row.price_prev.unwrap_or_default();
            let change_abs = if price != 0.0 && prev_close != 0.0 {
                price - prev_close
            } else {
                0.0
            };
            Some(HistoryItem {
                rating,
                prev: prev.clone().unwrap_or_else(|| "Unknown".to_string()),
                timestamp: row.timestamp.clone(),
                date: row.timestamp.clone(),
                prev_close,
                result_price: price,
                change_pct: row.change_pct.unwrap_or_default(),
                change_abs,
            })
        })
        .collect()
}

// ── POST /ratings/recalculate-accuracy/{ticker} ──────────────────────────────

#[derive(Debug, Deserialize)]
struct RecalcQuery {
    #[serde(default = "default_timeframe")]
    timeframe: String,
    #[serde(default = "accuracy_window_default")]
    window_days: i64,
}

fn accuracy_window_default() -> i64 {
    accuracy::DEFAULT_WINDOW_DAYS
}

#[derive(Serialize)]
struct RecalcResponse {
    status: &'static str,
    message: String,
    ticker: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeframe: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    window_days: Option<i64>,
}

/// Force an accuracy recompute for a ticker's most recent snapshot. The
/// persisted row always carries both timeframes; the query's timeframe is
/// echoed back for the caller's benefit.
async fn recalculate_accuracy(
    State(state): State<ApiState>,
    Path(ticker): Path<String>,
    Query(query): Query<RecalcQuery>,
) -> Json<RecalcResponse> {
    let ticker = ticker.to_uppercase();
    match run_recalc(&state, &ticker, query.window_days).await {
        Ok(true) => {
            info!("[API] Recalculated accuracy for {ticker} ({} days)", query.window_days);
            Json(RecalcResponse {
                status: "success",
                message: format!("Accuracy recalculated for {ticker}"),
                ticker,
                timeframe: Some(query.timeframe),
                window_days: Some(query.window_days),
            })
        }
        Ok(false) => Json(RecalcResponse {
            status: "error",
            message: format!("No rating history found for {ticker}"),
            ticker,
            timeframe: Some(query.timeframe),
            window_days: Some(query.window_days),
        }),
        Err(e) => {
            error!("[API] recalculate-accuracy failed for {ticker}: {e:#}");
            Json(RecalcResponse {
                status: "error",
                message: e.to_string(),
                ticker,
                timeframe: None,
                window_days: None,
            })
        }
    }
}

async fn run_recalc(state: &ApiState, ticker: &str, window_days: i64) -> anyhow::Result<bool> {
    let store = Store::connect(&state.config.db_file, Duration::from_secs(2)).await?;
    let Some(point) = store.latest_snapshot_point(ticker).await? else {
        store.close().await;
        return Ok(false);
    };
    let trigger = SnapshotTrigger::from_point(ticker, &point);
    let result = accuracy::compute_and_store(&store, &trigger, window_days).await;
    store.close().await;
    result
}

#[cfg(test)]
mod test {
    use super::*;

    fn acc_row(ts: &str, daily: Option<&str>, daily_prev: Option<&str>) -> AccuracyRecord {
        AccuracyRecord {
            ticker: "X".to_string(),
            timestamp: ts.to_string(),
            price: Some(11.0),
            price_prev: Some(10.0),
            change_pct: Some(1.5),
            currency: Some("USD".to_string()),
            high: Some(11.5),
            low: Some(10.5),
            window_day: 90,
            daily_rating: daily.map(str::to_string),
            daily_prev: daily_prev.map(str::to_string),
            samplesize_daily: 0,
            correct_daily: 0,
            incorrect_daily: 0,
            accuracy_daily: 0.0,
            weekly_rating: None,
            weekly_prev: None,
            samplesize_weekly: 0,
            correct_weekly: 0,
            incorrect_weekly: 0,
            accuracy_weekly: 0.0,
        }
    }

    #[test]
    fn history_items_skip_neutral_and_unknown() {
        let rows = vec![
            acc_row("2024-06-05T03:00:00", Some("Buy"), Some("Sell")),
            acc_row("2024-06-04T03:00:00", Some("Neutral"), Some("Buy")),
            acc_row("2024-06-03T03:00:00", Some("Buy"), Some("Unknown")),
            acc_row("2024-06-02T03:00:00", None, Some("Buy")),
            acc_row("2024-06-01T03:00:00", Some("Sell"), None),
        ];
        let items = history_items(&rows, false);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].rating, "Buy");
        assert_eq!(items[0].prev, "Sell");
        assert_eq!(items[0].prev_close, 10.0);
        assert_eq!(items[0].change_abs, 1.0);
        // A NULL prev is served as "Unknown" rather than dropped.
        assert_eq!(items[1].rating, "Sell");
        assert_eq!(items[1].prev, "Unknown");
    }

    #[test]
    fn history_items_zero_out_missing_prices() {
        let mut row = acc_row("2024-06-05T03:00:00", Some("Buy"), Some("Sell"));
        row.price = None;
        row.price_prev = None;
        let items = history_items(&[row], false);
        assert_eq!(items[0].result_price, 0.0);
        assert_eq!(items[0].prev_close, 0.0);
        assert_eq!(items[0].change_abs, 0.0);
    }

    #[test]
    fn timeframe_labels_default_to_unknown() {
        let row = acc_row("2024-06-05T03:00:00", None, None);
        let (rating, prev) = timeframe_labels(&row, false);
        assert_eq!(rating, "Unknown");
        assert_eq!(prev, "Unknown");
    }
}
