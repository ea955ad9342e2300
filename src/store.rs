use std::time::Duration;

use anyhow::Context;
use log::{info, warn};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{FromRow, Row, SqlitePool};

use crate::MarketData;
use crate::market::MarketCode;
use crate::rating::Rating;

/// Busy timeout for the long-lived writer pool.
const WRITE_BUSY_TIMEOUT: Duration = Duration::from_secs(30);
/// Busy timeout for facade read connections; a locked database turns into
/// an empty response, not a stalled dashboard.
const READ_BUSY_TIMEOUT: Duration = Duration::from_secs(1);

// ── Row shapes ───────────────────────────────────────────────────────────────

/// One successful live fetch, ready to be recorded.
#[derive(Clone, Debug)]
pub struct LiveObservation {
    pub ticker: String,
    pub daily_val: Option<f64>,
    pub daily_rating: Rating,
    pub weekly_val: Option<f64>,
    pub weekly_rating: Rating,
    pub market_data: MarketData,
}

/// One end-of-day snapshot destined for `rating_history`.
#[derive(Clone, Debug)]
pub struct SnapshotRow {
    pub ticker: String,
    pub timestamp: String,
    pub date: String,
    pub daily_val: Option<f64>,
    pub daily_rating: Rating,
    pub weekly_val: Option<f64>,
    pub weekly_rating: Rating,
    pub exchange: String,
    pub market: MarketCode,
    pub market_data: MarketData,
}

/// Latest `rating_main` state for a ticker, as served by the facade.
#[derive(Clone, Debug, FromRow)]
pub struct MainRow {
    pub timestamp: String,
    pub daily_val: Option<f64>,
    pub daily_rating: Option<String>,
    pub daily_prev: Option<String>,
    pub daily_changed_at: Option<String>,
    pub weekly_val: Option<f64>,
    pub weekly_rating: Option<String>,
    pub weekly_prev: Option<String>,
    pub weekly_changed_at: Option<String>,
    pub currency: Option<String>,
    pub price: Option<f64>,
    pub change_pct: Option<f64>,
    pub change_abs: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
}

/// Label/timestamp projection of `rating_history` for change histories.
#[derive(Clone, Debug, FromRow)]
pub struct HistoryLabelRow {
    pub timestamp: String,
    pub daily_rating: Option<String>,
    pub daily_changed_at: Option<String>,
    pub weekly_rating: Option<String>,
    pub weekly_changed_at: Option<String>,
}

/// Projection of `rating_history` consumed by the accuracy calculator.
#[derive(Clone, Debug, FromRow)]
pub struct WindowRow {
    pub daily_rating: Option<String>,
    pub daily_prev: Option<String>,
    pub change_pct: Option<f64>,
    pub weekly_rating: Option<String>,
    pub weekly_prev: Option<String>,
}

/// Price context of a single snapshot, used when (re)computing accuracy.
#[derive(Clone, Debug, FromRow)]
pub struct SnapshotPoint {
    pub timestamp: String,
    pub price: Option<f64>,
    pub change_pct: Option<f64>,
    pub currency: Option<String>,
    pub high: Option<f64>,
    pub low: Option<f64>,
}

/// Persisted accuracy row, keyed by `(ticker, timestamp)`.
#[derive(Clone, Debug, FromRow)]
pub struct AccuracyRecord {
    pub ticker: String,
    pub timestamp: String,
    pub price: Option<f64>,
    pub price_prev: Option<f64>,
    pub change_pct: Option<f64>,
    pub currency: Option<String>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub window_day: i64,
    pub daily_rating: Option<String>,
    pub daily_prev: Option<String>,
    pub samplesize_daily: i64,
    pub correct_daily: i64,
    pub incorrect_daily: i64,
    pub accuracy_daily: f64,
    pub weekly_rating: Option<String>,
    pub weekly_prev: Option<String>,
    pub samplesize_weekly: i64,
    pub correct_weekly: i64,
    pub incorrect_weekly: i64,
    pub accuracy_weekly: f64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CleanupCounts {
    pub stats: u64,
    pub main: u64,
    pub history: u64,
    pub accuracy: u64,
}

impl CleanupCounts {
    pub fn total(self) -> u64 {
        self.stats + self.main + self.history + self.accuracy
    }
}

/// True when the error is SQLite's writer-contention signal.
pub fn is_locked(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db)
        if db.message().contains("locked") || db.message().contains("busy"))
}

// ── Store ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open the main writer store: WAL, 30 s busy timeout, 64 MB page
    /// cache. Runs the schema inspection/migration pass.
    pub async fn open(db_file: &str) -> anyhow::Result<Store> {
        let store = Self::connect_with(db_file, WRITE_BUSY_TIMEOUT, 4).await?;
        store.init_schema().await?;
        Ok(store)
    }

    /// A separate single-connection store with a caller-chosen busy
    /// timeout. Market-close snapshotters and per-ticker accuracy writers
    /// use this so no task holds the write lock behind a 30 s wait.
    pub async fn connect(db_file: &str, busy_timeout: Duration) -> anyhow::Result<Store> {
        Self::connect_with(db_file, busy_timeout, 1).await
    }

    /// Fresh read connection for HTTP handlers.
    pub async fn open_read(db_file: &str) -> anyhow::Result<Store> {
        Self::connect_with(db_file, READ_BUSY_TIMEOUT, 1).await
    }

    /// In-memory store for tests. Single connection, since every SQLite
    /// `:memory:` connection is its own database.
    pub async fn open_memory() -> anyhow::Result<Store> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;
        let store = Store { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn connect_with(
        db_file: &str,
        busy_timeout: Duration,
        max_connections: u32,
    ) -> anyhow::Result<Store> {
        let options = SqliteConnectOptions::new()
            .filename(db_file)
            .create_if_missing(true)
            .busy_timeout(busy_timeout)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("cache_size", "-65536");

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open SQLite database: {db_file}"))?;
        Ok(Store { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ── Schema inspection / migration ────────────────────────────────────

    /// Startup schema contract: legacy per-timeframe tables are dropped and
    /// recreated; new nullable columns on `rating_history` are ALTER-ADDed
    /// in place; everything else is `CREATE TABLE IF NOT EXISTS`.
    async fn init_schema(&self) -> anyhow::Result<()> {
        for table in ["rating_stats", "rating_main", "rating_history"] {
            if self.table_exists(table).await? && !self.has_combined_shape(table).await? {
                warn!("Legacy schema detected on {table}, dropping and recreating");
                sqlx::query(&format!("DROP TABLE {table}"))
                    .execute(&self.pool)
                    .await?;
            }
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rating_stats (
                ticker TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                daily_val REAL,
                daily_rating TEXT,
                daily_changed_at TEXT,
                weekly_val REAL,
                weekly_rating TEXT,
                weekly_changed_at TEXT,
                PRIMARY KEY (ticker, timestamp)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rating_main (
                ticker TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                daily_val REAL,
                daily_rating TEXT,
                daily_prev TEXT,
                daily_changed_at TEXT,
                weekly_val REAL,
                weekly_rating TEXT,
                weekly_prev TEXT,
                weekly_changed_at TEXT,
                currency TEXT,
                price REAL,
                change_pct REAL,
                change_abs REAL,
                high REAL,
                low REAL,
                PRIMARY KEY (ticker, timestamp)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_rating_main_ticker_timestamp
             ON rating_main(ticker, timestamp DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rating_history (
                ticker TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                daily_val REAL,
                daily_rating TEXT,
                daily_prev TEXT,
                daily_changed_at TEXT,
                weekly_val REAL,
                weekly_rating TEXT,
                weekly_prev TEXT,
                weekly_changed_at TEXT,
                exchange TEXT,
                market TEXT,
                currency TEXT,
                price REAL,
                change_pct REAL,
                change_abs REAL,
                high REAL,
                low REAL,
                PRIMARY KEY (ticker, timestamp)
            )",
        )
        .execute(&self.pool)
        .await?;

        // Databases created before the market-data columns existed get
        // them added in place; history is the one table worth preserving.
        let existing = self.table_columns("rating_history").await?;
        for (name, ty) in [
            ("exchange", "TEXT"),
            ("market", "TEXT"),
            ("currency", "TEXT"),
            ("price", "REAL"),
            ("change_pct", "REAL"),
            ("change_abs", "REAL"),
            ("high", "REAL"),
            ("low", "REAL"),
        ] {
            if !existing.iter().any(|c| c == name) {
                sqlx::query(&format!("ALTER TABLE rating_history ADD COLUMN {name} {ty}"))
                    .execute(&self.pool)
                    .await?;
            }
        }

        if self.table_exists("rating_accuracy").await? {
            let cols = self.table_columns("rating_accuracy").await?;
            let has = |name: &str| cols.iter().any(|c| c == name);
            if has("timeframe")
                || !has("currency")
                || !has("high")
                || !has("low")
                || !has("price_prev")
            {
                warn!("Legacy rating_accuracy schema detected, dropping and recreating");
                sqlx::query("DROP TABLE rating_accuracy")
                    .execute(&self.pool)
                    .await?;
            }
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rating_accuracy (
                ticker TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                price REAL,
                price_prev REAL,
                change_pct REAL,
                currency TEXT,
                high REAL,
                low REAL,
                window_day INTEGER NOT NULL,
                daily_rating TEXT,
                daily_prev TEXT,
                samplesize_daily INTEGER NOT NULL,
                correct_daily INTEGER NOT NULL,
                incorrect_daily INTEGER NOT NULL,
                accuracy_daily REAL NOT NULL,
                weekly_rating TEXT,
                weekly_prev TEXT,
                samplesize_weekly INTEGER NOT NULL,
                correct_weekly INTEGER NOT NULL,
                incorrect_weekly INTEGER NOT NULL,
                accuracy_weekly REAL NOT NULL,
                PRIMARY KEY (ticker, timestamp)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_rating_accuracy_ticker_timestamp
             ON rating_accuracy(ticker, timestamp DESC)",
        )
        .execute(&self.pool)
        .await?;

        info!("SQLite schema initialized");
        Ok(())
    }

    async fn table_exists(&self, name: &str) -> sqlx::Result<bool> {
        let row = sqlx::query("SELECT name FROM sqlite_master WHERE type='table' AND name=?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn table_columns(&self, name: &str) -> sqlx::Result<Vec<String>> {
        let rows = sqlx::query(&format!("PRAGMA table_info({name})"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| r.try_get::<String, _>("name")).collect()
    }

    /// Current layout keeps daily and weekly side by side in one row; the
    /// legacy layout had a `timeframe` discriminator column instead.
    async fn has_combined_shape(&self, name: &str) -> sqlx::Result<bool> {
        let cols = self.table_columns(name).await?;
        let has = |name: &str| cols.iter().any(|c| c == name);
        Ok(has("daily_rating") && has("weekly_rating") && !has("timeframe"))
    }

    // ── Live tier: rating_stats + rating_main ────────────────────────────

    /// Record one fan-out batch in a single transaction. Returns how many
    /// observations produced at least one new row.
    pub async fn record_live_batch(
        &self,
        timestamp: &str,
        batch: &[LiveObservation],
    ) -> anyhow::Result<usize> {
        let mut tx = self.pool.begin().await.context("begin live batch")?;
        let mut written = 0;
        for obs in batch {
            let stats = upsert_stats(&mut tx, timestamp, obs).await?;
            let main = upsert_main(&mut tx, timestamp, obs).await?;
            if stats || main {
                written += 1;
            }
        }
        tx.commit().await.context("commit live batch")?;
        Ok(written)
    }

    // ── Snapshot tier: rating_history ────────────────────────────────────

    pub async fn snapshot_exists(&self, ticker: &str, date: &str) -> sqlx::Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM rating_history
             WHERE ticker=?1 AND strftime('%Y-%m-%d', timestamp)=?2
             LIMIT 1",
        )
        .bind(ticker)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Insert a batch of snapshots in one transaction, at most one row per
    /// `(ticker, local date)`. Returns the number actually inserted.
    pub async fn insert_snapshots(&self, rows: &[SnapshotRow]) -> anyhow::Result<usize> {
        let mut tx = self.pool.begin().await.context("begin snapshot batch")?;
        let mut inserted = 0;
        for snap in rows {
            if insert_snapshot(&mut tx, snap).await? {
                inserted += 1;
            }
        }
        tx.commit().await.context("commit snapshot batch")?;
        Ok(inserted)
    }

    pub async fn history_labels_asc(&self, ticker: &str) -> sqlx::Result<Vec<HistoryLabelRow>> {
        sqlx::query_as::<_, HistoryLabelRow>(
            "SELECT timestamp, daily_rating, daily_changed_at, weekly_rating, weekly_changed_at
             FROM rating_history
             WHERE ticker=?1
             ORDER BY timestamp ASC",
        )
        .bind(ticker)
        .fetch_all(&self.pool)
        .await
    }

    /// Snapshot rows inside the accuracy window ending at `end_ts`,
    /// newest first.
    pub async fn history_window_desc(
        &self,
        ticker: &str,
        end_ts: &str,
        window_days: i64,
    ) -> sqlx::Result<Vec<WindowRow>> {
        sqlx::query_as::<_, WindowRow>(&format!(
            "SELECT daily_rating, daily_prev, change_pct, weekly_rating, weekly_prev
             FROM rating_history
             WHERE ticker=?1 AND timestamp >= datetime(?2, '-{window_days} days')
             ORDER BY timestamp DESC"
        ))
        .bind(ticker)
        .bind(end_ts)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn prev_history_price(
        &self,
        ticker: &str,
        before_ts: &str,
    ) -> sqlx::Result<Option<f64>> {
        let row = sqlx::query(
            "SELECT price FROM rating_history
             WHERE ticker=?1 AND timestamp < ?2
             ORDER BY timestamp DESC
             LIMIT 1",
        )
        .bind(ticker)
        .bind(before_ts)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get::<Option<f64>, _>("price")).transpose().map(Option::flatten)
    }

    pub async fn snapshot_point(
        &self,
        ticker: &str,
        timestamp: &str,
    ) -> sqlx::Result<Option<SnapshotPoint>> {
        sqlx::query_as::<_, SnapshotPoint>(
            "SELECT timestamp, price, change_pct, currency, high, low
             FROM rating_history
             WHERE ticker=?1 AND timestamp=?2
             LIMIT 1",
        )
        .bind(ticker)
        .bind(timestamp)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn latest_snapshot_point(&self, ticker: &str) -> sqlx::Result<Option<SnapshotPoint>> {
        sqlx::query_as::<_, SnapshotPoint>(
            "SELECT timestamp, price, change_pct, currency, high, low
             FROM rating_history
             WHERE ticker=?1
             ORDER BY timestamp DESC
             LIMIT 1",
        )
        .bind(ticker)
        .fetch_optional(&self.pool)
        .await
    }

    /// Every `(ticker, timestamp)` snapshot pair, for the startup
    /// accuracy back-fill.
    pub async fn snapshot_pairs(&self) -> sqlx::Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT DISTINCT ticker, timestamp FROM rating_history
             ORDER BY ticker, timestamp DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| Ok((r.try_get("ticker")?, r.try_get("timestamp")?)))
            .collect()
    }

    // ── Accuracy tier ────────────────────────────────────────────────────

    pub async fn upsert_accuracy(&self, rec: &AccuracyRecord) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO rating_accuracy
             (ticker, timestamp, price, price_prev, change_pct, currency, high, low, window_day,
              daily_rating, daily_prev, samplesize_daily, correct_daily, incorrect_daily, accuracy_daily,
              weekly_rating, weekly_prev, samplesize_weekly, correct_weekly, incorrect_weekly, accuracy_weekly)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
        )
        .bind(&rec.ticker)
        .bind(&rec.timestamp)
        .bind(rec.price)
        .bind(rec.price_prev)
        .bind(rec.change_pct)
        .bind(rec.currency.as_deref().unwrap_or_default())
        .bind(rec.high)
        .bind(rec.low)
        .bind(rec.window_day)
        .bind(&rec.daily_rating)
        .bind(&rec.daily_prev)
        .bind(rec.samplesize_daily)
        .bind(rec.correct_daily)
        .bind(rec.incorrect_daily)
        .bind(rec.accuracy_daily)
        .bind(&rec.weekly_rating)
        .bind(&rec.weekly_prev)
        .bind(rec.samplesize_weekly)
        .bind(rec.correct_weekly)
        .bind(rec.incorrect_weekly)
        .bind(rec.accuracy_weekly)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn accuracy_rows_desc(&self, ticker: &str) -> sqlx::Result<Vec<AccuracyRecord>> {
        sqlx::query_as::<_, AccuracyRecord>(
            "SELECT ticker, timestamp, price, price_prev, change_pct, currency, high, low, window_day,
                    daily_rating, daily_prev, samplesize_daily, correct_daily, incorrect_daily, accuracy_daily,
                    weekly_rating, weekly_prev, samplesize_weekly, correct_weekly, incorrect_weekly, accuracy_weekly
             FROM rating_accuracy
             WHERE ticker=?1
             ORDER BY timestamp DESC",
        )
        .bind(ticker)
        .fetch_all(&self.pool)
        .await
    }

    // ── Facade reads ─────────────────────────────────────────────────────

    pub async fn main_tickers(&self) -> sqlx::Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT ticker FROM rating_main ORDER BY ticker")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| r.try_get("ticker")).collect()
    }

    pub async fn latest_main_row(&self, ticker: &str) -> sqlx::Result<Option<MainRow>> {
        sqlx::query_as::<_, MainRow>(
            "SELECT timestamp, daily_val, daily_rating, daily_prev, daily_changed_at,
                    weekly_val, weekly_rating, weekly_prev, weekly_changed_at,
                    currency, price, change_pct, change_abs, high, low
             FROM rating_main
             WHERE ticker=?1
             ORDER BY timestamp DESC
             LIMIT 1",
        )
        .bind(ticker)
        .fetch_optional(&self.pool)
        .await
    }

    // ── Retention ────────────────────────────────────────────────────────

    /// Delete, from all four tables, the rows whose Bangkok-local date
    /// equals `target_date` (today minus 30 days at the call site). The
    /// expiry is one specific day, executed daily.
    pub async fn cleanup_expired(&self, target_date: &str) -> anyhow::Result<CleanupCounts> {
        let mut counts = CleanupCounts::default();
        for (table, slot) in [
            ("rating_stats", &mut counts.stats as &mut u64),
            ("rating_main", &mut counts.main),
            ("rating_history", &mut counts.history),
            ("rating_accuracy", &mut counts.accuracy),
        ] {
            let result = sqlx::query(&format!(
                "DELETE FROM {table} WHERE strftime('%Y-%m-%d', timestamp) = ?1"
            ))
            .bind(target_date)
            .execute(&self.pool)
            .await
            .with_context(|| format!("cleanup of {table} failed"))?;
            *slot = result.rows_affected();
        }
        Ok(counts)
    }

    // ── Legacy JSON migration support ────────────────────────────────────

    pub async fn stats_count(&self) -> sqlx::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM rating_stats")
            .fetch_one(&self.pool)
            .await?;
        row.try_get("n")
    }

    pub async fn insert_migrated_stats(
        &self,
        rows: &[(String, String, Option<String>, Option<String>)],
    ) -> anyhow::Result<usize> {
        let mut tx = self.pool.begin().await?;
        for (ticker, ts, daily, weekly) in rows {
            sqlx::query(
                "INSERT OR IGNORE INTO rating_stats
                 (ticker, timestamp, daily_val, daily_rating, daily_changed_at,
                  weekly_val, weekly_rating, weekly_changed_at)
                 VALUES (?1, ?2, NULL, ?3, ?4, NULL, ?5, ?6)",
            )
            .bind(ticker)
            .bind(ts)
            .bind(daily)
            .bind(daily.as_ref().map(|_| ts.as_str()))
            .bind(weekly)
            .bind(weekly.as_ref().map(|_| ts.as_str()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len())
    }

    pub async fn insert_migrated_history(
        &self,
        rows: &[(String, String, Option<String>, Option<String>)],
    ) -> anyhow::Result<usize> {
        let mut tx = self.pool.begin().await?;
        for (ticker, ts, daily, weekly) in rows {
            sqlx::query(
                "INSERT OR IGNORE INTO rating_history
                 (ticker, timestamp, daily_val, daily_rating, daily_prev, daily_changed_at,
                  weekly_val, weekly_rating, weekly_prev, weekly_changed_at)
                 VALUES (?1, ?2, NULL, ?3, NULL, ?4, NULL, ?5, NULL, ?6)",
            )
            .bind(ticker)
            .bind(ts)
            .bind(daily)
            .bind(daily.as_ref().map(|_| ts.as_str()))
            .bind(weekly)
            .bind(weekly.as_ref().map(|_| ts.as_str()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len())
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ── Change-detected inserts ──────────────────────────────────────────────────

/// Append to the raw stats log only when either label moved since the
/// ticker's last row.
async fn upsert_stats(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    timestamp: &str,
    obs: &LiveObservation,
) -> anyhow::Result<bool> {
    let last = sqlx::query(
        "SELECT daily_rating, weekly_rating FROM rating_stats
         WHERE ticker=?1
         ORDER BY timestamp DESC
         LIMIT 1",
    )
    .bind(&obs.ticker)
    .fetch_optional(&mut **tx)
    .await?;

    let changed = match &last {
        None => true,
        Some(row) => {
            let last_daily: Option<String> = row.try_get("daily_rating")?;
            let last_weekly: Option<String> = row.try_get("weekly_rating")?;
            last_daily.as_deref() != Some(obs.daily_rating.as_str())
                || last_weekly.as_deref() != Some(obs.weekly_rating.as_str())
        }
    };
    if !changed {
        return Ok(false);
    }

    sqlx::query(
        "INSERT INTO rating_stats
         (ticker, timestamp, daily_val, daily_rating, daily_changed_at,
          weekly_val, weekly_rating, weekly_changed_at)
         VALUES (?1, ?2, ?3, ?4, ?2, ?5, ?6, ?2)",
    )
    .bind(&obs.ticker)
    .bind(timestamp)
    .bind(obs.daily_val)
    .bind(obs.daily_rating.as_str())
    .bind(obs.weekly_val)
    .bind(obs.weekly_rating.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(true)
}

/// Per-timeframe state of the latest `rating_main` row.
#[derive(Clone, Debug, Default)]
struct SideState {
    val: Option<f64>,
    rating: Option<String>,
    prev: Option<String>,
    changed_at: Option<String>,
}

/// Write the current-state row when either side transitions. The side that
/// moved gets fresh values (`prev` = its last stored label, `changed_at` =
/// now); the other side carries all four fields over unchanged. On a
/// ticker's very first row `prev` is seeded with the incoming label itself
/// so a no-transition side always reads as "prev == rating".
async fn upsert_main(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    timestamp: &str,
    obs: &LiveObservation,
) -> anyhow::Result<bool> {
    let current = sqlx::query(
        "SELECT daily_val, daily_rating, daily_prev, daily_changed_at,
                weekly_val, weekly_rating, weekly_prev, weekly_changed_at
         FROM rating_main
         WHERE ticker=?1
         ORDER BY timestamp DESC
         LIMIT 1",
    )
    .bind(&obs.ticker)
    .fetch_optional(&mut **tx)
    .await?;

    let (cur_daily, cur_weekly) = match &current {
        None => (SideState::default(), SideState::default()),
        Some(row) => (
            SideState {
                val: row.try_get("daily_val")?,
                rating: non_empty(row.try_get("daily_rating")?),
                prev: non_empty(row.try_get("daily_prev")?),
                changed_at: non_empty(row.try_get("daily_changed_at")?),
            },
            SideState {
                val: row.try_get("weekly_val")?,
                rating: non_empty(row.try_get("weekly_rating")?),
                prev: non_empty(row.try_get("weekly_prev")?),
                changed_at: non_empty(row.try_get("weekly_changed_at")?),
            },
        ),
    };

    let first = current.is_none();
    let moves = |incoming: Rating, cur: &SideState| -> bool {
        if incoming == Rating::Unknown {
            return false;
        }
        if first {
            return true;
        }
        incoming != Rating::Neutral && cur.rating.as_deref() != Some(incoming.as_str())
    };

    let daily_moves = moves(obs.daily_rating, &cur_daily);
    let weekly_moves = moves(obs.weekly_rating, &cur_weekly);
    if !daily_moves && !weekly_moves {
        return Ok(false);
    }

    let next_side = |moved: bool, incoming: Rating, incoming_val: Option<f64>, cur: &SideState| {
        if moved && incoming != Rating::Neutral {
            let prev = if first {
                Some(incoming.as_str().to_string())
            } else {
                cur.rating.clone()
            };
            SideState {
                val: incoming_val,
                rating: Some(incoming.as_str().to_string()),
                prev,
                changed_at: Some(timestamp.to_string()),
            }
        } else if moved {
            // First observation was Neutral: the side starts blank.
            SideState::default()
        } else {
            cur.clone()
        }
    };

    let daily = next_side(daily_moves, obs.daily_rating, obs.daily_val, &cur_daily);
    let weekly = next_side(weekly_moves, obs.weekly_rating, obs.weekly_val, &cur_weekly);

    sqlx::query(
        "INSERT INTO rating_main
         (ticker, timestamp, daily_val, daily_rating, daily_prev, daily_changed_at,
          weekly_val, weekly_rating, weekly_prev, weekly_changed_at,
          currency, price, change_pct, change_abs, high, low)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
    )
    .bind(&obs.ticker)
    .bind(timestamp)
    .bind(daily.val)
    .bind(&daily.rating)
    .bind(&daily.prev)
    .bind(&daily.changed_at)
    .bind(weekly.val)
    .bind(&weekly.rating)
    .bind(&weekly.prev)
    .bind(&weekly.changed_at)
    .bind(&obs.market_data.currency)
    .bind(obs.market_data.price)
    .bind(obs.market_data.change_pct)
    .bind(obs.market_data.change_abs)
    .bind(obs.market_data.high)
    .bind(obs.market_data.low)
    .execute(&mut **tx)
    .await?;
    Ok(true)
}

/// Insert one snapshot unless the `(ticker, local date)` pair already has
/// one. `prev` fields lag at daily granularity: they repeat the labels of
/// the most recent earlier snapshot, whatever those were.
async fn insert_snapshot(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    snap: &SnapshotRow,
) -> anyhow::Result<bool> {
    let existing = sqlx::query(
        "SELECT 1 FROM rating_history
         WHERE ticker=?1 AND strftime('%Y-%m-%d', timestamp)=?2
         LIMIT 1",
    )
    .bind(&snap.ticker)
    .bind(&snap.date)
    .fetch_optional(&mut **tx)
    .await?;
    if existing.is_some() {
        return Ok(false);
    }

    let prev = sqlx::query(
        "SELECT daily_rating, weekly_rating FROM rating_history
         WHERE ticker=?1 AND timestamp < ?2
         ORDER BY timestamp DESC
         LIMIT 1",
    )
    .bind(&snap.ticker)
    .bind(&snap.timestamp)
    .fetch_optional(&mut **tx)
    .await?;
    let (prev_daily, prev_weekly): (Option<String>, Option<String>) = match &prev {
        None => (None, None),
        Some(row) => (row.try_get("daily_rating")?, row.try_get("weekly_rating")?),
    };

    sqlx::query(
        "INSERT INTO rating_history
         (ticker, timestamp, daily_val, daily_rating, daily_prev, daily_changed_at,
          weekly_val, weekly_rating, weekly_prev, weekly_changed_at,
          exchange, market, currency, price, change_pct, change_abs, high, low)
         VALUES (?1, ?2, ?3, ?4, ?5, ?2, ?6, ?7, ?8, ?2, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
    )
    .bind(&snap.ticker)
    .bind(&snap.timestamp)
    .bind(snap.daily_val)
    .bind(snap.daily_rating.as_str())
    .bind(&prev_daily)
    .bind(snap.weekly_val)
    .bind(snap.weekly_rating.as_str())
    .bind(&prev_weekly)
    .bind(&snap.exchange)
    .bind(snap.market.as_str())
    .bind(&snap.market_data.currency)
    .bind(snap.market_data.price)
    .bind(snap.market_data.change_pct)
    .bind(snap.market_data.change_abs)
    .bind(snap.market_data.high)
    .bind(snap.market_data.low)
    .execute(&mut **tx)
    .await?;
    Ok(true)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}
