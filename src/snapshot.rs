use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::accuracy::{self, SnapshotTrigger};
use crate::config::Config;
use crate::dr::{self, DrClient, DrTicker};
use crate::market::{self, MarketCode};
use crate::rating::Rating;
use crate::scanner::QuoteFetcher;
use crate::sleep_or_cancel;
use crate::store::{self, SnapshotRow, Store};
use crate::symbol::{self, ResolvedSymbol};

/// Rows per snapshot transaction; keeps the write lock hold time low when
/// several market closes coincide.
const SNAPSHOT_BATCH: usize = 10;
/// Accuracy recomputes per short-lived connection.
const ACCURACY_BATCH: usize = 10;

/// Shared collaborators for all per-market schedulers.
pub struct SnapshotContext {
    pub config: Arc<Config>,
    pub dr: Arc<DrClient>,
    pub scanner: Arc<dyn QuoteFetcher>,
    mapping_logged: AtomicBool,
}

impl SnapshotContext {
    pub fn new(config: Arc<Config>, dr: Arc<DrClient>, scanner: Arc<dyn QuoteFetcher>) -> Self {
        Self {
            config,
            dr,
            scanner,
            mapping_logged: AtomicBool::new(false),
        }
    }
}

/// One long-lived task per market: sleep until the market's next
/// Bangkok-local close, snapshot it, repeat.
pub async fn run_market_scheduler(
    ctx: Arc<SnapshotContext>,
    market: MarketCode,
    token: CancellationToken,
) {
    loop {
        let now = market::now_bangkok();
        let close = market::next_close(market, now);
        let wait = market::seconds_until(now, close);
        info!(
            "[Scheduler] [{market}] Next snapshot at {} (in {:.1} minutes)",
            market::format_ts(close),
            wait as f64 / 60.0
        );
        if !sleep_or_cancel(&token, Duration::from_secs(wait)).await {
            info!("[Scheduler] [{market}] Stopped");
            return;
        }

        if let Err(e) = snapshot_market(&ctx, market, &token).await {
            error!("[History] [{market}] Snapshot run failed: {e:#}");
            if !sleep_or_cancel(&token, Duration::from_secs(60)).await {
                return;
            }
        }
    }
}

/// Snapshot every ticker of one market for today's Bangkok date, then
/// recompute accuracy for the snapshots that were actually inserted.
pub async fn snapshot_market(
    ctx: &SnapshotContext,
    market: MarketCode,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    let now = market::now_bangkok();
    let timestamp = market::format_ts(now);
    let date = market::date_str(now);
    info!("[History] [{market}] Starting fetch at {timestamp}");

    let rows = ctx.dr.fetch().await.context("could not fetch DR list")?;
    if !ctx.mapping_logged.swap(true, Ordering::Relaxed) {
        log_market_distribution(&rows);
    }

    let tickers = market_tickers(&rows, market);
    if tickers.is_empty() {
        info!("[History] [{market}] No tickers mapped to this market");
        return Ok(());
    }
    info!("[History] [{market}] {} tickers to snapshot", tickers.len());

    // Dedicated connection with a short busy timeout; other markets may be
    // snapshotting concurrently and must not queue behind this one.
    let store = Store::connect(&ctx.config.db_file, Duration::from_secs(2))
        .await
        .context("could not open snapshot connection")?;

    let mut pending: Vec<SnapshotRow> = Vec::new();
    let mut triggers: Vec<SnapshotTrigger> = Vec::new();
    let mut fetched = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;

    for (ticker, resolved) in &tickers {
        if token.is_cancelled() {
            break;
        }
        match store.snapshot_exists(&ticker.u_code, &date).await {
            Ok(true) => {
                skipped += 1;
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("[History] [{market}] Existence check failed for {}: {e}", ticker.u_code);
                failed += 1;
                continue;
            }
        }

        let quote = match ctx.scanner.fetch_quote(&resolved.symbol).await {
            Ok(quote) => quote,
            Err(e) => {
                warn!("[History] [{market}] Failed to fetch {}: {e:#}", ticker.u_code);
                failed += 1;
                continue;
            }
        };

        let daily_rating = Rating::snapshot(quote.daily_val);
        let weekly_rating = Rating::snapshot(quote.weekly_val);
        if daily_rating == Rating::Unknown && weekly_rating == Rating::Unknown {
            // Still snapshotted: the price series stays unbroken.
            warn!(
                "[History] [{market}] {} has both ratings Unknown, saving anyway",
                ticker.u_code
            );
        }

        pending.push(SnapshotRow {
            ticker: ticker.u_code.clone(),
            timestamp: timestamp.clone(),
            date: date.clone(),
            daily_val: quote.daily_val,
            daily_rating,
            weekly_val: quote.weekly_val,
            weekly_rating,
            exchange: ticker.exchange.clone(),
            market,
            market_data: quote.market_data,
        });
        if pending.len() >= SNAPSHOT_BATCH {
            fetched += flush_snapshots(&store, market, &mut pending, &mut triggers).await;
        }

        if !sleep_or_cancel(token, Duration::from_millis(100)).await {
            break;
        }
    }
    fetched += flush_snapshots(&store, market, &mut pending, &mut triggers).await;
    store.close().await;

    info!(
        "[History] [{market}] Completed: {fetched} fetched, {skipped} skipped, {failed} failed"
    );

    if !triggers.is_empty() {
        recompute_accuracy(ctx, market, &triggers).await;
    }
    Ok(())
}

/// Resolve and keep the DR universe subset belonging to `market`.
fn market_tickers(rows: &[dr::DrRow], market: MarketCode) -> Vec<(DrTicker, ResolvedSymbol)> {
    dr::unique_underlyings(rows)
        .into_iter()
        .filter_map(|ticker| {
            match symbol::resolve(
                &ticker.u_code,
                &ticker.name,
                &ticker.exchange,
                &ticker.dr_symbol,
            ) {
                Ok(resolved) if resolved.market == market => Some((ticker, resolved)),
                Ok(_) => None,
                Err(e) => {
                    warn!("[History] Skipping {}: {e:#}", ticker.u_code);
                    None
                }
            }
        })
        .collect()
}

/// Write the pending batch, retrying the commit on writer contention.
/// Returns how many rows were inserted; an abandoned batch is logged and
/// dropped so the market run keeps going.
async fn flush_snapshots(
    store: &Store,
    market: MarketCode,
    pending: &mut Vec<SnapshotRow>,
    triggers: &mut Vec<SnapshotTrigger>,
) -> usize {
    if pending.is_empty() {
        return 0;
    }

    for attempt in 0..3u32 {
        match store.insert_snapshots(pending).await {
            Ok(inserted) => {
                triggers.extend(pending.iter().map(|snap| SnapshotTrigger {
                    ticker: snap.ticker.clone(),
                    timestamp: snap.timestamp.clone(),
                    price: snap.market_data.price,
                    change_pct: snap.market_data.change_pct,
                    currency: Some(snap.market_data.currency.clone()),
                    high: snap.market_data.high,
                    low: snap.market_data.low,
                }));
                pending.clear();
                return inserted;
            }
            Err(e) => {
                let locked = e
                    .downcast_ref::<sqlx::Error>()
                    .is_some_and(store::is_locked);
                if locked && attempt < 2 {
                    let backoff = Duration::from_millis(500 * u64::from(attempt + 1));
                    warn!("[History] [{market}] Batch commit contended, retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                error!(
                    "[History] [{market}] Abandoning batch of {} snapshots: {e:#}",
                    pending.len()
                );
                pending.clear();
                return 0;
            }
        }
    }
    unreachable!("retry loop always returns");
}

/// Per-ticker accuracy recompute in short-lived batches; anything that
/// fails is retried one-by-one on its own connection afterwards.
async fn recompute_accuracy(ctx: &SnapshotContext, market: MarketCode, triggers: &[SnapshotTrigger]) {
    info!(
        "[Accuracy] [{market}] Recomputing accuracy for {} tickers",
        triggers.len()
    );
    let window_days = ctx.config.window_days;
    let mut saved = 0usize;
    let mut retry: Vec<&SnapshotTrigger> = Vec::new();

    for batch in triggers.chunks(ACCURACY_BATCH) {
        let store = match Store::connect(&ctx.config.db_file, Duration::from_secs(1)).await {
            Ok(store) => store,
            Err(e) => {
                warn!("[Accuracy] [{market}] Could not open batch connection: {e:#}");
                retry.extend(batch);
                continue;
            }
        };
        for trigger in batch {
            match accuracy::compute_and_store(&store, trigger, window_days).await {
                Ok(_) => saved += 1,
                Err(e) => {
                    warn!(
                        "[Accuracy] [{market}] {}@{} failed: {e:#}",
                        trigger.ticker, trigger.timestamp
                    );
                    retry.push(trigger);
                }
            }
        }
        store.close().await;
    }

    if !retry.is_empty() {
        info!("[Accuracy] [{market}] Retrying {} failed tickers individually", retry.len());
        for trigger in retry {
            match Store::connect(&ctx.config.db_file, Duration::from_secs(1)).await {
                Ok(store) => {
                    match accuracy::compute_and_store(&store, trigger, window_days).await {
                        Ok(_) => saved += 1,
                        Err(e) => warn!(
                            "[Accuracy] [{market}] Retry failed for {}: {e:#}",
                            trigger.ticker
                        ),
                    }
                    store.close().await;
                }
                Err(e) => warn!("[Accuracy] [{market}] Retry connection failed: {e:#}"),
            }
        }
    }
    info!(
        "[Accuracy] [{market}] Completed: {saved}/{} tickers saved",
        triggers.len()
    );
}

/// Logged once per process, on the first market close: how the DR universe
/// maps onto market codes, so mapping regressions show up in the logs.
fn log_market_distribution(rows: &[dr::DrRow]) {
    let tickers = dr::unique_underlyings(rows);
    let mut counts: HashMap<MarketCode, usize> = HashMap::new();
    for ticker in &tickers {
        *counts.entry(market::market_from_exchange(&ticker.exchange)).or_default() += 1;
    }
    info!("[Mapping] {} unique underlyings across {} markets", tickers.len(), counts.len());
    let mut entries: Vec<_> = counts.into_iter().collect();
    entries.sort_by_key(|(market, _)| market.as_str());
    for (market, count) in entries {
        let pct = count as f64 / tickers.len().max(1) as f64 * 100.0;
        info!("[Mapping]   {market}: {count} tickers ({pct:.1}%)");
    }
}
