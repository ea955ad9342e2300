use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Days;
use futures::{StreamExt, stream};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dr::{self, DrClient, DrTicker};
use crate::market;
use crate::rating::Rating;
use crate::scanner::QuoteFetcher;
use crate::sleep_or_cancel;
use crate::store::{LiveObservation, Store};
use crate::symbol;

/// The endless ingestion loop: every cycle it refreshes the DR universe,
/// fans per-ticker scanner fetches out under the concurrency budget, and
/// records each batch in its own transaction.
pub struct LiveUpdater {
    config: Arc<Config>,
    store: Store,
    dr: Arc<DrClient>,
    scanner: Arc<dyn QuoteFetcher>,
    token: CancellationToken,
}

impl LiveUpdater {
    pub fn new(
        config: Arc<Config>,
        store: Store,
        dr: Arc<DrClient>,
        scanner: Arc<dyn QuoteFetcher>,
        token: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            dr,
            scanner,
            token,
        }
    }

    pub async fn run(self) {
        let interval = Duration::from_secs(self.config.update_interval_secs);
        loop {
            if self.token.is_cancelled() {
                info!("[Live] Updater stopped");
                return;
            }
            info!(
                "[Live] Starting ratings update cycle at {}",
                market::format_ts(market::now_bangkok())
            );
            match self.run_cycle().await {
                Ok(written) => info!("[Live] Update cycle finished, {written} tickers written"),
                Err(e) => error!("[Live] Update cycle failed: {e:#}"),
            }
            if !sleep_or_cancel(&self.token, interval).await {
                info!("[Live] Updater stopped");
                return;
            }
        }
    }

    async fn run_cycle(&self) -> anyhow::Result<usize> {
        let rows = self.dr.fetch().await.context("could not fetch DR list")?;
        let tickers = dr::unique_underlyings(&rows);
        info!(
            "[Live] {} DR rows, {} unique underlying tickers",
            rows.len(),
            tickers.len()
        );
        if tickers.is_empty() {
            return Ok(0);
        }

        let batch_size = self.config.max_concurrency.max(1);
        let fetches = stream::iter(tickers)
            .map(|ticker| self.fetch_ticker(ticker))
            .buffer_unordered(batch_size)
            .chunks(batch_size);
        futures::pin_mut!(fetches);

        let mut written = 0;
        while let Some(batch) = fetches.next().await {
            let observations: Vec<LiveObservation> = batch.into_iter().flatten().collect();
            if !observations.is_empty() {
                let timestamp = market::format_ts(market::now_bangkok());
                match self.store.record_live_batch(&timestamp, &observations).await {
                    Ok(n) => written += n,
                    Err(e) => error!("[Live] Batch write failed: {e:#}"),
                }
            }
            // The current batch is committed; only now is it safe to bail.
            if self.token.is_cancelled() {
                info!("[Live] Shutdown requested, abandoning remaining batches");
                return Ok(written);
            }
            if !sleep_or_cancel(&self.token, Duration::from_secs(self.config.batch_sleep_secs)).await
            {
                return Ok(written);
            }
        }

        self.run_cleanup().await;
        Ok(written)
    }

    /// One ticker's fetch. Resolution or rating problems skip the ticker
    /// for this cycle and never fail the batch.
    async fn fetch_ticker(&self, ticker: DrTicker) -> Option<LiveObservation> {
        let resolved = match symbol::resolve(
            &ticker.u_code,
            &ticker.name,
            &ticker.exchange,
            &ticker.dr_symbol,
        ) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("[Live] Skipping {}: {e:#}", ticker.u_code);
                return None;
            }
        };

        let quote = match self.scanner.fetch_quote(&resolved.symbol).await {
            Ok(quote) => quote,
            Err(e) => {
                warn!("[Live] {} ({}): {e:#}", ticker.u_code, resolved.symbol);
                return None;
            }
        };

        let daily_rating = Rating::live(quote.daily_val);
        let weekly_rating = Rating::live(quote.weekly_val);
        if daily_rating == Rating::Unknown || weekly_rating == Rating::Unknown {
            info!(
                "[Live] {} has an Unknown rating, skipping DB updates this cycle",
                ticker.u_code
            );
            return None;
        }

        Some(LiveObservation {
            ticker: ticker.u_code,
            daily_val: quote.daily_val,
            daily_rating,
            weekly_val: quote.weekly_val,
            weekly_rating,
            market_data: quote.market_data,
        })
    }

    /// Daily date-window retention: drop the rows whose Bangkok-local date
    /// is exactly 30 days old.
    async fn run_cleanup(&self) {
        let Some(target) = market::now_bangkok().date().checked_sub_days(Days::new(30)) else {
            return;
        };
        let target = target.format("%Y-%m-%d").to_string();
        match self.store.cleanup_expired(&target).await {
            Ok(counts) if counts.total() > 0 => info!(
                "[Live] Cleanup for {target}: stats={} main={} history={} accuracy={}",
                counts.stats, counts.main, counts.history, counts.accuracy
            ),
            Ok(_) => {}
            Err(e) => error!("[Live] Cleanup failed: {e:#}"),
        }
    }
}
