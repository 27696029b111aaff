//! Bus consumer loop: batch, persist, republish, ack.
//!
//! One loop runs per bus topic. A fetch returns when the buffer reaches
//! `batch_size` or `flush_interval` elapses, which is the flush trigger.
//! Acks happen only after the whole flush succeeds, so a crash mid-flush
//! redelivers the batch (at-least-once); the store's idempotency keys
//! collapse the duplicates.

use crate::volume::{LedgerDelta, VolumeLedger};
use anyhow::{anyhow, Context, Result};
use async_nats::jetstream::consumer::PullConsumer;
use async_nats::jetstream::Message;
use futures::StreamExt;
use market_store::{ts_from_millis, BarRow, MarketStore, TradeRow};
use metrics::{counter, gauge};
use normalizer::{BarMessage, MarketMessage, TradeMessage};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use stream_log::StreamLogClient;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Consecutive flush failures before the loop reports itself degraded.
const DEGRADED_AFTER: u32 = 5;

/// Initial and maximum delay for flush retries.
const RETRY_INITIAL: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(15);

/// Batching policy for a consumer loop.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_millis(1000),
        }
    }
}

/// One persistence loop bound to a topic's durable consumer.
pub struct PersistLoop {
    topic: &'static str,
    consumer: PullConsumer,
    store: Arc<MarketStore>,
    log: StreamLogClient,
    config: BatchConfig,
    ledger: VolumeLedger,
}

impl PersistLoop {
    pub fn new(
        topic: &'static str,
        consumer: PullConsumer,
        store: Arc<MarketStore>,
        log: StreamLogClient,
        config: BatchConfig,
    ) -> Self {
        Self {
            topic,
            consumer,
            store,
            log,
            config,
            ledger: VolumeLedger::new(),
        }
    }

    /// Run until shutdown. Poll errors are transient; flush errors retry
    /// with backoff and never drop the batch.
    pub async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!("persist loop for '{}' running", self.topic);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("persist loop for '{}' received shutdown", self.topic);
                    break;
                }

                fetched = self.fetch_batch() => {
                    match fetched {
                        Ok(messages) if messages.is_empty() => continue,
                        Ok(messages) => self.flush_and_ack(messages).await,
                        Err(e) => {
                            warn!("bus poll failed for '{}': {e}", self.topic);
                            counter!("processor_poll_errors_total", "topic" => self.topic).increment(1);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        info!("persist loop for '{}' stopped", self.topic);
        Ok(())
    }

    /// Pull up to `batch_size` messages, waiting at most `flush_interval`.
    async fn fetch_batch(&self) -> Result<Vec<Message>> {
        let mut batch = self
            .consumer
            .batch()
            .max_messages(self.config.batch_size)
            .expires(self.config.flush_interval)
            .messages()
            .await
            .map_err(|e| anyhow!("batch request failed: {e}"))?;

        let mut messages = Vec::new();
        while let Some(next) = batch.next().await {
            match next {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    warn!("batch stream error on '{}': {e}", self.topic);
                    break;
                }
            }
        }
        Ok(messages)
    }

    /// Flush the batch (retrying forever with backoff) and then ack.
    async fn flush_and_ack(&mut self, messages: Vec<Message>) {
        let records = self.decode(&messages);

        let mut delay = RETRY_INITIAL;
        let mut failures: u32 = 0;
        loop {
            match self.flush(&records).await {
                Ok(()) => {
                    if failures >= DEGRADED_AFTER {
                        gauge!("processor_health_degraded", "topic" => self.topic).set(0.0);
                        info!("persist loop for '{}' recovered after {failures} failures", self.topic);
                    }
                    break;
                }
                Err(e) => {
                    failures += 1;
                    error!("flush failed for '{}' (attempt {failures}): {e:#}", self.topic);
                    counter!("processor_flush_failures_total", "topic" => self.topic).increment(1);
                    if failures == DEGRADED_AFTER {
                        gauge!("processor_health_degraded", "topic" => self.topic).set(1.0);
                        warn!("persist loop for '{}' is degraded", self.topic);
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_CAP);
                }
            }
        }

        counter!("processor_batches_flushed_total", "topic" => self.topic).increment(1);

        for msg in &messages {
            if let Err(e) = msg.ack().await {
                warn!("ack failed on '{}': {e}", self.topic);
            }
        }
    }

    /// Decode and validate bus payloads. Malformed and invalid records are
    /// dropped here; their messages still get acked.
    fn decode(&self, messages: &[Message]) -> Vec<MarketMessage> {
        let mut records = Vec::with_capacity(messages.len());
        for msg in messages {
            match decode_record(&msg.payload) {
                Ok(record) => records.push(record),
                Err(DropReason::Malformed(e)) => {
                    warn!("dropping malformed bus message on '{}': {e}", self.topic);
                    counter!("processor_malformed_total", "topic" => self.topic).increment(1);
                }
                Err(DropReason::Invalid(e)) => {
                    warn!("dropping invalid {e}");
                    counter!("processor_invalid_total", "topic" => self.topic).increment(1);
                }
            }
        }
        records
    }

    /// One flush attempt: resolve symbols, stage volumes, bulk-insert,
    /// republish to the per-stream log. Safe to retry wholesale; volume
    /// staging only commits on success.
    async fn flush(&mut self, records: &[MarketMessage]) -> Result<()> {
        let mut trades: Vec<(&TradeMessage, i64)> = Vec::new();
        let mut bars: Vec<(&BarMessage, i64)> = Vec::new();

        for record in records {
            let symbol_id = self
                .store
                .get_or_create_symbol(record.symbol())
                .await
                .context("symbol resolution")?;
            match record {
                MarketMessage::Trade(t) => trades.push((t, symbol_id)),
                MarketMessage::Bar(b) => bars.push((b, symbol_id)),
            }
        }

        // Seed accumulators before staging so a retry sees the same state.
        for (_, symbol_id) in &trades {
            if !self.ledger.is_seeded(*symbol_id) {
                match self.store.last_volume(*symbol_id).await.context("volume seed")? {
                    Some(seed) => {
                        self.ledger
                            .seed(*symbol_id, seed.volume, seed.ts.timestamp_millis())
                    }
                    None => self.ledger.seed_empty(*symbol_id),
                }
            }
        }

        let (staged, delta) = stage_batch(&self.ledger, &trades, &bars)?;
        if staged.duplicates > 0 {
            counter!("processor_duplicates_total", "topic" => self.topic)
                .increment(staged.duplicates);
        }
        if staged.late_trades > 0 {
            counter!("processor_late_trades_total", "topic" => self.topic)
                .increment(staged.late_trades);
        }

        let inserted_trades = self.store.insert_trades(&staged.trade_rows).await?;
        let inserted_bars = self.store.insert_bars(&staged.bar_rows).await?;
        counter!("processor_rows_inserted_total", "topic" => self.topic)
            .increment(inserted_trades + inserted_bars);

        for trade in &staged.trade_republish {
            let data = serde_json::to_string(&MarketMessage::Trade((*trade).clone()))?;
            self.log
                .publish_trade(&trade.symbol, &data)
                .await
                .context("log append")?;
        }
        for bar in &staged.bar_republish {
            let data = serde_json::to_string(&MarketMessage::Bar((*bar).clone()))?;
            self.log
                .publish_bar(&bar.symbol, &data)
                .await
                .context("log append")?;
        }

        self.ledger.commit(delta);
        Ok(())
    }
}

/// Why a record was dropped during decode. Dropped records still ack.
enum DropReason {
    Malformed(String),
    Invalid(String),
}

/// Parse and validate one bus payload.
fn decode_record(payload: &[u8]) -> std::result::Result<MarketMessage, DropReason> {
    let record: MarketMessage =
        serde_json::from_slice(payload).map_err(|e| DropReason::Malformed(e.to_string()))?;

    let valid = match &record {
        MarketMessage::Trade(t) => t.validate(),
        MarketMessage::Bar(b) => b.validate(),
    };
    match valid {
        Ok(()) => Ok(record),
        Err(reason) => Err(DropReason::Invalid(format!(
            "{} for {}: {reason}",
            record.event_name(),
            record.symbol()
        ))),
    }
}

/// Rows and republication sets staged from one batch, before any I/O.
struct StagedBatch<'a> {
    trade_rows: Vec<TradeRow>,
    bar_rows: Vec<BarRow>,
    trade_republish: Vec<&'a TradeMessage>,
    bar_republish: Vec<&'a BarMessage>,
    duplicates: u64,
    late_trades: u64,
}

/// Stage a batch against the ledger: suppress in-batch duplicates on the
/// idempotency keys, accumulate running volumes, and keep late trades out
/// of the republication set. The returned delta commits only after the
/// flush succeeds.
fn stage_batch<'a>(
    ledger: &VolumeLedger,
    trades: &[(&'a TradeMessage, i64)],
    bars: &[(&'a BarMessage, i64)],
) -> Result<(StagedBatch<'a>, LedgerDelta)> {
    let mut staged = StagedBatch {
        trade_rows: Vec::with_capacity(trades.len()),
        bar_rows: Vec::with_capacity(bars.len()),
        trade_republish: Vec::with_capacity(trades.len()),
        bar_republish: Vec::with_capacity(bars.len()),
        duplicates: 0,
        late_trades: 0,
    };

    let mut seen: HashSet<(i64, i64, Decimal, Decimal)> = HashSet::new();
    let mut stage = ledger.begin();
    for (trade, symbol_id) in trades {
        if !seen.insert((*symbol_id, trade.timestamp, trade.price, trade.size)) {
            debug!("suppressing in-batch duplicate trade for {}", trade.symbol);
            staged.duplicates += 1;
            continue;
        }

        let (volume, late) = stage.apply(*symbol_id, trade.timestamp, trade.size);
        staged.trade_rows.push(TradeRow {
            symbol_id: *symbol_id,
            ts: ts_from_millis(trade.timestamp)?,
            price: trade.price,
            size: trade.size,
            volume,
        });
        if late {
            debug!("late trade for {} persisted, skipped from republication", trade.symbol);
            staged.late_trades += 1;
        } else {
            staged.trade_republish.push(*trade);
        }
    }
    let delta = stage.into_delta();

    let mut bar_seen: HashSet<(i64, i64, String)> = HashSet::new();
    for (bar, symbol_id) in bars {
        if !bar_seen.insert((*symbol_id, bar.timestamp, bar.timeframe.clone())) {
            debug!("suppressing in-batch duplicate bar for {}", bar.symbol);
            staged.duplicates += 1;
            continue;
        }
        staged.bar_republish.push(*bar);
        staged.bar_rows.push(BarRow {
            symbol_id: *symbol_id,
            timeframe: bar.timeframe.clone(),
            ts: ts_from_millis(bar.timestamp)?,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
            trade_count: bar.trade_count,
            vwap: bar.vwap,
        });
    }

    Ok((staged, delta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade(symbol: &str, ts: i64, price: Decimal, size: Decimal) -> TradeMessage {
        TradeMessage {
            symbol: symbol.to_string(),
            price,
            size,
            timestamp: ts,
        }
    }

    fn bar(symbol: &str, ts: i64) -> BarMessage {
        BarMessage {
            symbol: symbol.to_string(),
            timeframe: "1m".to_string(),
            timestamp: ts,
            open: dec!(10),
            high: dec!(12),
            low: dec!(9),
            close: dec!(11),
            volume: dec!(500),
            trade_count: 42,
            vwap: Some(dec!(10.5)),
        }
    }

    #[test]
    fn decode_accepts_valid_records() {
        let payload = serde_json::to_vec(&MarketMessage::Trade(trade(
            "AAPL",
            1736937000000,
            dec!(150.25),
            dec!(100),
        )))
        .unwrap();
        let record = decode_record(&payload).unwrap_or_else(|_| panic!("decode failed"));
        assert_eq!(record.symbol(), "AAPL");
    }

    #[test]
    fn decode_drops_malformed_payloads() {
        assert!(matches!(
            decode_record(b"not json"),
            Err(DropReason::Malformed(_))
        ));
        assert!(matches!(
            decode_record(br#"{"type":"order","symbol":"AAPL"}"#),
            Err(DropReason::Malformed(_))
        ));
    }

    #[test]
    fn decode_drops_invalid_bars() {
        // high below open violates the OHLC invariant
        let payload = br#"{"type":"bar","symbol":"MSFT","timestamp":1736937000000,
            "open":10,"high":9,"low":8,"close":9,"volume":1}"#;
        assert!(matches!(
            decode_record(payload),
            Err(DropReason::Invalid(_))
        ));
    }

    #[test]
    fn decode_drops_non_positive_trade_prices() {
        let payload =
            br#"{"type":"trade","symbol":"AAPL","price":0,"size":1,"timestamp":1736937000000}"#;
        assert!(matches!(
            decode_record(payload),
            Err(DropReason::Invalid(_))
        ));
    }

    #[test]
    fn in_batch_trade_duplicates_collapse_to_one_row() {
        let mut ledger = VolumeLedger::new();
        ledger.seed_empty(1);

        let t = trade("AAPL", 1000, dec!(150.25), dec!(100));
        let dup = t.clone();
        let trades = vec![(&t, 1i64), (&dup, 1i64)];

        let (staged, _) = stage_batch(&ledger, &trades, &[]).unwrap();
        assert_eq!(staged.trade_rows.len(), 1);
        assert_eq!(staged.trade_republish.len(), 1);
        assert_eq!(staged.duplicates, 1);
        // the duplicate contributes nothing to the running volume
        assert_eq!(staged.trade_rows[0].volume, dec!(100));
    }

    #[test]
    fn distinct_trades_sharing_a_timestamp_are_kept_in_order() {
        let mut ledger = VolumeLedger::new();
        ledger.seed_empty(1);

        let t1 = trade("AAPL", 1000, dec!(150.25), dec!(100));
        let t2 = trade("AAPL", 1000, dec!(150.30), dec!(50));
        let trades = vec![(&t1, 1i64), (&t2, 1i64)];

        let (staged, _) = stage_batch(&ledger, &trades, &[]).unwrap();
        assert_eq!(staged.trade_rows.len(), 2);
        assert_eq!(staged.duplicates, 0);
        assert_eq!(staged.trade_rows[0].volume, dec!(100));
        assert_eq!(staged.trade_rows[1].volume, dec!(150));
        assert_eq!(staged.trade_republish.len(), 2);
    }

    #[test]
    fn in_batch_bar_duplicates_collapse_to_one_row() {
        let ledger = VolumeLedger::new();

        let b = bar("MSFT", 1000);
        let dup = b.clone();
        let bars = vec![(&b, 2i64), (&dup, 2i64)];

        let (staged, _) = stage_batch(&ledger, &[], &bars).unwrap();
        assert_eq!(staged.bar_rows.len(), 1);
        assert_eq!(staged.bar_republish.len(), 1);
        assert_eq!(staged.duplicates, 1);
    }

    #[test]
    fn same_bar_close_at_another_timeframe_is_not_a_duplicate() {
        let ledger = VolumeLedger::new();

        let b1 = bar("MSFT", 1000);
        let mut b5 = bar("MSFT", 1000);
        b5.timeframe = "5m".to_string();
        let bars = vec![(&b1, 2i64), (&b5, 2i64)];

        let (staged, _) = stage_batch(&ledger, &[], &bars).unwrap();
        assert_eq!(staged.bar_rows.len(), 2);
        assert_eq!(staged.duplicates, 0);
    }

    #[test]
    fn late_trades_persist_without_republication() {
        let mut ledger = VolumeLedger::new();
        ledger.seed(7, dec!(1000), 5000);

        let late = trade("AAPL", 4000, dec!(150.25), dec!(10));
        let trades = vec![(&late, 7i64)];

        let (staged, _) = stage_batch(&ledger, &trades, &[]).unwrap();
        assert_eq!(staged.trade_rows.len(), 1);
        assert_eq!(staged.trade_rows[0].volume, dec!(1010));
        assert!(staged.trade_republish.is_empty());
        assert_eq!(staged.late_trades, 1);
    }

    #[test]
    fn staged_volumes_are_prefix_sums_per_symbol() {
        let mut ledger = VolumeLedger::new();
        ledger.seed_empty(1);
        ledger.seed_empty(2);

        let a1 = trade("AAPL", 1000, dec!(150), dec!(100));
        let m1 = trade("MSFT", 1000, dec!(400), dec!(7));
        let a2 = trade("AAPL", 2000, dec!(151), dec!(0));
        let a3 = trade("AAPL", 3000, dec!(152), dec!(25));
        let trades = vec![(&a1, 1i64), (&m1, 2i64), (&a2, 1i64), (&a3, 1i64)];

        let (staged, delta) = stage_batch(&ledger, &trades, &[]).unwrap();
        let volumes: Vec<Decimal> = staged.trade_rows.iter().map(|r| r.volume).collect();
        assert_eq!(volumes, vec![dec!(100), dec!(7), dec!(100), dec!(125)]);

        // committing the delta carries the sums into the next batch
        ledger.commit(delta);
        let mut stage = ledger.begin();
        assert_eq!(stage.apply(1, 4000, dec!(5)).0, dec!(130));
        assert_eq!(stage.apply(2, 4000, dec!(3)).0, dec!(10));
    }
}
