use anyhow::{Context, Result};
use barter_data::{
    exchange::binance::spot::BinanceSpot,
    streams::{reconnect::Event as ReconnectEvent, Streams},
    subscription::book::OrderBooksL1,
};
use barter_instrument::instrument::market_data::{
    kind::MarketDataInstrumentKind, MarketDataInstrument,
};
use futures_util::StreamExt;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, warn};

/// Half-life of the volatility estimate. Two minutes keeps the router's
/// slippage fallback responsive to regime changes without chasing noise.
const VOL_HALF_LIFE_SECS: f64 = 120.0;

#[derive(Debug, Clone, Copy)]
pub struct PricePoint {
    pub ts: i64,
    pub mid: f64,
}

/// Per-symbol state: the freshest mid plus an exponentially decayed second
/// moment of per-second log returns. Only the latest point is retained; the
/// mark chain never looks backwards.
#[derive(Debug, Default)]
struct SymbolTrack {
    last: Option<PricePoint>,
    return_sq_ewm: Option<f64>,
}

impl SymbolTrack {
    fn record(&mut self, ts: i64, mid: f64) {
        if let Some(prev) = self.last {
            let dt = (ts - prev.ts).max(1) as f64;
            if prev.mid > 0.0 && mid > 0.0 {
                // Log return normalized to one second, squared, folded into
                // the running moment with a half-life-derived step.
                let step = (mid.ln() - prev.mid.ln()) / dt;
                let weight = 1.0 - (-dt * std::f64::consts::LN_2 / VOL_HALF_LIFE_SECS).exp();
                let squared = step * step;
                let folded = match self.return_sq_ewm {
                    Some(moment) => moment + weight * (squared - moment),
                    None => squared,
                };
                if folded.is_finite() {
                    self.return_sq_ewm = Some(folded);
                }
            }
        }
        self.last = Some(PricePoint { ts, mid });
    }

    fn sigma(&self) -> Option<f64> {
        self.return_sq_ewm
            .filter(|m| m.is_finite() && *m > 0.0)
            .map(f64::sqrt)
    }
}

/// Live L1 mid-price feed used as the adapter-tier mark source and as the
/// volatility input to the router's fallback slippage model.
#[derive(Debug, Clone)]
pub struct BinanceMarkFeed {
    tracks: Arc<RwLock<HashMap<String, SymbolTrack>>>,
}

impl BinanceMarkFeed {
    pub fn disabled() -> Arc<Self> {
        Arc::new(Self {
            tracks: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Spawn the feed for the given (base, quote) pairs.
    pub async fn spawn(pairs: Vec<(String, String)>) -> Result<Arc<Self>> {
        let feed = Arc::new(Self {
            tracks: Arc::new(RwLock::new(HashMap::new())),
        });

        // NOTE: `barter-data`'s `StreamBuilder` futures are `!Send`, so we must
        // initialise the streams *outside* of `tokio::spawn`.
        let streams = init_streams(&pairs).await?;

        let task_feed = feed.clone();
        tokio::spawn(async move {
            if let Err(e) = task_feed.consume(streams).await {
                warn!(error = %e, "binance mark feed stopped");
            }
        });

        Ok(feed)
    }

    pub fn latest_mid(&self, symbol: &str) -> Option<PricePoint> {
        self.tracks.read().get(symbol).and_then(|t| t.last)
    }

    /// Per-sqrt-second volatility estimate for the symbol, if the feed has
    /// seen at least two ticks.
    pub fn sigma_per_sqrt_s(&self, symbol: &str) -> Option<f64> {
        self.tracks.read().get(symbol).and_then(SymbolTrack::sigma)
    }

    async fn consume(
        self: Arc<Self>,
        streams: Streams<
            barter_data::streams::consumer::MarketStreamResult<
                MarketDataInstrument,
                barter_data::subscription::book::OrderBookL1,
            >,
        >,
    ) -> Result<()> {
        let mut joined = streams.select_all();
        while let Some(event) = joined.next().await {
            match event {
                ReconnectEvent::Reconnecting(exchange) => {
                    warn!(?exchange, "binance mark stream reconnecting");
                }
                ReconnectEvent::Item(result) => match result {
                    Ok(market_event) => {
                        let symbol = stream_symbol(&market_event.instrument);
                        let ts = market_event.time_received.timestamp();

                        let Some(mid) = market_event
                            .kind
                            .mid_price()
                            .and_then(|d| d.to_string().parse::<f64>().ok())
                            .filter(|m| m.is_finite() && *m > 0.0)
                        else {
                            continue;
                        };

                        self.tracks
                            .write()
                            .entry(symbol)
                            .or_default()
                            .record(ts, mid);
                    }
                    Err(e) => {
                        debug!(error = %e, "binance market stream error")
                    }
                },
            }
        }

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn seed(&self, symbol: &str, ts: i64, mid: f64) {
        self.tracks
            .write()
            .entry(symbol.to_string())
            .or_default()
            .record(ts, mid);
    }
}

async fn init_streams(
    pairs: &[(String, String)],
) -> Result<
    Streams<
        barter_data::streams::consumer::MarketStreamResult<
            MarketDataInstrument,
            barter_data::subscription::book::OrderBookL1,
        >,
    >,
> {
    // Subscribe to L1 orderbooks (best bid/ask) and compute mid-price.
    let subscriptions: Vec<_> = pairs
        .iter()
        .map(|(base, quote)| {
            (
                BinanceSpot::default(),
                base.as_str(),
                quote.as_str(),
                MarketDataInstrumentKind::Spot,
                OrderBooksL1,
            )
        })
        .collect();

    Streams::<OrderBooksL1>::builder()
        .subscribe(subscriptions)
        .init()
        .await
        .context("failed to init barter-data binance streams")
}

/// Key used in the track map: concatenated upper-case base+quote, matching
/// the exchange's own ticker spelling.
fn stream_symbol(instrument: &MarketDataInstrument) -> String {
    format!("{}{}", instrument.base, instrument.quote).to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed() -> BinanceMarkFeed {
        BinanceMarkFeed {
            tracks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    #[test]
    fn test_latest_mid_tracks_newest_tick() {
        let feed = feed();
        assert!(feed.latest_mid("BTCUSDT").is_none());

        feed.seed("BTCUSDT", 1, 30_000.0);
        feed.seed("BTCUSDT", 3, 29_990.0);

        let latest = feed.latest_mid("BTCUSDT").unwrap();
        assert_eq!(latest.ts, 3);
        assert_eq!(latest.mid, 29_990.0);
    }

    #[test]
    fn test_sigma_needs_two_ticks_and_decays_toward_moves() {
        let feed = feed();
        feed.seed("BTCUSDT", 1, 30_000.0);
        assert!(feed.sigma_per_sqrt_s("BTCUSDT").is_none());

        feed.seed("BTCUSDT", 2, 30_030.0);
        let early = feed.sigma_per_sqrt_s("BTCUSDT").unwrap();
        assert!(early > 0.0);

        // A run of flat ticks should pull the estimate down.
        for ts in 3..60 {
            feed.seed("BTCUSDT", ts, 30_030.0);
        }
        let late = feed.sigma_per_sqrt_s("BTCUSDT").unwrap();
        assert!(late < early);
    }
}
