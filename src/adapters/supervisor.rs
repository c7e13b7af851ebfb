//! Adapter lifecycle supervision.
//!
//! One supervisor task per adapter:
//! - exponential backoff reconnect with jitter (thundering herd prevention)
//! - circuit breaker after consecutive transport failures
//! - reconciliation pass on every successful reconnect
//! - periodic snapshot polling for adapters without push events
//! - graceful drain on shutdown

use std::sync::Arc;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use crate::oms::OrderManager;
use crate::positions::PositionTracker;

use super::{AdapterError, PositionSnapshot, VenueAdapter};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,

    pub connect_timeout_ms: u64,
    pub snapshot_timeout_ms: u64,
    pub health_poll_ms: u64,

    /// Consecutive transport failures before the circuit opens.
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_secs: u64,

    /// Polling cadence for adapters without push events. `None` disables
    /// periodic polling; reconnect reconciliation still runs.
    pub poll_interval_ms: Option<u64>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            // Backoff: 1s base, 2x multiplier, 60s cap, ±30% jitter
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.3,

            connect_timeout_ms: 10_000,
            snapshot_timeout_ms: 30_000,
            health_poll_ms: 2_000,

            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_secs: 60,

            poll_interval_ms: None,
        }
    }
}

/// Backoff calculator with jitter.
#[derive(Debug)]
pub struct BackoffCalculator {
    base_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter_factor: f64,
    attempt: u32,
}

impl BackoffCalculator {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms,
            max_ms: config.backoff_max_ms,
            multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
            attempt: 0,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Next delay, growing exponentially up to the cap with random jitter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.multiplier.powi(self.attempt.min(16) as i32);
        let raw_ms = ((self.base_ms as f64) * exp).min(self.max_ms as f64);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_span = raw_ms * self.jitter_factor;
        let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
        let with_jitter = (raw_ms + jitter).clamp(self.base_ms as f64 / 2.0, self.max_ms as f64);
        Duration::from_millis(with_jitter as u64)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

pub struct AdapterSupervisor {
    adapter: Arc<dyn VenueAdapter>,
    oms: Arc<OrderManager>,
    positions: Arc<PositionTracker>,
    config: SupervisorConfig,
    shutdown: watch::Receiver<bool>,
}

impl AdapterSupervisor {
    pub fn spawn(
        adapter: Arc<dyn VenueAdapter>,
        oms: Arc<OrderManager>,
        positions: Arc<PositionTracker>,
        config: SupervisorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let supervisor = Self {
            adapter,
            oms,
            positions,
            config,
            shutdown,
        };
        tokio::spawn(async move { supervisor.run().await })
    }

    async fn run(mut self) {
        let venue = self.adapter.venue().to_string();
        let mut backoff = BackoffCalculator::new(&self.config);
        let mut consecutive_failures = 0u32;

        info!(venue = %venue, "adapter supervisor started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            // Circuit breaker: after enough consecutive transport failures,
            // stop hammering the venue for a full cooldown.
            if consecutive_failures >= self.config.circuit_breaker_threshold {
                warn!(
                    venue = %venue,
                    failures = consecutive_failures,
                    cooldown_secs = self.config.circuit_breaker_cooldown_secs,
                    "circuit breaker open"
                );
                metrics::increment_counter!("adapter_circuit_opens_total", "venue" => venue.clone());
                if self
                    .sleep_or_shutdown(Duration::from_secs(self.config.circuit_breaker_cooldown_secs))
                    .await
                {
                    break;
                }
                consecutive_failures = 0;
                backoff.reset();
            }

            let connect = timeout(
                Duration::from_millis(self.config.connect_timeout_ms),
                self.adapter.connect(),
            )
            .await;

            match connect {
                Ok(Ok(())) => {
                    info!(venue = %venue, attempts = backoff.attempt(), "adapter connected");
                    backoff.reset();
                    consecutive_failures = 0;

                    // Reconnect discipline: the venue snapshot is ground
                    // truth before any further event is applied.
                    self.reconcile(&venue).await;

                    if self.monitor(&venue).await {
                        break; // shutdown requested
                    }
                    warn!(venue = %venue, "adapter connection lost");
                }
                Ok(Err(e)) => {
                    consecutive_failures += 1;
                    let delay = backoff.next_delay();
                    warn!(
                        venue = %venue,
                        error = %e,
                        failures = consecutive_failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "adapter connect failed"
                    );
                    if self.sleep_or_shutdown(delay).await {
                        break;
                    }
                }
                Err(_) => {
                    consecutive_failures += 1;
                    let delay = backoff.next_delay();
                    warn!(
                        venue = %venue,
                        failures = consecutive_failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "adapter connect timed out"
                    );
                    if self.sleep_or_shutdown(delay).await {
                        break;
                    }
                }
            }
        }

        // Drain: close the connection cleanly so outstanding submits get a
        // deterministic SHUTDOWN error rather than a dangling socket.
        if let Err(e) = self.adapter.disconnect().await {
            debug!(venue = %venue, error = %e, "disconnect during shutdown");
        }
        info!(venue = %venue, "adapter supervisor stopped");
    }

    /// Watch health (and run the periodic poll for polling adapters) until
    /// the connection drops or shutdown is requested. Returns true on
    /// shutdown.
    async fn monitor(&mut self, venue: &str) -> bool {
        let health_interval = Duration::from_millis(self.config.health_poll_ms);
        let mut since_poll = Duration::ZERO;

        loop {
            if self.sleep_or_shutdown(health_interval).await {
                return true;
            }

            if !self.adapter.health().connected {
                return false;
            }

            if let Some(poll_ms) = self.config.poll_interval_ms {
                since_poll += health_interval;
                if since_poll >= Duration::from_millis(poll_ms) {
                    since_poll = Duration::ZERO;
                    self.reconcile(venue).await;
                }
            }
        }
    }

    /// Pull open-order and position snapshots and fold them into the OMS
    /// and position tracker.
    async fn reconcile(&self, venue: &str) {
        let snapshot_timeout = Duration::from_millis(self.config.snapshot_timeout_ms);

        match timeout(snapshot_timeout, self.adapter.open_orders()).await {
            Ok(Ok(snapshots)) => {
                if let Err(e) = self.oms.reconcile(venue, &snapshots) {
                    warn!(venue = %venue, error = %e, "order reconciliation failed");
                }
            }
            Ok(Err(AdapterError::Unsupported(_))) => {}
            Ok(Err(e)) => warn!(venue = %venue, error = %e, "open-orders snapshot failed"),
            Err(_) => warn!(venue = %venue, "open-orders snapshot timed out"),
        }

        match timeout(snapshot_timeout, self.adapter.positions()).await {
            Ok(Ok(snapshots)) => {
                // The adapter may front several venues; each venue's slice of
                // the snapshot is authoritative for that venue alone.
                for owned_venue in self.adapter.venues() {
                    let slice: Vec<PositionSnapshot> = snapshots
                        .iter()
                        .filter(|s| s.venue == owned_venue)
                        .cloned()
                        .collect();
                    if let Err(e) = self.positions.on_position_snapshot(
                        &owned_venue,
                        &slice,
                        self.adapter.kind(),
                    ) {
                        warn!(venue = %owned_venue, error = %e, "position reconciliation failed");
                    }
                }
            }
            Ok(Err(AdapterError::Unsupported(_))) => {}
            Ok(Err(e)) => warn!(venue = %venue, error = %e, "positions snapshot failed"),
            Err(_) => warn!(venue = %venue, "positions snapshot timed out"),
        }
    }

    /// Sleep for `delay`, waking early on shutdown. Returns true on shutdown.
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = sleep(delay) => *self.shutdown.borrow(),
            changed = self.shutdown.changed() => {
                changed.is_err() || *self.shutdown.borrow()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = BackoffCalculator::new(&config());
        let first = backoff.next_delay();
        let mut last = first;
        for _ in 0..10 {
            last = backoff.next_delay();
        }
        assert!(first.as_millis() <= 200);
        assert!(last.as_millis() <= 1_000);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = BackoffCalculator::new(&config());
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay().as_millis() <= 200);
    }
}
