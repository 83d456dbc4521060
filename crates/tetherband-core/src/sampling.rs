//! One RSSI sampling batch.
//!
//! A batch reads the link RSSI up to `samples_per_batch` times, spaced by
//! `sample_spacing`, under a watchdog of `sample_window`. The collector is a
//! single future: it finishes when the budget is met, the watchdog fires,
//! a read fails or the session is cancelled. Taking `&mut self` makes
//! overlapping batches on one session impossible.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::TrackingConfig;
use crate::filter::ProximityFilter;
use crate::transport::{Transport, TransportError};
use crate::types::PeripheralHandle;

/// How a batch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The sample budget was met.
    Complete(Vec<i16>),
    /// The watchdog fired first; holds whatever was collected.
    WatchdogExpired(Vec<i16>),
    /// A read failed; the batch is dropped.
    Aborted(TransportError),
    /// The session was cancelled.
    Cancelled,
}

impl BatchOutcome {
    /// Samples usable for an estimate, if any.
    #[must_use]
    pub fn samples(&self) -> Option<&[i16]> {
        match self {
            Self::Complete(samples) | Self::WatchdogExpired(samples) if !samples.is_empty() => {
                Some(samples.as_slice())
            }
            _ => None,
        }
    }
}

/// Sampling state owned by one beacon session.
#[derive(Debug, Clone)]
pub struct SamplingSession {
    samples: Vec<i16>,
    budget: usize,
    spacing: Duration,
    window: Duration,
    tx_power: Option<i8>,
    fallback_tx_power: i8,
}

impl SamplingSession {
    /// Create a sampler from the tracking configuration.
    #[must_use]
    pub fn new(config: &TrackingConfig) -> Self {
        let budget = config.samples_per_batch.max(1);
        Self {
            samples: Vec::with_capacity(budget),
            budget,
            spacing: config.sample_spacing(),
            window: config.sample_window(),
            tx_power: None,
            fallback_tx_power: config.fallback_tx_power,
        }
    }

    /// Cache the transmit power read at connect time.
    pub fn set_tx_power(&mut self, tx_power: i8) {
        self.tx_power = Some(tx_power);
    }

    /// Cached transmit power, if the beacon reported one.
    #[must_use]
    pub const fn tx_power(&self) -> Option<i8> {
        self.tx_power
    }

    /// Transmit power used for estimates.
    #[must_use]
    pub fn effective_tx_power(&self) -> i8 {
        self.tx_power.unwrap_or(self.fallback_tx_power)
    }

    /// Samples per batch.
    #[must_use]
    pub const fn budget(&self) -> usize {
        self.budget
    }

    /// Estimate a distance from a finished batch.
    #[must_use]
    pub fn estimate(&self, filter: &ProximityFilter, outcome: &BatchOutcome) -> Option<f64> {
        outcome
            .samples()
            .and_then(|samples| filter.estimate_distance(samples, self.effective_tx_power()))
    }

    /// Run one batch against `handle`.
    pub async fn collect(
        &mut self,
        transport: &dyn Transport,
        handle: &PeripheralHandle,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        self.samples.clear();
        let budget = self.budget;
        let spacing = self.spacing;
        let window = self.window;
        let samples = &mut self.samples;

        let gather = async {
            while samples.len() < budget {
                let rssi = transport.read_signal_strength(handle).await?;
                trace!(%handle, rssi, "RSSI sample");
                samples.push(rssi);
                if samples.len() < budget && !spacing.is_zero() {
                    tokio::time::sleep(spacing).await;
                }
            }
            Ok::<(), TransportError>(())
        };

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = tokio::time::timeout(window, gather) => Some(result),
        };

        let outcome = match result {
            None => BatchOutcome::Cancelled,
            Some(Ok(Ok(()))) => BatchOutcome::Complete(std::mem::take(&mut self.samples)),
            Some(Ok(Err(e))) => BatchOutcome::Aborted(e),
            Some(Err(_)) => BatchOutcome::WatchdogExpired(std::mem::take(&mut self.samples)),
        };
        self.samples.clear();

        debug!(
            %handle,
            outcome = match &outcome {
                BatchOutcome::Complete(_) => "complete",
                BatchOutcome::WatchdogExpired(_) => "watchdog",
                BatchOutcome::Aborted(_) => "aborted",
                BatchOutcome::Cancelled => "cancelled",
            },
            samples = outcome.samples().map_or(0, <[i16]>::len),
            "Sample batch finished"
        );
        outcome
    }
}
