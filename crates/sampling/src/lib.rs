//! Sampling policies deciding which requests produce uploaded traces.
//!
//! The built-in [`LimitedSampler`] traces a random fraction of requests
//! while enforcing a global ceiling on sampled traces per second, and
//! computes compensation weights so the sampled subset stays an unbiased
//! estimator of the offered load even when the ceiling is binding.

use std::sync::Mutex;
use std::time::Instant;

use rand::Rng;

/// Per-request input to a sampling policy.
#[derive(Copy, Clone, Debug, Default)]
pub struct Parameters {
    /// Whether the incoming request carried a trace-context header with
    /// the trace bit set.
    pub has_trace_header: bool,
}

/// The outcome of a sampling decision.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Decision {
    /// Keep trace context flowing to downstream calls.
    pub trace: bool,
    /// Upload the spans recorded for this request. Implies `trace`.
    pub sample: bool,
    /// How many offered requests this sampled request stands for, for
    /// backend estimation. Zero unless `sample` is set.
    pub weight: f64,
}

/// A policy consulted once per root span.
pub trait SamplingPolicy: Send + Sync {
    fn sample(&self, params: Parameters) -> Decision;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sampling fraction must be between 0 and 1, got {0}")]
    InvalidFraction(f64),
    #[error("sampling QPS limit must not be negative, got {0}")]
    InvalidQps(f64),
}

/// Samples a `fraction` of requests, capped at `max_qps` sampled
/// requests per second.
///
/// Each sampled decision carries a weight that is a positive integer
/// multiple of `1 / fraction` (the weight unit): when the QPS cap denies
/// requests that passed the probabilistic gate, the next granted request
/// absorbs their weight, so the weighted sum of sampled requests tracks
/// the offered total.
pub struct LimitedSampler {
    fraction: f64,
    enabled: bool,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: Instant,
    /// Requests that passed the probabilistic gate but were denied a
    /// token since the last grant.
    skipped: f64,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}

impl LimitedSampler {
    /// `fraction` must lie in `[0, 1]` and `max_qps` must not be
    /// negative. A zero in either turns sampling off entirely.
    pub fn new(fraction: f64, max_qps: f64) -> Result<Self, Error> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(Error::InvalidFraction(fraction));
        }
        if max_qps < 0.0 || max_qps.is_nan() {
            return Err(Error::InvalidQps(max_qps));
        }
        let capacity = max_qps.max(1.0);
        Ok(LimitedSampler {
            fraction,
            enabled: fraction > 0.0 && max_qps > 0.0,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                capacity,
                rate: max_qps,
                last_refill: Instant::now(),
                skipped: 0.0,
            }),
        })
    }

    // Time-independent core of `sample`, driven by tests with a
    // synthetic clock and fixed rolls.
    fn decide(&self, params: Parameters, now: Instant, roll: f64) -> Decision {
        if !self.enabled || roll >= self.fraction {
            return Decision::default();
        }
        let Ok(mut bucket) = self.bucket.lock() else {
            return Decision::default();
        };
        bucket.refill(now);
        if bucket.tokens < 1.0 {
            bucket.skipped += 1.0;
            // The trace bit stays alive so downstream context does not
            // break mid-chain, but nothing is uploaded here.
            return Decision {
                trace: params.has_trace_header,
                sample: false,
                weight: 0.0,
            };
        }
        bucket.tokens -= 1.0;
        let weight = (1.0 + bucket.skipped) / self.fraction;
        bucket.skipped = 0.0;
        Decision {
            trace: true,
            sample: true,
            weight,
        }
    }
}

impl SamplingPolicy for LimitedSampler {
    fn sample(&self, params: Parameters) -> Decision {
        self.decide(params, Instant::now(), rand::rng().random())
    }
}
