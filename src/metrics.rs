//! Metrics and observability for media_intake

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Global metrics collector
#[derive(Default)]
pub struct Metrics {
    pub total_requests: AtomicU64,
    pub successful_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub total_latency_ms: AtomicU64,

    // Per-endpoint counters
    pub vision_count: AtomicU64,
    pub sonic_count: AtomicU64,

    // Per-failure-class counters
    pub input_errors: AtomicU64,
    pub decode_errors: AtomicU64,
    pub inference_errors: AtomicU64,
    pub unexpected_errors: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_request(&self, kind: &str, outcome: Result<(), ErrorKind>, latency_ms: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);

        match outcome {
            Ok(()) => {
                self.successful_requests.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                let counter = match error {
                    ErrorKind::Input => &self.input_errors,
                    ErrorKind::Decode => &self.decode_errors,
                    ErrorKind::Inference => &self.inference_errors,
                    ErrorKind::Unexpected => &self.unexpected_errors,
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }

        match kind {
            "vision" => self.vision_count.fetch_add(1, Ordering::Relaxed),
            "sonic" => self.sonic_count.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let successful = self.successful_requests.load(Ordering::Relaxed);
        let failed = self.failed_requests.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            error_rate: if total > 0 { failed as f64 / total as f64 } else { 0.0 },
            avg_latency_ms: if total > 0 { total_latency / total } else { 0 },
            endpoints: EndpointMetrics {
                vision: self.vision_count.load(Ordering::Relaxed),
                sonic: self.sonic_count.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                input: self.input_errors.load(Ordering::Relaxed),
                decode: self.decode_errors.load(Ordering::Relaxed),
                inference: self.inference_errors.load(Ordering::Relaxed),
                unexpected: self.unexpected_errors.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub error_rate: f64,
    pub avg_latency_ms: u64,
    pub endpoints: EndpointMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointMetrics {
    pub vision: u64,
    pub sonic: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub input: u64,
    pub decode: u64,
    pub inference: u64,
    pub unexpected: u64,
}

/// Wall-clock marks of one request.
///
/// `prepared` is taken once the sample is ready for the model, `inferred`
/// once the model returned. Either may be missing when the request failed
/// before reaching that point.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    start: Instant,
    prepared: Option<Instant>,
    inferred: Option<Instant>,
}

impl PhaseTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
            prepared: None,
            inferred: None,
        }
    }

    pub fn mark_prepared(&mut self) {
        self.prepared = Some(Instant::now());
    }

    pub fn mark_inferred(&mut self) {
        self.inferred = Some(Instant::now());
    }

    /// Transport plus media decode plus canonicalization.
    pub fn prepare(&self) -> Option<Duration> {
        self.prepared.map(|p| p.duration_since(self.start))
    }

    pub fn inference(&self) -> Option<Duration> {
        match (self.prepared, self.inferred) {
            (Some(p), Some(i)) => Some(i.duration_since(p)),
            _ => None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
