//! Drivers for stress runs: a bounded, cancellable iteration loop and the
//! reserve-latency scaling check.

use crate::driver::DeviceIndex;
use crate::error::ReproResult;
use crate::vmm::VirtualMemoryManager;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Shared flag that asks a [`StressLoop`] to stop after the current iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSummary {
    pub iterations: u64,
    pub elapsed: Duration,
    pub reason: StopReason,
}

/// Repeats a step until a bound, a cancellation, or the first error.
#[derive(Debug, Clone, Default)]
pub struct StressLoop {
    pub max_iterations: Option<u64>,
    pub cancel: CancelToken,
}

impl StressLoop {
    #[must_use]
    pub fn bounded(max_iterations: u64) -> Self {
        Self {
            max_iterations: Some(max_iterations),
            cancel: CancelToken::new(),
        }
    }

    /// Runs until stopped or cancelled; only an error or the token ends it.
    #[must_use]
    pub fn unbounded(cancel: CancelToken) -> Self {
        Self {
            max_iterations: None,
            cancel,
        }
    }

    /// Calls `step` with the zero-based iteration index.
    ///
    /// # Errors
    /// The first error returned by `step`, unchanged.
    pub fn run(&self, mut step: impl FnMut(u64) -> ReproResult<()>) -> ReproResult<LoopSummary> {
        let start = Instant::now();
        let mut iterations = 0u64;

        let reason = loop {
            if self.max_iterations.is_some_and(|max| iterations >= max) {
                break StopReason::Completed;
            }
            if self.cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if let Err(e) = step(iterations) {
                tracing::warn!(iteration = iterations, error = %e, "stress step failed");
                return Err(e);
            }
            iterations += 1;
        };

        let summary = LoopSummary {
            iterations,
            elapsed: start.elapsed(),
            reason,
        };
        tracing::info!(
            iterations,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            reason = ?reason,
            "stress loop finished"
        );
        Ok(summary)
    }
}

/// Reserve latencies of a small and a large request, and their ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReserveScaling {
    pub small: Duration,
    pub large: Duration,
    pub ratio: f64,
    pub within_bound: bool,
}

/// Reserves and releases `small` then `large` bytes and compares latencies.
///
/// Reservation is address bookkeeping only, so the large request should cost
/// about as much as the small one. A ratio above `max_factor` is logged as a
/// warning and reported through `within_bound`.
pub fn measure_reserve_scaling(
    vmm: &mut VirtualMemoryManager,
    device: DeviceIndex,
    small: usize,
    large: usize,
    max_factor: f64,
) -> ReproResult<ReserveScaling> {
    let mut measure = |size: usize| -> ReproResult<Duration> {
        let r = vmm.reserve(device, size)?;
        vmm.release(&r)?;
        Ok(r.reserve_latency)
    };

    // Warm-up so first-touch costs land on neither sample.
    measure(small)?;
    let small_latency = measure(small)?;
    let large_latency = measure(large)?;

    // Clamp so a sub-microsecond small sample does not explode the ratio.
    let floor = Duration::from_micros(1).as_secs_f64();
    let ratio = large_latency.as_secs_f64().max(floor) / small_latency.as_secs_f64().max(floor);
    let within_bound = ratio < max_factor;

    if within_bound {
        tracing::info!(
            device,
            small,
            large,
            small_us = small_latency.as_micros() as u64,
            large_us = large_latency.as_micros() as u64,
            ratio,
            "reserve latency scales"
        );
    } else {
        tracing::warn!(
            device,
            small,
            large,
            small_us = small_latency.as_micros() as u64,
            large_us = large_latency.as_micros() as u64,
            ratio,
            max_factor,
            "reserve latency grows with size"
        );
    }

    Ok(ReserveScaling {
        small: small_latency,
        large: large_latency,
        ratio,
        within_bound,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReproError;

    #[test]
    fn stops_at_bound() {
        let mut seen = Vec::new();
        let summary = StressLoop::bounded(5)
            .run(|i| {
                seen.push(i);
                Ok(())
            })
            .unwrap();
        assert_eq!(summary.iterations, 5);
        assert_eq!(summary.reason, StopReason::Completed);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn stops_on_cancel() {
        let cancel = CancelToken::new();
        let stress = StressLoop::unbounded(cancel.clone());
        let summary = stress
            .run(|i| {
                if i == 9 {
                    cancel.cancel();
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(summary.iterations, 10);
        assert_eq!(summary.reason, StopReason::Cancelled);
    }

    #[test]
    fn propagates_first_error() {
        let mut calls = 0;
        let err = StressLoop::bounded(100)
            .run(|i| {
                calls += 1;
                if i == 3 {
                    Err(ReproError::Range("boom".into()))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(matches!(err, ReproError::Range(_)));
        assert_eq!(calls, 4);
    }

    #[test]
    fn zero_bound_never_steps() {
        let summary = StressLoop::bounded(0).run(|_| unreachable!()).unwrap();
        assert_eq!(summary.iterations, 0);
    }
}
