use std::collections::VecDeque;
use std::time::Duration;

use crate::config::ServerPolicy;

/// A fixed-size ring of the most recent samples.
///
/// Pushing beyond capacity silently evicts the oldest sample.
#[derive(Debug, Clone)]
pub(crate) struct Window<T> {
    max_size: usize,
    values: VecDeque<T>,
}

impl<T> Window<T> {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            values: VecDeque::with_capacity(max_size.max(1)),
        }
    }

    pub(crate) fn push(&mut self, value: T) {
        if self.values.len() == self.max_size {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.values.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }

    pub(crate) const fn capacity(&self) -> usize {
        self.max_size
    }
}

/// Rolling health record of one server.
///
/// Tracks the outcome of the most recent exchanges and their response
/// times. The error rate divides by the window capacity rather than the
/// sample count, so a freshly created server needs a full run of
/// failures before it can trip, not just one bad first impression.
#[derive(Debug, Clone)]
pub(crate) struct RollingStats {
    outcomes: Window<bool>,
    response_times: Window<Duration>,
    max_error_rate: f64,
    total_success: u64,
    total_failure: u64,
}

impl RollingStats {
    pub(crate) fn new(policy: &ServerPolicy) -> Self {
        Self {
            outcomes: Window::new(policy.error_window),
            response_times: Window::new(policy.error_window),
            max_error_rate: policy.max_error_rate.clamp(0.0, 1.0),
            total_success: 0,
            total_failure: 0,
        }
    }

    pub(crate) fn record_success(&mut self, elapsed: Duration) {
        self.outcomes.push(true);
        self.response_times.push(elapsed);
        self.total_success += 1;
    }

    pub(crate) fn record_failure(&mut self) {
        self.outcomes.push(false);
        self.total_failure += 1;
    }

    /// Failure fraction of the rolling window, relative to capacity.
    pub(crate) fn error_rate(&self) -> f64 {
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        #[allow(clippy::cast_precision_loss)]
        {
            failures as f64 / self.outcomes.capacity() as f64
        }
    }

    /// Whether the failure rate has exceeded the configured ceiling.
    pub(crate) fn is_tripped(&self) -> bool {
        self.error_rate() > self.max_error_rate
    }

    /// Mean response time over the rolling window, `None` until the
    /// first successful exchange.
    pub(crate) fn mean_response_time(&self) -> Option<Duration> {
        if self.response_times.len() == 0 {
            return None;
        }
        let total: Duration = self.response_times.iter().sum();
        #[allow(clippy::cast_possible_truncation)]
        Some(total / self.response_times.len() as u32)
    }

    pub(crate) const fn totals(&self) -> (u64, u64) {
        (self.total_success, self.total_failure)
    }
}
