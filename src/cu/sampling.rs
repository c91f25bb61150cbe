/// Wavefront sampling.
///
/// Once wavefront run times have settled, simulating every wavefront in full
/// buys little accuracy. The sampler watches completed wavefront durations
/// through a long and a short sliding window; when both are full and their
/// means agree within a relative threshold, it starts predicting durations
/// and newly admitted wavefronts are retired at the predicted time instead of
/// being executed.
use std::collections::VecDeque;

use crate::config::SamplingConfig;

#[derive(Debug, Clone)]
struct Window {
    capacity: usize,
    samples: VecDeque<u64>,
    sum: u64,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Window {
            capacity,
            samples: VecDeque::with_capacity(capacity),
            sum: 0,
        }
    }

    fn push(&mut self, duration: u64) {
        if self.samples.len() == self.capacity {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.samples.push_back(duration);
        self.sum += duration;
    }

    fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.sum as f64 / self.samples.len() as f64
    }
}

#[derive(Debug, Clone)]
pub struct WfSampler {
    config: SamplingConfig,
    seen: usize,
    long: Window,
    short: Window,
    prediction: Option<u64>,
}

impl WfSampler {
    pub fn new(config: SamplingConfig) -> Self {
        WfSampler {
            long: Window::new(config.window),
            short: Window::new((config.window / 2).max(1)),
            config,
            seen: 0,
            prediction: None,
        }
    }

    /// Record the duration of a fully simulated wavefront.
    pub fn collect(&mut self, duration: u64) {
        if self.prediction.is_some() {
            return;
        }
        self.seen += 1;
        if self.seen <= self.config.warmup {
            return;
        }

        self.long.push(duration);
        self.short.push(duration);
        if !(self.long.is_full() && self.short.is_full()) {
            return;
        }

        let (long, short) = (self.long.mean(), self.short.mean());
        let diff = if long + short == 0.0 {
            0.0
        } else {
            (long - short) / (long + short)
        };
        if diff.abs() <= self.config.threshold {
            let predicted = short.round() as u64;
            log::info!("wavefront sampling enabled, predicted duration {predicted} cycles");
            self.prediction = Some(predicted);
        }
    }

    /// Predicted wavefront duration, once the windows agree.
    pub fn predict(&self) -> Option<u64> {
        self.prediction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler(warmup: usize, window: usize) -> WfSampler {
        WfSampler::new(SamplingConfig {
            warmup,
            window,
            threshold: 0.03,
        })
    }

    #[test]
    fn warmup_samples_are_ignored() {
        let mut s = sampler(4, 4);
        for _ in 0..4 {
            s.collect(1_000_000);
        }
        for _ in 0..4 {
            s.collect(100);
        }
        assert_eq!(s.predict(), Some(100));
    }

    #[test]
    fn diverging_windows_keep_sampling_off() {
        let mut s = sampler(0, 4);
        for d in [10, 10, 100, 100] {
            s.collect(d);
        }
        assert_eq!(s.predict(), None);
        // steady again: both windows converge on 100
        for _ in 0..4 {
            s.collect(100);
        }
        assert_eq!(s.predict(), Some(100));
    }

    #[test]
    fn prediction_freezes_once_enabled() {
        let mut s = sampler(0, 2);
        s.collect(50);
        s.collect(50);
        assert_eq!(s.predict(), Some(50));
        s.collect(5000);
        assert_eq!(s.predict(), Some(50));
    }
}
