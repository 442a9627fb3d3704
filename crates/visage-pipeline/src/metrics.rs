// crates/visage-pipeline/src/metrics.rs
//
// Rolling-window timing for a single instrumented operation. Each component
// owns one Metrics and brackets its hot path with start_clock / end_clock;
// a report line goes to the log every report_every_seconds and once more on
// drop.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use log::debug;

use visage_core::config::MetricsConfig;

/// An in-flight measurement. Obtained from `start_clock`, consumed by
/// `end_clock`.
#[derive(Clone, Copy, Debug)]
pub struct MetricsTick {
    start_time: f64,
}

struct Sample {
    start_time: f64,
    run_time:   f64,
}

struct MetricsState {
    entries:              VecDeque<Sample>,
    last_report:          f64,
    average_time_seconds: f64,
    worst_time_seconds:   f64,
    rate:                 f64,
    times_string:         String,
    rate_string:          String,
}

pub struct Metrics {
    name:                 String,
    metric_is_frames:     bool,
    average_over_seconds: f64,
    report_every_seconds: f64,
    epoch:                Instant,
    state:                Mutex<MetricsState>,
}

impl Metrics {
    /// `metric_is_frames` selects the report wording: per-frame operations
    /// report "frames/sec", everything else "tasks/sec".
    pub fn new(config: &MetricsConfig, name: &str, metric_is_frames: bool) -> Metrics {
        Metrics {
            name:                 name.to_string(),
            metric_is_frames,
            average_over_seconds: config.average_over_seconds,
            report_every_seconds: config.report_every_seconds,
            epoch:                Instant::now(),
            state:                Mutex::new(MetricsState {
                entries:              VecDeque::new(),
                last_report:          0.0,
                average_time_seconds: 0.0,
                worst_time_seconds:   0.0,
                rate:                 0.0,
                times_string:         "N/A".to_string(),
                rate_string:          "N/A".to_string(),
            }),
        }
    }

    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    pub fn start_clock(&self) -> MetricsTick {
        MetricsTick {
            start_time: self.now(),
        }
    }

    pub fn end_clock(&self, tick: MetricsTick) {
        let now = self.now();
        let run_time = now - tick.start_time;

        let mut state = self.state.lock().unwrap();
        state.entries.push_front(Sample {
            start_time: tick.start_time,
            run_time,
        });
        while state
            .entries
            .back()
            .is_some_and(|sample| sample.start_time <= tick.start_time - self.average_over_seconds)
        {
            state.entries.pop_back();
        }

        let num_entries = state.entries.len();
        let mut average = 0.0;
        let mut worst: f64 = 0.0;
        for sample in &state.entries {
            average += sample.run_time;
            worst = worst.max(sample.run_time);
        }
        average /= num_entries as f64;
        state.average_time_seconds = average;
        state.worst_time_seconds = worst;
        state.times_string = format!(
            "times: <avg {:.2}ms, worst {:.2}ms>",
            average * 1000.0,
            worst * 1000.0
        );

        state.rate = if num_entries > 1 {
            let span = now - state.entries.back().unwrap().start_time;
            num_entries as f64 / span
        } else {
            0.0
        };
        let rate_prefix = if self.metric_is_frames {
            "frames/sec"
        } else {
            "tasks/sec"
        };
        state.rate_string = format!("{rate_prefix}: <{:.2}>", state.rate);

        if state.last_report + self.report_every_seconds <= now {
            debug!(
                "[Metrics<{}>] {}, {}",
                self.name, state.rate_string, state.times_string
            );
            state.last_report = now;
        }
    }

    pub fn average_time_seconds(&self) -> f64 {
        self.state.lock().unwrap().average_time_seconds
    }

    pub fn worst_time_seconds(&self) -> f64 {
        self.state.lock().unwrap().worst_time_seconds
    }

    pub fn rate(&self) -> f64 {
        self.state.lock().unwrap().rate
    }

    pub fn times_string(&self) -> String {
        self.state.lock().unwrap().times_string.clone()
    }

    pub fn rate_string(&self) -> String {
        self.state.lock().unwrap().rate_string.clone()
    }
}

impl Drop for Metrics {
    fn drop(&mut self) {
        let state = self.state.lock().unwrap();
        debug!(
            "[Metrics<{}>] final report: {}, {}",
            self.name, state.rate_string, state.times_string
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> Metrics {
        Metrics::new(&MetricsConfig::default(), "Test", false)
    }

    #[test]
    fn end_clock_updates_the_window() {
        let m = metrics();
        let tick = m.start_clock();
        std::thread::sleep(std::time::Duration::from_millis(2));
        m.end_clock(tick);
        assert!(m.worst_time_seconds() > 0.0);
        assert!(m.worst_time_seconds() >= m.average_time_seconds());
        assert!(m.times_string().contains("avg"));
    }

    #[test]
    fn rate_needs_at_least_two_samples() {
        let m = metrics();
        let tick = m.start_clock();
        m.end_clock(tick);
        assert_eq!(m.rate(), 0.0);
        let tick = m.start_clock();
        m.end_clock(tick);
        assert!(m.rate() > 0.0);
    }
}
