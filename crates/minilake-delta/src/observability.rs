//! Metrics for ingestion and query execution
//!
//! ## Metrics Exposed:
//! - `minilake_ingest_duration_seconds` - Ingest latency histogram (load + commit)
//! - `minilake_ingest_rows_total` - Rows committed by ingestion
//! - `minilake_ingest_errors_total` - Failed ingests
//! - `minilake_write_conflicts_total` - Commits rejected because another writer won
//! - `minilake_query_duration_seconds` - Query latency histogram (bind + execute + convert)
//! - `minilake_query_rows_total` - Rows returned to callers
//! - `minilake_query_errors_total` - Failed queries (timeouts included)
//! - `minilake_query_timeouts_total` - Queries abandoned at their deadline
//!
//! Metrics are registered lazily by the `metrics` facade; installing an
//! exporter is left to the embedding application.

use metrics::{counter, histogram};
use std::time::Instant;

// ==================== Ingest Metrics ====================

/// Timer for ingest operations (auto-records on drop)
pub struct IngestTimer {
    start: Instant,
}

impl Drop for IngestTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        histogram!("minilake_ingest_duration_seconds", duration);
    }
}

/// Start timing an ingest
pub fn time_ingest() -> IngestTimer {
    IngestTimer {
        start: Instant::now(),
    }
}

pub fn increment_ingest_rows(count: usize) {
    counter!("minilake_ingest_rows_total", count as u64);
}

pub fn increment_ingest_errors() {
    counter!("minilake_ingest_errors_total", 1);
}

pub fn increment_write_conflicts() {
    counter!("minilake_write_conflicts_total", 1);
}

// ==================== Query Metrics ====================

/// Timer for queries (auto-records on drop)
pub struct QueryTimer {
    start: Instant,
}

impl Drop for QueryTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        histogram!("minilake_query_duration_seconds", duration);
    }
}

/// Start timing a query
pub fn time_query() -> QueryTimer {
    QueryTimer {
        start: Instant::now(),
    }
}

pub fn increment_query_rows(count: usize) {
    counter!("minilake_query_rows_total", count as u64);
}

pub fn increment_query_errors() {
    counter!("minilake_query_errors_total", 1);
}

pub fn increment_query_timeouts() {
    counter!("minilake_query_timeouts_total", 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::{
        Counter, CounterFn, Gauge, Histogram, HistogramFn, Key, KeyName, Recorder, SharedString,
        Unit,
    };
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, OnceLock};
    use std::thread;
    use std::time::Duration;

    /// Keeps every counter total and histogram sample, keyed by metric name
    #[derive(Default)]
    struct Captured {
        counters: Mutex<HashMap<String, u64>>,
        histograms: Mutex<HashMap<String, Vec<f64>>>,
    }

    struct Series {
        name: String,
        captured: &'static Captured,
    }

    impl CounterFn for Series {
        fn increment(&self, value: u64) {
            *self
                .captured
                .counters
                .lock()
                .unwrap()
                .entry(self.name.clone())
                .or_default() += value;
        }

        fn absolute(&self, value: u64) {
            self.captured
                .counters
                .lock()
                .unwrap()
                .insert(self.name.clone(), value);
        }
    }

    impl HistogramFn for Series {
        fn record(&self, value: f64) {
            self.captured
                .histograms
                .lock()
                .unwrap()
                .entry(self.name.clone())
                .or_default()
                .push(value);
        }
    }

    struct CapturingRecorder(&'static Captured);

    impl CapturingRecorder {
        fn series(&self, key: &Key) -> Arc<Series> {
            Arc::new(Series {
                name: key.name().to_string(),
                captured: self.0,
            })
        }
    }

    impl Recorder for CapturingRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key) -> Counter {
            Counter::from_arc(self.series(key))
        }

        fn register_gauge(&self, _: &Key) -> Gauge {
            Gauge::noop()
        }

        fn register_histogram(&self, key: &Key) -> Histogram {
            Histogram::from_arc(self.series(key))
        }
    }

    /// Install the process-wide capturing recorder on first use
    fn captured() -> &'static Captured {
        static CAPTURED: OnceLock<&'static Captured> = OnceLock::new();
        CAPTURED.get_or_init(|| {
            let captured: &'static Captured = Box::leak(Box::default());
            metrics::set_boxed_recorder(Box::new(CapturingRecorder(captured)))
                .expect("no other recorder is installed in unit tests");
            captured
        })
    }

    fn counter_total(name: &str) -> u64 {
        captured().counters.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    fn samples(name: &str) -> Vec<f64> {
        captured()
            .histograms
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    #[test]
    fn test_timers_record_on_drop() {
        let ingest_before = samples("minilake_ingest_duration_seconds").len();
        let query_before = samples("minilake_query_duration_seconds").len();

        let ingest = time_ingest();
        let query = time_query();
        thread::sleep(Duration::from_millis(5));
        drop(ingest);
        drop(query);

        // Other tests in this binary may record concurrently, so only growth is checked
        let ingest = samples("minilake_ingest_duration_seconds");
        let query = samples("minilake_query_duration_seconds");
        assert!(ingest.len() > ingest_before);
        assert!(query.len() > query_before);
        assert!(ingest.iter().any(|secs| *secs >= 0.005));
        assert!(query.iter().any(|secs| *secs >= 0.005));
    }

    #[test]
    fn test_increment_counters() {
        let names = [
            "minilake_ingest_rows_total",
            "minilake_ingest_errors_total",
            "minilake_write_conflicts_total",
            "minilake_query_rows_total",
            "minilake_query_errors_total",
            "minilake_query_timeouts_total",
        ];
        let before: Vec<u64> = names.iter().map(|name| counter_total(name)).collect();

        increment_ingest_rows(100);
        increment_ingest_errors();
        increment_write_conflicts();
        increment_query_rows(10);
        increment_query_errors();
        increment_query_timeouts();

        let grew: Vec<u64> = names
            .iter()
            .zip(&before)
            .map(|(name, before)| counter_total(name) - before)
            .collect();
        assert!(grew[0] >= 100);
        assert!(grew[3] >= 10);
        for (name, delta) in names.iter().zip(&grew) {
            assert!(*delta >= 1, "{} was not incremented", name);
        }
    }
}
