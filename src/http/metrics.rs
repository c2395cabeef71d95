//! Process-lifetime request counters and moving-average latencies, exposed
//! as JSON (`/api/stats`, `/api/metrics`) and Prometheus text (`/metrics`).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Default)]
pub struct Metrics {
    total_requests: AtomicU64,
    search_requests: AtomicU64,
    chat_requests: AtomicU64,
    embed_requests: AtomicU64,
    error_count: AtomicU64,
    avg_latency_ms: Mutex<HashMap<&'static str, f64>>,
}

pub struct RequestTimer {
    route: &'static str,
    start: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_request(&self, route: &'static str) -> RequestTimer {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        match route {
            "search" => {
                self.search_requests.fetch_add(1, Ordering::Relaxed);
            }
            "chat" => {
                self.chat_requests.fetch_add(1, Ordering::Relaxed);
            }
            "embed" => {
                self.embed_requests.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        RequestTimer {
            route,
            start: Instant::now(),
        }
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finish(&self, timer: RequestTimer) {
        let sample = timer.start.elapsed().as_secs_f64() * 1000.0;
        let mut latencies = self.avg_latency_ms.lock();
        let entry = latencies.entry(timer.route).or_insert(sample);
        *entry = 0.9 * *entry + 0.1 * sample;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            search_requests: self.search_requests.load(Ordering::Relaxed),
            chat_requests: self.chat_requests.load(Ordering::Relaxed),
            embed_requests: self.embed_requests.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            avg_latency_ms: self.avg_latency_ms.lock().clone(),
        }
    }

    pub fn render_prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut out = String::new();
        out.push_str("# HELP ragline_requests_total Total HTTP requests handled.\n");
        out.push_str("# TYPE ragline_requests_total counter\n");
        out.push_str(&format!("ragline_requests_total {}\n", snap.total_requests));
        out.push_str(&format!("ragline_requests_total{{route=\"search\"}} {}\n", snap.search_requests));
        out.push_str(&format!("ragline_requests_total{{route=\"chat\"}} {}\n", snap.chat_requests));
        out.push_str(&format!("ragline_requests_total{{route=\"embed\"}} {}\n", snap.embed_requests));
        out.push_str("# HELP ragline_errors_total Total requests that returned an error status.\n");
        out.push_str("# TYPE ragline_errors_total counter\n");
        out.push_str(&format!("ragline_errors_total {}\n", snap.error_count));
        out.push_str("# HELP ragline_request_latency_ms_avg Exponential moving average latency per route.\n");
        out.push_str("# TYPE ragline_request_latency_ms_avg gauge\n");
        for (route, avg) in &snap.avg_latency_ms {
            out.push_str(&format!("ragline_request_latency_ms_avg{{route=\"{route}\"}} {avg:.3}\n"));
        }
        out
    }
}

#[derive(serde::Serialize, Clone)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub search_requests: u64,
    pub chat_requests: u64,
    pub embed_requests: u64,
    pub error_count: u64,
    pub avg_latency_ms: HashMap<&'static str, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_requests_by_route() {
        let metrics = Metrics::new();
        let timer = metrics.start_request("search");
        metrics.finish(timer);
        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.search_requests, 1);
        assert_eq!(snap.chat_requests, 0);
    }

    #[test]
    fn error_counter_increments_independently_of_requests() {
        let metrics = Metrics::new();
        metrics.record_error();
        metrics.record_error();
        assert_eq!(metrics.snapshot().error_count, 2);
    }

    #[test]
    fn prometheus_output_includes_expected_metric_names() {
        let metrics = Metrics::new();
        let text = metrics.render_prometheus();
        assert!(text.contains("ragline_requests_total"));
        assert!(text.contains("ragline_errors_total"));
    }
}
