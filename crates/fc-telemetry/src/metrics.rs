//! Lightweight in-process counters and gauges. An external exporter
//! (out of scope for this crate) is expected to scrape [`Metrics::snapshot`]
//! periodically; we do not ship a vendor-specific exporter ourselves.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use ahash::AHashMap;
use serde::Serialize;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct Metrics {
    counters: RwLock<AHashMap<&'static str, AtomicU64>>,
    gauges: RwLock<AHashMap<&'static str, AtomicI64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &'static str) {
        self.incr_by(name, 1);
    }

    pub fn incr_by(&self, name: &'static str, delta: u64) {
        if let Some(c) = self.counters.read().unwrap().get(name) {
            c.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        let mut counters = self.counters.write().unwrap();
        counters
            .entry(name)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set_gauge(&self, name: &'static str, value: i64) {
        if let Some(g) = self.gauges.read().unwrap().get(name) {
            g.store(value, Ordering::Relaxed);
            return;
        }
        let mut gauges = self.gauges.write().unwrap();
        gauges.entry(name).or_insert_with(|| AtomicI64::new(0)).store(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.to_string(), v.load(Ordering::Relaxed)))
            .collect();
        let gauges = self
            .gauges
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.to_string(), v.load(Ordering::Relaxed)))
            .collect();
        MetricsSnapshot { counters, gauges }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: std::collections::BTreeMap<String, u64>,
    pub gauges: std::collections::BTreeMap<String, i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new();
        m.incr("sessions_created");
        m.incr_by("sessions_created", 2);
        let snap = m.snapshot();
        assert_eq!(snap.counters["sessions_created"], 3);
    }

    #[test]
    fn gauges_overwrite() {
        let m = Metrics::new();
        m.set_gauge("online_runners", 5);
        m.set_gauge("online_runners", 7);
        let snap = m.snapshot();
        assert_eq!(snap.gauges["online_runners"], 7);
    }
}
