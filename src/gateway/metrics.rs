//! Gateway counters, exposed on `/metrics`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Process-wide gateway counters.
#[derive(Debug)]
pub struct GatewayMetrics {
    connections_opened: AtomicU64,
    connections_active: AtomicU64,
    bus_events: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
    echoes_skipped: AtomicU64,
    client_events: AtomicU64,
    malformed_events: AtomicU64,
    start_time: Instant,
}

/// Point-in-time copy of [`GatewayMetrics`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub uptime: String,
    pub connections: ConnectionCounts,
    pub events: EventCounts,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConnectionCounts {
    pub opened: u64,
    pub active: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EventCounts {
    pub bus_received: u64,
    pub delivered: u64,
    pub delivery_failures: u64,
    pub echoes_skipped: u64,
    pub client_received: u64,
    pub client_malformed: u64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            connections_opened: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            bus_events: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            echoes_skipped: AtomicU64::new(0),
            client_events: AtomicU64::new(0),
            malformed_events: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturating: never wrap below zero
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn bus_event(&self) {
        self.bus_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered(&self, delivered: usize, failed: usize) {
        self.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        self.delivery_failures.fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub fn echo_skipped(&self) {
        self.echoes_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_event(&self) {
        self.client_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_event(&self) {
        self.malformed_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self.uptime_seconds();
        MetricsSnapshot {
            uptime_seconds: uptime,
            uptime: format_uptime(uptime),
            connections: ConnectionCounts {
                opened: self.connections_opened.load(Ordering::Relaxed),
                active: self.connections_active.load(Ordering::Relaxed),
            },
            events: EventCounts {
                bus_received: self.bus_events.load(Ordering::Relaxed),
                delivered: self.deliveries.load(Ordering::Relaxed),
                delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
                echoes_skipped: self.echoes_skipped.load(Ordering::Relaxed),
                client_received: self.client_events.load(Ordering::Relaxed),
                client_malformed: self.malformed_events.load(Ordering::Relaxed),
            },
        }
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable uptime ("42s", "3m 5s", "2h 0m 7s").
pub fn format_uptime(uptime: u64) -> String {
    if uptime < 60 {
        format!("{}s", uptime)
    } else if uptime < 3600 {
        format!("{}m {}s", uptime / 60, uptime % 60)
    } else {
        format!("{}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60)
    }
}
