//! Prometheus metrics for the ban engine.
//!
//! Every engine owns its own [`Registry`], so several engines (and the test
//! suite) never share counters.
//!
//! - `bans` / `bans_gone` / `bans_req` - bans currently on the list (gauges)
//! - `bans_added_total` / `bans_deleted_total` - list insertions and reclaims
//! - `bans_dups_total` - bans shadowed by a newer identical ban
//! - `bans_tested_total` / `bans_tests_tested_total` - object checks and the
//!   individual conditions they evaluated
//! - `bans_obj_killed_total` - objects expired by a matching ban
//! - `bans_lurker_contention_total` - lurker passes skipped on a busy bucket
//! - `bans_persisted_bytes` / `bans_persisted_fragmentation` - journal size
//!   and the part of it held by dropped bans

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Counted ban events.
#[derive(Debug, Clone)]
pub struct BanStats {
    registry: Registry,
    pub bans: IntGauge,
    pub bans_gone: IntGauge,
    pub bans_req: IntGauge,
    pub bans_added: IntCounter,
    pub bans_deleted: IntCounter,
    pub bans_dups: IntCounter,
    pub bans_tested: IntCounter,
    pub bans_tests_tested: IntCounter,
    pub bans_obj_killed: IntCounter,
    pub bans_lurker_contention: IntCounter,
    pub bans_persisted_bytes: IntGauge,
    pub bans_persisted_fragmentation: IntGauge,
}

impl Default for BanStats {
    fn default() -> Self {
        Self::new()
    }
}

impl BanStats {
    /// Create and register all ban metrics in a fresh registry.
    pub fn new() -> Self {
        let registry = Registry::new();

        // Helper macro to create and register a metric
        macro_rules! register {
            ($ty:ident, $name:literal, $help:literal) => {{
                let m = $ty::new($name, $help).expect(concat!($name, " creation failed"));
                if let Err(e) = registry.register(Box::new(m.clone())) {
                    tracing::warn!(error = %e, concat!("Failed to register metric ", $name));
                }
                m
            }};
        }

        Self {
            bans: register!(IntGauge, "bans", "Bans on the ban list"),
            bans_gone: register!(IntGauge, "bans_gone", "Bans marked gone"),
            bans_req: register!(IntGauge, "bans_req", "Bans using request data"),
            bans_added: register!(IntCounter, "bans_added_total", "Bans added"),
            bans_deleted: register!(IntCounter, "bans_deleted_total", "Bans reclaimed"),
            bans_dups: register!(IntCounter, "bans_dups_total", "Bans superseded by duplicates"),
            bans_tested: register!(IntCounter, "bans_tested_total", "Objects checked against bans"),
            bans_tests_tested: register!(
                IntCounter,
                "bans_tests_tested_total",
                "Ban conditions evaluated"
            ),
            bans_obj_killed: register!(IntCounter, "bans_obj_killed_total", "Objects killed by bans"),
            bans_lurker_contention: register!(
                IntCounter,
                "bans_lurker_contention_total",
                "Lurker passes skipped on bucket contention"
            ),
            bans_persisted_bytes: register!(
                IntGauge,
                "bans_persisted_bytes",
                "Bytes in the ban journal"
            ),
            bans_persisted_fragmentation: register!(
                IntGauge,
                "bans_persisted_fragmentation",
                "Journal bytes held by dropped bans"
            ),
            registry,
        }
    }

    /// Gather all metrics and encode them in Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!(error = %e, "Failed to encode Prometheus metrics");
            return String::new();
        }
        match String::from_utf8(buffer) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
                String::new()
            }
        }
    }
}
