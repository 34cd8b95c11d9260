//! Metrics module
//!
//! Prometheus counters and gauges for the backup pipeline. Each pipeline owns
//! its own [`Registry`] so several pipelines (and tests) can coexist in one
//! process without name collisions.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};

const NAMESPACE: &str = "fragvault";

/// Pipeline-wide metrics.
#[derive(Clone)]
pub struct PipelineMetrics {
    registry: Registry,

    /// Blocks encoded into fragments
    pub blocks_made: IntCounter,
    /// Raid tasks finished, by `kind` and `result`
    pub raid_tasks: IntCounterVec,
    /// Raid tasks currently executing
    pub raid_running: IntGauge,
    /// Fragment sends, by `result`
    pub fragments_sent: IntCounterVec,
    pub fragments_fetched: IntCounter,
    pub fragments_rebuilt: IntCounter,
    pub fragments_purged: IntCounter,
    /// Blocks currently beyond the correctable threshold
    pub at_risk_blocks: IntGauge,
    pub suppliers_offline: IntGauge,
    pub bytes_backed_up: IntCounter,
    pub bytes_restored: IntCounter,
    pub monitor_cycles: IntCounter,
}

fn prom(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

impl PipelineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::with_opts(opts(name, help)).map_err(prom)?;
            registry.register(Box::new(c.clone())).map_err(prom)?;
            Ok(c)
        };
        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let g = IntGauge::with_opts(opts(name, help)).map_err(prom)?;
            registry.register(Box::new(g.clone())).map_err(prom)?;
            Ok(g)
        };
        let counter_vec = |name: &str, help: &str, labels: &[&str]| -> Result<IntCounterVec> {
            let c = IntCounterVec::new(opts(name, help), labels).map_err(prom)?;
            registry.register(Box::new(c.clone())).map_err(prom)?;
            Ok(c)
        };

        let blocks_made = counter("blocks_made_total", "Blocks split into fragments")?;
        let raid_tasks = counter_vec(
            "raid_tasks_total",
            "Raid tasks finished",
            &["kind", "result"],
        )?;
        let raid_running = gauge("raid_running", "Raid tasks currently executing")?;
        let fragments_sent = counter_vec(
            "fragments_sent_total",
            "Fragment send attempts",
            &["result"],
        )?;
        let fragments_fetched = counter("fragments_fetched_total", "Fragments fetched back")?;
        let fragments_rebuilt = counter("fragments_rebuilt_total", "Fragments regenerated")?;
        let fragments_purged =
            counter("fragments_purged_total", "Local fragment copies deleted")?;
        let at_risk_blocks = gauge("at_risk_blocks", "Blocks beyond the correctable threshold")?;
        let suppliers_offline = gauge("suppliers_offline", "Suppliers currently offline")?;
        let bytes_backed_up = counter("bytes_backed_up_total", "Plaintext bytes backed up")?;
        let bytes_restored = counter("bytes_restored_total", "Plaintext bytes restored")?;
        let monitor_cycles = counter("monitor_cycles_total", "Monitor reconciliation cycles")?;

        Ok(Self {
            registry,
            blocks_made,
            raid_tasks,
            raid_running,
            fragments_sent,
            fragments_fetched,
            fragments_rebuilt,
            fragments_purged,
            at_risk_blocks,
            suppliers_offline,
            bytes_backed_up,
            bytes_restored,
            monitor_cycles,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(prom)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMetrics").finish_non_exhaustive()
    }
}
