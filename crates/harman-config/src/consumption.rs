//! Typed readout of the merged config document.

use anyhow::{bail, Result};
use serde_json::Value;

use crate::LoadedConfig;

/// Everything the daemon and runtime tune, with production-safe defaults.
#[derive(Debug, Clone)]
pub struct HarmanConfig {
    pub bind_addr: String,
    pub exchange: String,
    pub worker_count: usize,
    pub poll_interval_ms: u64,
    pub recovery_horizon_secs: i64,
    pub reconcile_interval_secs: u64,
    pub reconcile_grace_secs: i64,
    pub ioc_grace_secs: i64,
    pub quote_stale_after_secs: i64,
    /// Process default; a session's `max_notional_cents` overrides it.
    pub default_max_notional_cents: i64,
}

impl Default for HarmanConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            exchange: "kalshi".to_string(),
            worker_count: 4,
            poll_interval_ms: 500,
            recovery_horizon_secs: 300,
            reconcile_interval_secs: 5,
            reconcile_grace_secs: 60,
            ioc_grace_secs: 30,
            quote_stale_after_secs: 30,
            default_max_notional_cents: 100_000, // $1,000
        }
    }
}

fn cfg_str<'a>(v: &'a Value, ptr: &str) -> Option<&'a str> {
    v.pointer(ptr).and_then(|x| x.as_str())
}

fn cfg_u64(v: &Value, ptr: &str) -> Option<u64> {
    v.pointer(ptr).and_then(|x| x.as_u64())
}

fn cfg_i64(v: &Value, ptr: &str) -> Option<i64> {
    v.pointer(ptr).and_then(|x| x.as_i64())
}

impl HarmanConfig {
    /// Read the merged document over the defaults. Nonsensical values are
    /// a configuration error (the process must exit nonzero on them).
    pub fn from_loaded(loaded: &LoadedConfig) -> Result<Self> {
        let v = &loaded.config_json;
        let mut cfg = Self::default();

        if let Some(addr) = cfg_str(v, "/daemon/bind_addr") {
            cfg.bind_addr = addr.to_string();
        }
        if let Some(exchange) = cfg_str(v, "/daemon/exchange") {
            cfg.exchange = exchange.to_string();
        }
        if let Some(workers) = cfg_u64(v, "/sweeper/workers") {
            cfg.worker_count = workers as usize;
        }
        if let Some(ms) = cfg_u64(v, "/sweeper/poll_interval_ms") {
            cfg.poll_interval_ms = ms;
        }
        if let Some(secs) = cfg_i64(v, "/sweeper/recovery_horizon_secs") {
            cfg.recovery_horizon_secs = secs;
        }
        if let Some(secs) = cfg_u64(v, "/reconcile/interval_secs") {
            cfg.reconcile_interval_secs = secs;
        }
        if let Some(secs) = cfg_i64(v, "/reconcile/grace_secs") {
            cfg.reconcile_grace_secs = secs;
        }
        if let Some(secs) = cfg_i64(v, "/reconcile/ioc_grace_secs") {
            cfg.ioc_grace_secs = secs;
        }
        if let Some(secs) = cfg_i64(v, "/risk/quote_stale_after_secs") {
            cfg.quote_stale_after_secs = secs;
        }
        if let Some(cents) = cfg_i64(v, "/risk/default_max_notional_cents") {
            cfg.default_max_notional_cents = cents;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            bail!("sweeper.workers must be > 0");
        }
        if self.poll_interval_ms == 0 {
            bail!("sweeper.poll_interval_ms must be > 0");
        }
        if self.recovery_horizon_secs <= 0 {
            bail!("sweeper.recovery_horizon_secs must be > 0");
        }
        if self.reconcile_interval_secs == 0 {
            bail!("reconcile.interval_secs must be > 0");
        }
        if self.reconcile_grace_secs <= 0 {
            bail!("reconcile.grace_secs must be > 0");
        }
        if self.quote_stale_after_secs <= 0 {
            bail!("risk.quote_stale_after_secs must be > 0");
        }
        if self.default_max_notional_cents <= 0 {
            bail!("risk.default_max_notional_cents must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(v: serde_json::Value) -> LoadedConfig {
        LoadedConfig {
            canonical_json: v.to_string(),
            config_json: v,
            config_hash: "test".to_string(),
        }
    }

    #[test]
    fn defaults_apply_when_document_is_empty() {
        let cfg = HarmanConfig::from_loaded(&LoadedConfig::empty()).unwrap();
        assert_eq!(cfg.worker_count, 4);
        assert_eq!(cfg.default_max_notional_cents, 100_000);
    }

    #[test]
    fn document_overrides_defaults() {
        let cfg = HarmanConfig::from_loaded(&loaded(serde_json::json!({
            "daemon": { "bind_addr": "0.0.0.0:9000" },
            "sweeper": { "workers": 8 },
            "risk": { "default_max_notional_cents": 5_000 },
        })))
        .unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:9000");
        assert_eq!(cfg.worker_count, 8);
        assert_eq!(cfg.default_max_notional_cents, 5_000);
    }

    #[test]
    fn zero_workers_is_a_configuration_error() {
        let err = HarmanConfig::from_loaded(&loaded(serde_json::json!({
            "sweeper": { "workers": 0 },
        })))
        .unwrap_err();
        assert!(err.to_string().contains("workers"));
    }
}
