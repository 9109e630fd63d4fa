//! Shared daemon state.

use std::sync::Arc;

use chrono::Duration;
use harman_config::HarmanConfig;
use harman_exchange::ExchangeAdapter;
use harman_risk::RiskConfig;
use harman_runtime::RuntimeConfig;
use sqlx::PgPool;

use crate::quotes::QuoteStore;

#[derive(Clone, Copy)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

pub struct AppState {
    pub pool: PgPool,
    pub adapter: Arc<dyn ExchangeAdapter>,
    pub quotes: Arc<QuoteStore>,
    pub config: HarmanConfig,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        adapter: Arc<dyn ExchangeAdapter>,
        quotes: Arc<QuoteStore>,
        config: HarmanConfig,
    ) -> Self {
        Self {
            pool,
            adapter,
            quotes,
            config,
            build: BuildInfo {
                service: env!("CARGO_PKG_NAME"),
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }

    pub fn risk_config(&self) -> RiskConfig {
        RiskConfig {
            default_max_notional_cents: self.config.default_max_notional_cents,
            quote_stale_after: Duration::seconds(self.config.quote_stale_after_secs),
        }
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            worker_count: self.config.worker_count,
            poll_interval_ms: self.config.poll_interval_ms,
            recovery_horizon_secs: self.config.recovery_horizon_secs,
            reconcile_interval_secs: self.config.reconcile_interval_secs,
            reconcile_grace_secs: self.config.reconcile_grace_secs,
            ioc_grace_secs: self.config.ioc_grace_secs,
        }
    }
}
