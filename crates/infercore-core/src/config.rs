//! Configuration structs consumed by the core's components.
//!
//! Loading these from TOML/env is an ambient-layer concern
//! (`infercore-api::config`); this module only defines the shapes and
//! their numeric defaults, using the `derivative(Default(value =
//! "..."))` idiom.

use derivative::Derivative;
use serde::{Deserialize, Serialize};

#[derive(Debug, Derivative, Clone, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct PoolConfig {
    #[derivative(Default(value = "10"))]
    pub max_size: usize,
    #[derivative(Default(value = "900"))]
    pub idle_ttl_secs: u64,
}

#[derive(Debug, Derivative, Clone, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct RouterConfig {
    #[derivative(Default(value = "\"balanced\".into()"))]
    pub strategy: String,
    #[derivative(Default(value = "BalancedWeights::default()"))]
    pub balanced_weights: BalancedWeights,
}

/// Weights for the `"balanced"` named selection strategy (§4.3); must sum
/// to 1.0. Unknown/invalid strategy names fall back to this with a logged
/// warning (see `selection.rs`).
#[derive(Debug, Derivative, Clone, Copy, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct BalancedWeights {
    #[derivative(Default(value = "0.4"))]
    pub device_affinity: f64,
    #[derivative(Default(value = "0.3"))]
    pub load: f64,
    #[derivative(Default(value = "0.3"))]
    pub latency: f64,
}

#[derive(Debug, Derivative, Clone, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct QuotaConfig {
    #[derivative(Default(value = "1_000"))]
    pub hourly_limit: u64,
    #[derivative(Default(value = "10_000"))]
    pub daily_limit: u64,
    #[derivative(Default(value = "100_000"))]
    pub monthly_limit: u64,
    #[derivative(Default(value = "20.0"))]
    pub rate_per_second: f64,
    #[derivative(Default(value = "1_000.0"))]
    pub token_bucket_capacity: f64,
    #[derivative(Default(value = "50.0"))]
    pub token_bucket_refill_per_second: f64,
    #[derivative(Default(value = "8"))]
    pub concurrency_cap: usize,
    /// Address of a backing distributed store (e.g. Redis-shaped KV).
    /// `None` ⇒ in-memory only from the start, no degrade-warning emitted.
    pub backing_store_addr: Option<String>,
}

#[derive(Debug, Derivative, Clone, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct ResilienceConfig {
    #[derivative(Default(value = "3"))]
    pub max_attempts: u32,
    #[derivative(Default(value = "200"))]
    pub backoff_base_ms: u64,
    #[derivative(Default(value = "5"))]
    pub failure_threshold: u32,
    #[derivative(Default(value = "30"))]
    pub reset_timeout_secs: u64,
    #[derivative(Default(value = "3"))]
    pub success_threshold: u32,
}

#[derive(Debug, Derivative, Clone, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct BulkheadConfig {
    #[derivative(Default(value = "100"))]
    pub capacity: usize,
    #[derivative(Default(value = "50"))]
    pub queue_depth: usize,
}

#[derive(Debug, Derivative, Clone, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct StartupConfig {
    pub min_plugins_required: usize,
    #[derivative(Default(value = "true"))]
    pub fail_on_plugin_error: bool,
    #[derivative(Default(value = "10_000"))]
    pub startup_timeout_ms: u64,
}

#[derive(Debug, Derivative, Clone, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct CoreConfig {
    pub pool: PoolConfig,
    pub router: RouterConfig,
    pub quota: QuotaConfig,
    pub resilience: ResilienceConfig,
    pub bulkhead: BulkheadConfig,
    pub startup: StartupConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.pool.max_size, 10);
        assert_eq!(cfg.pool.idle_ttl_secs, 900);
        assert_eq!(cfg.resilience.max_attempts, 3);
        assert_eq!(cfg.resilience.failure_threshold, 5);
        assert_eq!(cfg.resilience.reset_timeout_secs, 30);
        assert_eq!(cfg.resilience.success_threshold, 3);
        assert_eq!(cfg.bulkhead.capacity, 100);
        assert_eq!(cfg.bulkhead.queue_depth, 50);
    }

    #[test]
    fn balanced_weights_sum_to_one() {
        let w = BalancedWeights::default();
        assert!((w.device_affinity + w.load + w.latency - 1.0).abs() < 1e-9);
    }
}
