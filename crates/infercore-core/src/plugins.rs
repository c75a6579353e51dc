//! Plugin & Phase Registry (C9).
//!
//! Named, versioned, ordered observers/mutators invoked at fixed phase
//! boundaries. Ordering within a phase is by ascending `order`, stable on
//! equal orders: a `Vec` is sorted once at registration and iterated in
//! place rather than kept in a priority queue.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{error::CoreError, CoreResult, ExecutionToken, Phase};

/// A registered extension point. Default method bodies are no-ops, so an
/// implementation only overrides the phases it cares about.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;

    /// Ascending sort key within a phase; ties keep registration order.
    fn order(&self) -> i32 {
        0
    }

    /// Runs once at registration. A plugin that needs to validate
    /// configuration or warm up its own state does so here; whether a
    /// failure here is fatal is controlled by the registry's
    /// [`InitMode`], not by the plugin itself.
    async fn init(&self) -> CoreResult<()> {
        Ok(())
    }

    /// Observes or mutates the in-flight execution token at a phase
    /// boundary. Returns the (possibly modified) token; a plugin that
    /// only observes returns it unchanged.
    async fn on_phase(&self, phase: Phase, token: ExecutionToken) -> CoreResult<ExecutionToken> {
        let _ = phase;
        Ok(token)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    /// A plugin whose `init` fails aborts the whole registration.
    Strict,
    /// A plugin whose `init` fails is logged and left unregistered; the
    /// rest of the registry is unaffected.
    Graceful,
}

struct Entry {
    plugin: Arc<dyn Plugin>,
    registration_index: usize,
}

/// Populated at startup; registration after that point is allowed but
/// must be externally synchronized (§4.9) — the `RwLock` enforces that
/// at the type level rather than leaving it to caller discipline.
#[derive(Default)]
pub struct PluginRegistry {
    entries: RwLock<Vec<Entry>>,
    next_index: std::sync::atomic::AtomicUsize,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self { entries: RwLock::new(Vec::new()), next_index: std::sync::atomic::AtomicUsize::new(0) }
    }

    /// Registers `plugin`, running its `init` hook first. Returns an
    /// error only in [`InitMode::Strict`]; in [`InitMode::Graceful`] an
    /// init failure is logged and the plugin is simply not added.
    pub async fn register(&self, plugin: Arc<dyn Plugin>, mode: InitMode) -> CoreResult<()> {
        if let Err(err) = plugin.init().await {
            match mode {
                InitMode::Strict => return Err(err),
                InitMode::Graceful => {
                    tracing::warn!(event = "plugin_init_failed", plugin = %plugin.name(), version = %plugin.version(), error = %err, "plugin init failed, skipping registration (graceful mode)");
                    return Ok(());
                }
            }
        }

        let index = self.next_index.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut entries = self.entries.write();
        entries.push(Entry { plugin, registration_index: index });
        entries.sort_by(|a, b| a.plugin.order().cmp(&b.plugin.order()).then_with(|| a.registration_index.cmp(&b.registration_index)));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Verifies the §4.9/AMBIENT-CFG startup contract: at least
    /// `min_required` plugins registered, or `INTERNAL` (the caller
    /// surfaces this as a startup failure, independent of `fail_on_plugin_error`
    /// which only governs individual `init` failures).
    pub fn verify_minimum(&self, min_required: usize) -> CoreResult<()> {
        if self.len() < min_required {
            return Err(CoreError::Internal(format!("only {} plugin(s) registered, {min_required} required at startup", self.len())));
        }
        Ok(())
    }

    /// Runs every registered plugin's `on_phase` hook for `phase`, in
    /// order, threading the token through each in turn. The first
    /// plugin error aborts the remaining chain for this call.
    pub async fn invoke(&self, phase: Phase, mut token: ExecutionToken) -> CoreResult<ExecutionToken> {
        let plugins: Vec<Arc<dyn Plugin>> = self.entries.read().iter().map(|e| e.plugin.clone()).collect();
        for plugin in plugins {
            token = plugin.on_phase(phase, token).await?;
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExecutionStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        name: &'static str,
        order: i32,
        calls: Arc<AtomicUsize>,
        order_log: Arc<RwLock<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Plugin for Counter {
        fn name(&self) -> &str {
            self.name
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn order(&self) -> i32 {
            self.order
        }
        async fn on_phase(&self, _phase: Phase, token: ExecutionToken) -> CoreResult<ExecutionToken> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order_log.write().push(self.name);
            Ok(token)
        }
    }

    struct FailingInit;
    #[async_trait]
    impl Plugin for FailingInit {
        fn name(&self) -> &str {
            "failing"
        }
        fn version(&self) -> &str {
            "0.1.0"
        }
        async fn init(&self) -> CoreResult<()> {
            Err(CoreError::Internal("boom".into()))
        }
    }

    #[tokio::test]
    async fn plugins_run_in_ascending_order_with_stable_ties() {
        let registry = PluginRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let order_log = Arc::new(RwLock::new(Vec::new()));
        registry.register(Arc::new(Counter { name: "b", order: 5, calls: calls.clone(), order_log: order_log.clone() }), InitMode::Strict).await.unwrap();
        registry.register(Arc::new(Counter { name: "a", order: 1, calls: calls.clone(), order_log: order_log.clone() }), InitMode::Strict).await.unwrap();
        registry.register(Arc::new(Counter { name: "c", order: 5, calls: calls.clone(), order_log: order_log.clone() }), InitMode::Strict).await.unwrap();

        let token = ExecutionToken::new("exec-1");
        registry.invoke(Phase::Prepare, token).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*order_log.read(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn graceful_mode_skips_failed_init_without_erroring() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(FailingInit), InitMode::Graceful).await.unwrap();
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn strict_mode_propagates_failed_init() {
        let registry = PluginRegistry::new();
        let err = registry.register(Arc::new(FailingInit), InitMode::Strict).await.unwrap_err();
        assert_eq!(err.kind(), "INTERNAL");
    }

    #[tokio::test]
    async fn verify_minimum_fails_below_threshold() {
        let registry = PluginRegistry::new();
        assert!(registry.verify_minimum(1).is_err());
        let calls = Arc::new(AtomicUsize::new(0));
        let order_log = Arc::new(RwLock::new(Vec::new()));
        registry.register(Arc::new(Counter { name: "a", order: 0, calls, order_log }), InitMode::Strict).await.unwrap();
        assert!(registry.verify_minimum(1).is_ok());
    }

    #[test]
    fn execution_token_carries_through_invoke() {
        let token = ExecutionToken::new("exec-2").transition(Phase::Route, ExecutionStatus::Processing);
        assert_eq!(token.phase, Phase::Route);
    }
}
