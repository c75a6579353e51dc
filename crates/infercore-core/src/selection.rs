//! Selection Policy (C3).
//!
//! Filters and scores candidate runners for a request given hardware
//! capabilities, a model manifest, and live health/load signals from the
//! metrics store (C2). Device enumeration is a plain `Vec` handed to the
//! caller rather than a trait object, and the format-compatibility
//! filter dispatches on a runner's declared supported formats.

use crate::{
    config::BalancedWeights, hardware::HardwareCapabilities, metrics::MetricsStore, ModelManifest,
    RequestContext, RunnerMetadata,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Latency,
    Cost,
    Memory,
    Balanced,
}

impl Strategy {
    /// Unknown strategy names fall back to `Balanced` with a logged
    /// warning, per §4.3.
    pub fn parse(name: &str) -> Self {
        match name {
            "latency" => Strategy::Latency,
            "cost" => Strategy::Cost,
            "memory" => Strategy::Memory,
            "balanced" => Strategy::Balanced,
            other => {
                tracing::warn!(event = "unknown_selection_strategy", strategy = %other, "falling back to balanced");
                Strategy::Balanced
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub runner_name: String,
    pub score: i64,
}

/// Filters (applied in order; failure eliminates the candidate) then
/// scores and ranks the survivors (best first, ties broken
/// lexicographically on runner name).
pub struct SelectionPolicy<'a> {
    pub strategy: Strategy,
    pub weights: BalancedWeights,
    pub hardware: &'a HardwareCapabilities,
    pub metrics: &'a MetricsStore,
}

impl<'a> SelectionPolicy<'a> {
    pub fn new(strategy: Strategy, weights: BalancedWeights, hardware: &'a HardwareCapabilities, metrics: &'a MetricsStore) -> Self {
        Self { strategy, weights, hardware, metrics }
    }

    fn passes_filters(&self, runner: &RunnerMetadata, manifest: &ModelManifest, request: &RequestContext) -> bool {
        // Filter 1: format compatibility.
        let format_ok = runner.supported_formats.iter().any(|f| manifest.artifacts.contains_key(f));
        if !format_ok {
            return false;
        }

        // Filter 2: device availability.
        if let Some(preferred) = &request.preferred_device {
            if !runner.supported_devices.contains(preferred) {
                return false;
            }
            if !self.hardware.has_device(preferred) {
                return false;
            }
        }

        // Filter 3 (optional): resource availability.
        if manifest.resource_requirements.min_memory_mb > 0 {
            let required_bytes = manifest.resource_requirements.min_memory_mb * 1024 * 1024;
            if self.hardware.avail_mem_bytes > 0 && self.hardware.avail_mem_bytes < required_bytes {
                return false;
            }
        }

        true
    }

    fn score(&self, runner: &RunnerMetadata, manifest: &ModelManifest, request: &RequestContext) -> i64 {
        match self.strategy {
            Strategy::Latency => self.score_named_latency(runner),
            Strategy::Cost => self.score_named_cost(runner),
            Strategy::Memory => self.score_named_memory(runner),
            Strategy::Balanced => self.score_balanced(runner, manifest, request),
        }
    }

    fn device_rank(runner: &RunnerMetadata, order: &[crate::DeviceKind]) -> i64 {
        for (i, kind) in order.iter().enumerate() {
            if runner.supported_devices.contains(kind) {
                return (order.len() - i) as i64;
            }
        }
        0
    }

    fn score_named_latency(&self, runner: &RunnerMetadata) -> i64 {
        use crate::DeviceKind::*;
        Self::device_rank(runner, &[Cuda, Tpu, Npu, Cpu]) * 100
    }

    fn score_named_cost(&self, runner: &RunnerMetadata) -> i64 {
        use crate::DeviceKind::*;
        Self::device_rank(runner, &[Cpu, Npu, Tpu, Cuda]) * 100
    }

    fn score_named_memory(&self, runner: &RunnerMetadata) -> i64 {
        let mut s = 0i64;
        if runner.capabilities.quantization {
            s += 50;
        }
        if runner.supported_devices.contains(&crate::DeviceKind::Cpu) {
            s += 30;
        }
        s
    }

    /// Additive scoring table from §4.3, weighted by `self.weights` for
    /// the device/load/latency contribution groups.
    fn score_balanced(&self, runner: &RunnerMetadata, manifest: &ModelManifest, request: &RequestContext) -> i64 {
        let snap = self.metrics.snapshot(&runner.name);
        let mut score = 0.0f64;

        if let Some(preferred) = &request.preferred_device {
            if runner.supported_devices.contains(preferred) {
                score += 50.0 * self.weights.device_affinity * 2.0;
            }
        }

        if let Some(first_fmt) = manifest.supported_formats.first() {
            if runner.supported_formats.contains(first_fmt) {
                score += 30.0;
            }
        }

        let p95 = std::time::Duration::from_millis(snap.p95_ms);
        if p95 < request.timeout {
            score += 25.0 * self.weights.latency * 2.0;
        }

        if manifest.resource_requirements.min_memory_mb > 0 {
            let required_bytes = manifest.resource_requirements.min_memory_mb * 1024 * 1024;
            if self.hardware.avail_mem_bytes == 0 || self.hardware.avail_mem_bytes >= required_bytes {
                score += 20.0;
            }
        } else {
            score += 20.0;
        }

        if snap.healthy {
            score += 15.0;
        }

        if request.cost_sensitive && runner.supported_devices.contains(&crate::DeviceKind::Cpu) {
            score += 10.0;
        }

        let load = snap.load;
        if load > 0.95 {
            score -= 50.0 * self.weights.load * 2.0;
        } else if load > 0.80 {
            score -= 20.0 * self.weights.load * 2.0;
        } else if load < 0.70 {
            score += 15.0 * self.weights.load * 2.0;
        }

        score.round() as i64
    }

    /// Filters then ranks the candidate runners. Returns the best-first
    /// ranked list; empty if no candidate passes the filters.
    pub fn select(&self, candidates: &[RunnerMetadata], manifest: &ModelManifest, request: &RequestContext) -> Vec<RankedCandidate> {
        let mut ranked: Vec<RankedCandidate> = candidates
            .iter()
            .filter(|r| self.passes_filters(r, manifest, request))
            .map(|r| RankedCandidate { runner_name: r.name.clone(), score: self.score(r, manifest, request) })
            .collect();

        ranked.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.runner_name.cmp(&b.runner_name)));
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ArtifactDescriptor, ArtifactFormat, DeviceKind, ResourceRequirements, RunnerCapabilities};
    use std::collections::HashMap;

    fn cpu_runner(name: &str) -> RunnerMetadata {
        RunnerMetadata {
            name: name.into(),
            framework: "gguf".into(),
            supported_formats: vec![ArtifactFormat::Gguf],
            supported_devices: vec![DeviceKind::Cpu],
            capabilities: RunnerCapabilities { streaming: true, batching: false, quantization: true, max_batch_size: 128, supported_delegates: vec![], max_context_tokens: 4096 },
        }
    }

    fn manifest() -> ModelManifest {
        let mut artifacts = HashMap::new();
        artifacts.insert(ArtifactFormat::Gguf, ArtifactDescriptor { uri: "file://m.gguf".into(), checksum: "abc".into(), size_bytes: 1 });
        ModelManifest {
            model_id: "m1".into(),
            tenant_id: "t1".into(),
            version: "1".into(),
            artifacts,
            resource_requirements: ResourceRequirements { min_memory_mb: 0 },
            supported_formats: vec![ArtifactFormat::Gguf],
        }
    }

    #[test]
    fn format_mismatch_is_filtered_out() {
        let hw = HardwareCapabilities { total_mem_bytes: 0, avail_mem_bytes: 0, devices: vec![], cuda_available: false };
        let metrics = MetricsStore::new();
        let mut runner = cpu_runner("onnx-runner");
        runner.supported_formats = vec![ArtifactFormat::Onnx];
        let policy = SelectionPolicy::new(Strategy::Balanced, BalancedWeights::default(), &hw, &metrics);
        let ranked = policy.select(&[runner], &manifest(), &RequestContext::new("t1"));
        assert!(ranked.is_empty());
    }

    #[test]
    fn tie_break_is_lexicographic_on_name() {
        let hw = HardwareCapabilities { total_mem_bytes: 0, avail_mem_bytes: 0, devices: vec![cpu_device_info()], cuda_available: false };
        let metrics = MetricsStore::new();
        let policy = SelectionPolicy::new(Strategy::Balanced, BalancedWeights::default(), &hw, &metrics);
        let ranked = policy.select(&[cpu_runner("zebra"), cpu_runner("alpha")], &manifest(), &RequestContext::new("t1"));
        assert_eq!(ranked[0].runner_name, "alpha");
    }

    #[test]
    fn unknown_strategy_falls_back_to_balanced() {
        assert_eq!(Strategy::parse("nonsense"), Strategy::Balanced);
        assert_eq!(Strategy::parse("latency"), Strategy::Latency);
    }

    fn cpu_device_info() -> crate::hardware::DeviceInfo {
        crate::hardware::DeviceInfo { kind: DeviceKind::Cpu, id: "cpu0".into(), mem_bytes: 0 }
    }
}
