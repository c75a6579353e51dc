//! Top-k truncation (§4.7). `k = 0` disables truncation entirely, per
//! §4.6's edge-case policy.

pub fn apply(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }

    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_unstable_by(|&a, &b| logits[b].partial_cmp(&logits[a]).unwrap_or(std::cmp::Ordering::Equal));

    for &i in &order[k..] {
        logits[i] = f32::NEG_INFINITY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_disables_truncation() {
        let mut logits = vec![1.0, 2.0, 3.0];
        apply(&mut logits, 0);
        assert!(logits.iter().all(|l| l.is_finite()));
    }

    #[test]
    fn keeps_only_top_k_candidates() {
        let mut logits = vec![1.0, 5.0, 3.0, 2.0];
        apply(&mut logits, 2);
        let finite: Vec<f32> = logits.iter().copied().filter(|l| l.is_finite()).collect();
        assert_eq!(finite.len(), 2);
        assert!(logits[1].is_finite());
        assert!(logits[2].is_finite());
        assert!(!logits[0].is_finite());
        assert!(!logits[3].is_finite());
    }
}
