//! Nucleus (top-p) truncation (§4.7). `p = 1` disables truncation, per
//! §4.6's edge-case policy ("no nucleus truncation").

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| if l.is_finite() { (l - max_logit).exp() } else { 0.0 }).collect();
    let sum: f32 = exps.iter().sum::<f32>().max(f32::EPSILON);
    exps.iter().map(|&e| e / sum).collect()
}

pub fn apply(logits: &mut [f32], p: f32) {
    if p >= 1.0 {
        return;
    }

    let probs = softmax(logits);
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_unstable_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumulative = 0.0f32;
    let mut cutoff = order.len();
    for (rank, &i) in order.iter().enumerate() {
        cumulative += probs[i];
        if cumulative >= p {
            cutoff = rank + 1;
            break;
        }
    }

    for &i in &order[cutoff..] {
        logits[i] = f32::NEG_INFINITY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p_equal_one_disables_truncation() {
        let mut logits = vec![1.0, 2.0, 3.0];
        apply(&mut logits, 1.0);
        assert!(logits.iter().all(|l| l.is_finite()));
    }

    #[test]
    fn keeps_smallest_prefix_covering_p() {
        // heavily peaked distribution: one dominant candidate
        let mut logits = vec![10.0, 0.0, 0.0, 0.0];
        apply(&mut logits, 0.9);
        assert!(logits[0].is_finite());
        assert!(!logits[1].is_finite() || !logits[2].is_finite());
    }
}
