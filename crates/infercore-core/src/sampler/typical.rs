//! Locally typical sampling (§4.7): keep candidates whose entropy
//! deviation `|(-ln p_i) - H|` is smallest, up to the prefix covering
//! `typical_p` cumulative probability. `typical_p >= 1` disables it.

pub fn apply(logits: &mut [f32], typical_p: f32) {
    if typical_p >= 1.0 {
        return;
    }

    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if !max_logit.is_finite() {
        return;
    }

    let exps: Vec<f32> = logits.iter().map(|&l| if l.is_finite() { (l - max_logit).exp() } else { 0.0 }).collect();
    let sum: f32 = exps.iter().sum::<f32>().max(f32::EPSILON);
    let probs: Vec<f32> = exps.iter().map(|&e| e / sum).collect();

    let neg_log_probs: Vec<f32> = probs.iter().map(|&p| if p > 0.0 { -p.ln() } else { f32::INFINITY }).collect();
    let entropy: f32 = probs.iter().zip(&neg_log_probs).map(|(&p, &nl)| if nl.is_finite() { p * nl } else { 0.0 }).sum();

    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_unstable_by(|&a, &b| {
        let da = (neg_log_probs[a] - entropy).abs();
        let db = (neg_log_probs[b] - entropy).abs();
        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut cumulative = 0.0f32;
    let mut cutoff = order.len();
    for (rank, &i) in order.iter().enumerate() {
        cumulative += probs[i];
        if cumulative >= typical_p {
            cutoff = rank + 1;
            break;
        }
    }

    let keep: std::collections::HashSet<usize> = order[..cutoff].iter().copied().collect();
    for (i, logit) in logits.iter_mut().enumerate() {
        if !keep.contains(&i) {
            *logit = f32::NEG_INFINITY;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_disables_filtering() {
        let mut logits = vec![1.0, 2.0, 3.0];
        apply(&mut logits, 1.0);
        assert!(logits.iter().all(|l| l.is_finite()));
    }

    #[test]
    fn uniform_distribution_keeps_prefix_covering_typical_p() {
        let mut logits = vec![0.0, 0.0, 0.0, 0.0];
        apply(&mut logits, 0.5);
        // every candidate has identical deviation (0) from a uniform
        // distribution's entropy, so ties are broken by sort stability;
        // exactly the smallest prefix covering 0.5 cumulative probability
        // survives (2 of 4, each with probability 0.25).
        let kept = logits.iter().filter(|l| l.is_finite()).count();
        assert_eq!(kept, 2);
    }
}
