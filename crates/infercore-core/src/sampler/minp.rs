//! Min-p truncation (§4.7): drop candidates whose probability is below
//! `min_p * max_prob`. Equivalent, worked in log-space, to dropping
//! logits below `max_logit + ln(min_p)` — softmax's normalizing constant
//! cancels, so the full distribution never needs computing.

pub fn apply(logits: &mut [f32], min_p: f32) {
    if min_p <= 0.0 {
        return;
    }

    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if !max_logit.is_finite() {
        return;
    }

    let threshold = max_logit + min_p.ln();
    let mut kept = 0usize;
    for logit in logits.iter_mut() {
        if *logit < threshold {
            *logit = f32::NEG_INFINITY;
        } else {
            kept += 1;
        }
    }

    // The max logit itself always clears `threshold`, so this is
    // unreachable in practice; kept only to honor §4.6's stated
    // guarantee ("if filter would empty the set, keep the single top
    // token") even if `threshold`'s derivation above is ever changed.
    if kept == 0 {
        if let Some((top, _)) = logits.iter().enumerate().max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal)) {
            for (i, logit) in logits.iter_mut().enumerate() {
                if i != top {
                    *logit = f32::NEG_INFINITY;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_disables_filtering() {
        let mut logits = vec![1.0, 2.0, -100.0];
        apply(&mut logits, 0.0);
        assert!(logits.iter().all(|l| l.is_finite()));
    }

    #[test]
    fn drops_candidates_far_below_max() {
        let mut logits = vec![0.0, -50.0];
        apply(&mut logits, 0.05);
        assert!(logits[0].is_finite());
        assert!(!logits[1].is_finite());
    }
}
