//! Repetition/frequency/presence penalties (§4.7 "Penalties").
//!
//! Shaped as an operator over a mutable logits slice, matching the
//! other sampler stages; this one has no grammar state to carry, so it
//! is a free function rather than a struct.

use rustc_hash::FxHashMap;

/// For each token in `recent`, divides its logit by `repeat_penalty` if
/// positive (multiplies if negative), then subtracts `presence_penalty`
/// once and `frequency_penalty * count` per §4.7. A no-op when `recent`
/// is empty (`repeat_last_n <= 0`, per §4.6's edge-case policy).
pub fn apply(logits: &mut [f32], recent: &[u32], repeat_penalty: f32, frequency_penalty: f32, presence_penalty: f32) {
    if recent.is_empty() {
        return;
    }

    let mut counts: FxHashMap<u32, u32> = FxHashMap::default();
    for &token in recent {
        *counts.entry(token).or_insert(0) += 1;
    }

    for (token, count) in counts {
        let Some(logit) = logits.get_mut(token as usize) else { continue };
        if repeat_penalty != 1.0 {
            *logit = if *logit > 0.0 { *logit / repeat_penalty } else { *logit * repeat_penalty };
        }
        *logit -= presence_penalty;
        *logit -= frequency_penalty * count as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_recent_is_a_no_op() {
        let mut logits = vec![1.0, 2.0, 3.0];
        apply(&mut logits, &[], 1.2, 0.0, 0.0);
        assert_eq!(logits, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn positive_logit_is_divided_by_repeat_penalty() {
        let mut logits = vec![2.0, 0.0, -2.0];
        apply(&mut logits, &[0, 2], 2.0, 0.0, 0.0);
        assert_eq!(logits[0], 1.0);
        assert_eq!(logits[2], -4.0);
    }

    #[test]
    fn frequency_penalty_scales_with_count() {
        let mut logits = vec![10.0];
        apply(&mut logits, &[0, 0, 0], 1.0, 1.0, 0.0);
        assert_eq!(logits[0], 7.0);
    }
}
