//! Terminal samplers (§4.7): the chain's final step, choosing one token
//! id from the (possibly already-truncated) logits. Mirostat variants
//! carry their own running `mu` state across the generation loop, so
//! they are the one part of the chain that is genuinely stateful across
//! steps rather than per-call.

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .filter(|(_, &l)| l.is_finite())
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| if l.is_finite() { (l - max_logit).exp() } else { 0.0 }).collect();
    let sum: f32 = exps.iter().sum::<f32>().max(f32::EPSILON);
    exps.iter().map(|&e| e / sum).collect()
}

fn sample_categorical(probs: &[f32], rng: &mut fastrand::Rng) -> u32 {
    let r: f32 = rng.f32();
    let mut cumulative = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if r <= cumulative {
            return i as u32;
        }
    }
    probs.len().saturating_sub(1) as u32
}

fn seeded_rng(seed: i64) -> fastrand::Rng {
    // `seed < 0` means nondeterministic, per §4.6's edge-case policy.
    if seed < 0 {
        fastrand::Rng::new()
    } else {
        fastrand::Rng::with_seed(seed as u64)
    }
}

pub enum Terminal {
    Greedy,
    TempDist { temperature: f32, rng: fastrand::Rng },
    MirostatV1 { tau: f32, eta: f32, mu: f32, rng: fastrand::Rng },
    MirostatV2 { tau: f32, eta: f32, mu: f32, rng: fastrand::Rng },
}

impl Terminal {
    pub fn greedy() -> Self {
        Terminal::Greedy
    }

    pub fn temp_dist(temperature: f32, seed: i64) -> Self {
        Terminal::TempDist { temperature, rng: seeded_rng(seed) }
    }

    pub fn mirostat_v1(tau: f32, eta: f32, seed: i64) -> Self {
        Terminal::MirostatV1 { tau, eta, mu: 2.0 * tau, rng: seeded_rng(seed) }
    }

    pub fn mirostat_v2(tau: f32, eta: f32, seed: i64) -> Self {
        Terminal::MirostatV2 { tau, eta, mu: 2.0 * tau, rng: seeded_rng(seed) }
    }

    pub fn sample(&mut self, logits: &mut [f32]) -> u32 {
        match self {
            Terminal::Greedy => argmax(logits),
            Terminal::TempDist { temperature, rng } => {
                let t = if *temperature <= 0.0 { 1e-4 } else { *temperature };
                for logit in logits.iter_mut() {
                    if logit.is_finite() {
                        *logit /= t;
                    }
                }
                sample_categorical(&softmax(logits), rng)
            }
            Terminal::MirostatV1 { tau, eta, mu, rng } => Self::mirostat_v1_step(logits, *tau, *eta, mu, rng),
            Terminal::MirostatV2 { tau, eta, mu, rng } => Self::mirostat_v2_step(logits, *tau, *eta, mu, rng),
        }
    }

    /// Keeps only candidates whose surprise `-log2(p)` is at most `mu`,
    /// samples among them, then nudges `mu` toward the target `tau`.
    fn mirostat_v2_step(logits: &[f32], tau: f32, eta: f32, mu: &mut f32, rng: &mut fastrand::Rng) -> u32 {
        let probs = softmax(logits);
        let mut candidates: Vec<usize> = (0..probs.len()).filter(|&i| probs[i] > 0.0 && -probs[i].log2() <= *mu).collect();
        if candidates.is_empty() {
            candidates.push(argmax(logits) as usize);
        }

        let sub_sum: f32 = candidates.iter().map(|&i| probs[i]).sum::<f32>().max(f32::EPSILON);
        let r = rng.f32() * sub_sum;
        let mut cumulative = 0.0f32;
        let mut chosen = candidates[0];
        for &i in &candidates {
            cumulative += probs[i];
            if r <= cumulative {
                chosen = i;
                break;
            }
        }

        let observed_surprise = -probs[chosen].max(f32::EPSILON).log2();
        *mu -= eta * (observed_surprise - tau);
        chosen as u32
    }

    /// Estimates the Zipf exponent `s_hat` from the top ~100 candidates,
    /// derives `k` from it and the current `mu`, truncates to the top
    /// `k`, samples, then updates `mu`. Adapted from llama.cpp's
    /// mirostat v1 reference algorithm.
    fn mirostat_v1_step(logits: &[f32], tau: f32, eta: f32, mu: &mut f32, rng: &mut fastrand::Rng) -> u32 {
        let probs = softmax(logits);
        let mut order: Vec<usize> = (0..probs.len()).collect();
        order.sort_unstable_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(std::cmp::Ordering::Equal));

        let sample_window = 100usize.min(order.len().saturating_sub(1)).max(1);
        let mut s_hat = 0.0f32;
        let mut samples = 0u32;
        for i in 0..sample_window {
            let p_i = probs[order[i]].max(1e-9);
            let p_next = probs[order[i + 1]].max(1e-9);
            let t_i = ((i as f32 + 2.0) / (i as f32 + 1.0)).ln();
            if t_i.abs() > f32::EPSILON {
                s_hat += (p_i / p_next).ln() / t_i;
                samples += 1;
            }
        }
        let s_hat = if samples > 0 { s_hat / samples as f32 } else { 1.0 };
        let epsilon_hat = (s_hat - 1.0).max(1e-4);
        let vocab_size = probs.len() as f32;
        let k = ((epsilon_hat * 2f32.powf(*mu)) / (1.0 - vocab_size.powf(-epsilon_hat))).powf(1.0 / s_hat);
        let k = (k.round().max(1.0) as usize).min(order.len());

        let top_k = &order[..k];
        let sub_sum: f32 = top_k.iter().map(|&i| probs[i]).sum::<f32>().max(f32::EPSILON);
        let r = rng.f32() * sub_sum;
        let mut cumulative = 0.0f32;
        let mut chosen = top_k[0];
        for &i in top_k {
            cumulative += probs[i];
            if r <= cumulative {
                chosen = i;
                break;
            }
        }

        let observed_surprise = -probs[chosen].max(f32::EPSILON).log2();
        *mu -= eta * (observed_surprise - tau);
        chosen as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greedy_always_picks_the_max_logit() {
        let mut logits = vec![1.0, 5.0, 2.0];
        let mut terminal = Terminal::greedy();
        assert_eq!(terminal.sample(&mut logits), 1);
    }

    #[test]
    fn temp_dist_with_fixed_seed_is_deterministic() {
        let logits = vec![1.0, 2.0, 3.0, 0.5];
        let mut t1 = Terminal::temp_dist(0.8, 7);
        let mut t2 = Terminal::temp_dist(0.8, 7);
        let mut l1 = logits.clone();
        let mut l2 = logits.clone();
        assert_eq!(t1.sample(&mut l1), t2.sample(&mut l2));
    }

    #[test]
    fn mirostat_v2_updates_mu_after_each_step() {
        let mut terminal = Terminal::mirostat_v2(5.0, 0.1, 1);
        let initial_mu = match &terminal {
            Terminal::MirostatV2 { mu, .. } => *mu,
            _ => unreachable!(),
        };
        let mut logits = vec![3.0, 1.0, 0.5, 0.1];
        terminal.sample(&mut logits);
        let updated_mu = match &terminal {
            Terminal::MirostatV2 { mu, .. } => *mu,
            _ => unreachable!(),
        };
        assert_ne!(initial_mu, updated_mu);
    }
}
