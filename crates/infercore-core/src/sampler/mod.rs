//! Sampler Chain (C7).
//!
//! Composes the operators in §4.7's fixed order:
//!
//! `[penalties?] -> [top_k?] -> [top_p?] -> [min_p?] -> [typical?] ->
//! [grammar?] -> [terminal: temp+dist | greedy | mirostat_v1 |
//! mirostat_v2]`
//!
//! `SamplerChain` owns the one genuinely cross-step piece of state: the
//! recent-tokens ring used by the penalty operators, seeded from the
//! last `repeat_last_n` prompt tokens per §4.6 phase 4. Individual
//! operators are free functions (`topk`, `topp`, `minp`, `typical`,
//! `penalties`) or, for the stateful pieces, small structs
//! (`terminal::Terminal`, `grammar::GbnfSampler`).

pub mod grammar;
pub mod minp;
pub mod penalties;
pub mod terminal;
pub mod topk;
pub mod topp;
pub mod typical;

use std::collections::VecDeque;

use grammar::Formatter;
use terminal::Terminal;

use crate::{error::CoreError, CoreResult, Parameters};

/// Builds the grammar stage from `parameters.grammar`, or the built-in
/// JSON GBNF when `json_mode` is set and no explicit grammar was given.
/// Compilation failure maps to `INVALID_GRAMMAR` per §7.
pub fn build_grammar(vocab: &dyn grammar::TokenVocabulary, parameters: &Parameters) -> CoreResult<Option<Box<dyn Formatter>>> {
    let schema: Option<&str> = match (&parameters.grammar, parameters.json_mode) {
        (Some(g), _) => Some(g.as_str()),
        (None, true) => Some(grammar::JSON_GBNF),
        (None, false) => None,
    };
    match schema {
        None => Ok(None),
        Some(schema) => grammar::GbnfSampler::new(vocab, schema)
            .map(|s| Some(Box::new(s) as Box<dyn Formatter>))
            .map_err(|err| CoreError::InvalidGrammar(err.to_string())),
    }
}

/// The composed per-request sampler state. One instance lives for the
/// duration of one generation loop (§4.6 phase 4); it is not pooled or
/// reused across requests.
pub struct SamplerChain {
    repeat_last_n: i64,
    repeat_penalty: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
    top_k: usize,
    top_p: f32,
    min_p: f32,
    typical_p: f32,
    grammar: Option<Box<dyn Formatter>>,
    terminal: Terminal,
    recent: VecDeque<u32>,
}

impl SamplerChain {
    /// `prompt_tail` is the full prompt token sequence; only its last
    /// `repeat_last_n` tokens seed the penalty ring (§4.6 phase 4).
    /// `repeat_last_n <= 0` disables penalties regardless of the other
    /// knobs (§4.6 edge-case policy) and leaves the ring empty.
    pub fn new(parameters: &Parameters, grammar: Option<Box<dyn Formatter>>, prompt_tail: &[u32]) -> Self {
        let mut recent = VecDeque::new();
        if parameters.repeat_last_n > 0 {
            let n = parameters.repeat_last_n as usize;
            let start = prompt_tail.len().saturating_sub(n);
            recent.extend(prompt_tail[start..].iter().copied());
        }

        let terminal = match parameters.mirostat {
            1 => Terminal::mirostat_v1(parameters.mirostat_tau, parameters.mirostat_eta, parameters.seed),
            2 => Terminal::mirostat_v2(parameters.mirostat_tau, parameters.mirostat_eta, parameters.seed),
            _ if parameters.temperature <= 0.0 => Terminal::greedy(),
            _ => Terminal::temp_dist(parameters.temperature, parameters.seed),
        };

        Self {
            repeat_last_n: parameters.repeat_last_n,
            repeat_penalty: parameters.repeat_penalty,
            frequency_penalty: parameters.frequency_penalty,
            presence_penalty: parameters.presence_penalty,
            top_k: parameters.top_k,
            top_p: parameters.top_p,
            min_p: parameters.min_p,
            typical_p: parameters.typical_p,
            grammar,
            terminal,
            recent,
        }
    }

    /// Whether the terminal stage already performs its own truncation
    /// over the full distribution (greedy argmax, or either Mirostat
    /// variant). §4.6: "temperature <= 0 -> pure greedy; sampler chain
    /// short-circuits" — the same short-circuit applies to Mirostat,
    /// which manages its own candidate window.
    fn terminal_owns_truncation(&self) -> bool {
        matches!(self.terminal, Terminal::Greedy | Terminal::MirostatV1 { .. } | Terminal::MirostatV2 { .. })
    }

    /// Runs the fixed-order chain over `logits` (one vocabulary-sized
    /// slice) and returns the sampled token id. Pushes the token into
    /// the recent-tokens ring and feeds it to the grammar stage's
    /// acceptor before returning.
    pub fn sample(&mut self, logits: &mut [f32]) -> u32 {
        if self.repeat_last_n > 0 && !self.recent.is_empty() {
            let recent: Vec<u32> = self.recent.iter().copied().collect();
            penalties::apply(logits, &recent, self.repeat_penalty, self.frequency_penalty, self.presence_penalty);
        }

        if !self.terminal_owns_truncation() {
            topk::apply(logits, self.top_k);
            topp::apply(logits, self.top_p);
            minp::apply(logits, self.min_p);
            typical::apply(logits, self.typical_p);
        }

        if let Some(grammar) = &self.grammar {
            grammar.transform(logits);
        }

        let token = self.terminal.sample(logits);

        if self.repeat_last_n > 0 {
            let cap = self.repeat_last_n as usize;
            self.recent.push_back(token);
            while self.recent.len() > cap {
                self.recent.pop_front();
            }
        }

        if let Some(grammar) = &mut self.grammar {
            grammar.update(token);
        }

        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(temperature: f32, top_k: usize) -> Parameters {
        Parameters { temperature, top_k, seed: 7, ..Default::default() }
    }

    #[test]
    fn greedy_short_circuits_truncation_stages() {
        let mut chain = SamplerChain::new(&params(0.0, 1_000_000), None, &[]);
        let mut logits = vec![1.0, 9.0, 2.0, 3.0];
        assert_eq!(chain.sample(&mut logits), 1);
    }

    #[test]
    fn top_k_one_matches_greedy_regardless_of_temperature() {
        let mut greedy = SamplerChain::new(&params(0.0, 40), None, &[]);
        let mut sampled = SamplerChain::new(&params(1.5, 1), None, &[]);
        let mut l1 = vec![1.0, 9.0, 2.0, 3.0];
        let mut l2 = l1.clone();
        assert_eq!(greedy.sample(&mut l1), sampled.sample(&mut l2));
    }

    #[test]
    fn zero_repeat_last_n_disables_penalties_even_with_repeat_penalty_set() {
        let parameters = Parameters { repeat_last_n: 0, repeat_penalty: 100.0, temperature: 0.0, ..Default::default() };
        let mut chain = SamplerChain::new(&parameters, None, &[1, 1, 1, 1]);
        let mut logits = vec![5.0, 5.0, 5.0];
        // token 0 would be crushed by the penalty if `recent` were seeded
        // from the prompt tail; with repeat_last_n <= 0 it never is.
        assert_eq!(chain.sample(&mut logits), 0);
    }
}
