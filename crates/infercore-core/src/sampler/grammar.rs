//! Grammar-constrained sampling. Built on a minimal [`TokenVocabulary`]
//! trait so the sampler chain stays backend-agnostic instead of binding
//! to one tokenizer's concrete type.

use anyhow::Result;
use kbnf::{engine_like::AcceptTokenError, AcceptTokenResult, Engine, EngineLike, Token, Vocabulary};

/// The minimal tokenizer surface a grammar needs: the raw byte
/// representation of every token id in `0..vocab_size()`.
pub trait TokenVocabulary {
    fn vocab_size(&self) -> usize;
    fn token_bytes(&self, id: u32) -> &[u8];
}

/// An operator that masks/filters logits and tracks grammar state
/// across emitted tokens.
pub trait Formatter: Send + Sync {
    fn transform(&self, logits: &mut [f32]);
    /// Returns whether the just-accepted token should halt generation
    /// (only on a grammar violation — "finished" does not halt, since
    /// stop strings and EOS control when generation actually ends).
    fn update(&mut self, token: u32) -> bool;
}

pub struct GbnfSampler(Engine);

impl GbnfSampler {
    pub fn new(vocab: &dyn TokenVocabulary, schema: &str) -> Result<Self> {
        let tokens = (0..vocab.vocab_size() as u32)
            .filter(|&id| !vocab.token_bytes(id).is_empty())
            .map(|id| (id, Token(vocab.token_bytes(id).to_vec().into_boxed_slice())))
            .collect();
        let strings = (0..vocab.vocab_size() as u32)
            .filter(|&id| !vocab.token_bytes(id).is_empty())
            .map(|id| (id, String::from_utf8_lossy(vocab.token_bytes(id)).to_string()))
            .collect();
        let vocabulary = Vocabulary::new(tokens, strings)?;
        let mut engine = Engine::new(schema, vocabulary)?;
        engine.compute_allowed_token_ids();
        Ok(Self(engine))
    }
}

impl Formatter for GbnfSampler {
    fn transform(&self, logits: &mut [f32]) {
        let logits = &mut logits[..self.0.vocab().vocab_size()];
        self.0.mask_logits(logits).expect("grammar mask failed");
    }

    fn update(&mut self, token: u32) -> bool {
        let halt = match self.0.try_accept_new_token(token) {
            Ok(AcceptTokenResult::Finished) => false,
            Ok(AcceptTokenResult::Ongoing) => false,
            Err(AcceptTokenError::Finished) => false,
            Err(_) => true,
        };
        self.0.compute_allowed_token_ids();
        halt
    }
}

/// Built-in JSON grammar used when `json_mode` is set and no explicit
/// `grammar` is supplied (§4.7 "JSON mode is sugar for a built-in JSON
/// GBNF").
pub const JSON_GBNF: &str = r#"
root ::= object
value ::= object | array | string | number | ("true" | "false" | "null")
object ::= "{" ws (member ("," ws member)*)? ws "}"
member ::= string ws ":" ws value
array ::= "[" ws (value ("," ws value)*)? ws "]"
string ::= "\"" ([^"\\] | "\\" (["\\/bfnrt] | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F]))* "\""
number ::= "-"? ("0" | [1-9] [0-9]*) ("." [0-9]+)? (("e" | "E") ("+" | "-")? [0-9]+)?
ws ::= [ \t\n\r]*
"#;

#[cfg(test)]
mod tests {
    use super::*;

    struct ByteVocab(Vec<Vec<u8>>);

    impl TokenVocabulary for ByteVocab {
        fn vocab_size(&self) -> usize {
            self.0.len()
        }

        fn token_bytes(&self, id: u32) -> &[u8] {
            &self.0[id as usize]
        }
    }

    fn ascii_vocab() -> ByteVocab {
        ByteVocab((0u8..=127).map(|b| vec![b]).collect())
    }

    #[test]
    fn compiles_simple_grammar() {
        let vocab = ascii_vocab();
        let sampler = GbnfSampler::new(&vocab, r#"root ::= "a" "b""#);
        assert!(sampler.is_ok());
    }

    #[test]
    fn invalid_grammar_fails_to_compile() {
        let vocab = ascii_vocab();
        let sampler = GbnfSampler::new(&vocab, "root ::= this is not valid gbnf {{{");
        assert!(sampler.is_err());
    }
}
