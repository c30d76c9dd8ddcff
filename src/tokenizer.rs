//! BPE tokenizer profiles.
//!
//! The matching core only needs three things from a vocabulary: turning text
//! into token ids, turning a byte-string literal into the one id that
//! represents it, and the reserved end-of-text id.  [`Tokenizer`] is that
//! boundary; [`Tiktoken`] implements it over the `tiktoken-rs` encodings.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, Mutex, OnceLock, PoisonError};

use tiktoken_rs::CoreBPE;

use crate::{Error, TokenId};

/// Names accepted by [`load`].
pub const PROFILES: &[&str] = &[
    "cl100k_base",
    "o200k_base",
    "p50k_base",
    "p50k_edit",
    "r50k_base",
    "gpt2",
];

/// Special token whose id terminates every encoded document.
const END_OF_TEXT: &str = "<|endoftext|>";

/// A vocabulary that can feed a [`Pattern`](crate::Pattern).
pub trait Tokenizer: fmt::Debug + Send + Sync {
    /// Profile name, used in error messages.
    fn name(&self) -> &str;

    /// Encode `text` into token ids.  Special tokens appearing in `text` are
    /// encoded as ordinary text.
    fn encode(&self, text: &str) -> Vec<TokenId>;

    /// Resolve a byte-string literal to the single token representing it.
    ///
    /// Fails with [`Error::TokenNotFound`] if the literal is not exactly one
    /// token of this vocabulary.
    fn resolve_literal(&self, literal: &[u8]) -> Result<TokenId, Error>;

    /// The reserved end-of-text id.
    fn end_of_text(&self) -> TokenId;
}

/// A `tiktoken` encoding.
pub struct Tiktoken {
    name: &'static str,
    bpe: CoreBPE,
    end_of_text: TokenId,
    /// Number of ids, counted from zero, that all decode to a byte string.
    vocabulary: TokenId,
    /// Byte string of every id below `vocabulary`, built on first use.
    pieces: OnceLock<HashMap<Vec<u8>, TokenId>>,
}

impl Tiktoken {
    fn new(name: &'static str, vocabulary: TokenId, bpe: CoreBPE) -> Result<Self, Error> {
        let end_of_text = match bpe.encode_with_special_tokens(END_OF_TEXT).as_slice() {
            [rank] => *rank as TokenId,
            other => {
                return Err(Error::TokenizerLoad {
                    name: name.to_owned(),
                    reason: format!("`{END_OF_TEXT}` encodes to {} tokens", other.len()),
                });
            }
        };
        Ok(Self {
            name,
            bpe,
            end_of_text,
            vocabulary,
            pieces: OnceLock::new(),
        })
    }

    fn pieces(&self) -> &HashMap<Vec<u8>, TokenId> {
        self.pieces.get_or_init(|| {
            let ranks: Vec<_> = (0..self.vocabulary).map(|id| id as _).collect();
            let pieces: HashMap<Vec<u8>, TokenId> =
                self.bpe._decode_native_and_split(ranks).zip(0..).collect();
            tracing::debug!(
                profile = self.name,
                pieces = pieces.len(),
                "indexed vocabulary bytes"
            );
            pieces
        })
    }
}

impl fmt::Debug for Tiktoken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tiktoken")
            .field("name", &self.name)
            .field("end_of_text", &self.end_of_text)
            .field("vocabulary", &self.vocabulary)
            .finish_non_exhaustive()
    }
}

impl Tokenizer for Tiktoken {
    fn name(&self) -> &str {
        self.name
    }

    fn encode(&self, text: &str) -> Vec<TokenId> {
        self.bpe
            .encode_ordinary(text)
            .into_iter()
            .map(|rank| rank as TokenId)
            .collect()
    }

    fn resolve_literal(&self, literal: &[u8]) -> Result<TokenId, Error> {
        if let Ok(text) = std::str::from_utf8(literal)
            && let [rank] = self.bpe.encode_ordinary(text).as_slice()
        {
            return Ok(*rank as TokenId);
        }
        // Byte-level pieces of split characters are not valid UTF-8 on their
        // own and never come out of `encode_ordinary` alone.
        self.pieces()
            .get(literal)
            .copied()
            .ok_or_else(|| Error::token_not_found(literal, self.name))
    }

    fn end_of_text(&self) -> TokenId {
        self.end_of_text
    }
}

/// Profiles loaded so far.  Parsing a vocabulary is expensive, so every
/// profile is loaded at most once per process.
static LOADED: LazyLock<Mutex<HashMap<&'static str, Arc<dyn Tokenizer>>>> =
    LazyLock::new(Default::default);

/// Look up a tokenizer profile by name.
pub fn load(name: &str) -> Result<Arc<dyn Tokenizer>, Error> {
    // The vocabulary size excludes unassigned ids between the byte-pair
    // ranks and the special tokens, which have no bytes to decode.
    type Open = fn() -> Result<CoreBPE, String>;
    let (profile, vocabulary, open): (&'static str, TokenId, Open) = match name {
        "cl100k_base" => ("cl100k_base", 100_256, || {
            tiktoken_rs::cl100k_base().map_err(|err| err.to_string())
        }),
        "o200k_base" => ("o200k_base", 199_998, || {
            tiktoken_rs::o200k_base().map_err(|err| err.to_string())
        }),
        "p50k_base" => ("p50k_base", 50_281, || {
            tiktoken_rs::p50k_base().map_err(|err| err.to_string())
        }),
        "p50k_edit" => ("p50k_edit", 50_281, || {
            tiktoken_rs::p50k_edit().map_err(|err| err.to_string())
        }),
        "r50k_base" | "gpt2" => ("r50k_base", 50_257, || {
            tiktoken_rs::r50k_base().map_err(|err| err.to_string())
        }),
        _ => return Err(Error::UnknownTokenizer(name.to_owned())),
    };

    let mut loaded = LOADED.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(tokenizer) = loaded.get(profile) {
        return Ok(Arc::clone(tokenizer));
    }

    let bpe = open().map_err(|reason| Error::TokenizerLoad {
        name: profile.to_owned(),
        reason,
    })?;
    let tokenizer: Arc<dyn Tokenizer> = Arc::new(Tiktoken::new(profile, vocabulary, bpe)?);
    tracing::debug!(
        profile,
        end_of_text = tokenizer.end_of_text(),
        "loaded tokenizer profile"
    );
    loaded.insert(profile, Arc::clone(&tokenizer));
    Ok(tokenizer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EndMode, PatternBuilder};

    use pretty_assertions::assert_eq;

    fn cl100k() -> Arc<dyn Tokenizer> {
        load("cl100k_base").expect("cl100k_base ships with tiktoken-rs")
    }

    #[test]
    fn test_unknown_profile() {
        assert_eq!(
            load("cl100k").unwrap_err(),
            Error::UnknownTokenizer("cl100k".into())
        );
    }

    #[test]
    fn test_end_of_text_ids() {
        assert_eq!(cl100k().end_of_text(), 100257);
        let gpt2 = load("gpt2").unwrap();
        assert_eq!(gpt2.name(), "r50k_base");
        assert_eq!(gpt2.end_of_text(), 50256);
    }

    #[test]
    fn test_profiles_are_cached() {
        assert!(Arc::ptr_eq(&cl100k(), &cl100k()));
        assert!(Arc::ptr_eq(&load("gpt2").unwrap(), &load("r50k_base").unwrap()));
    }

    #[test]
    fn test_every_profile_loads() {
        for name in PROFILES {
            let tokenizer = load(name).unwrap();
            assert_eq!(tokenizer.encode("").len(), 0, "{name}");
        }
    }

    #[test]
    fn test_resolve_literal() {
        let tokenizer = cl100k();
        let encoded = tokenizer.encode("I love MIT.");
        assert_eq!(encoded.len(), 4);
        for (literal, id) in ["I", " love", " MIT", "."].iter().zip(&encoded) {
            assert_eq!(tokenizer.resolve_literal(literal.as_bytes()), Ok(*id));
        }
    }

    #[test]
    fn test_resolve_literal_rejects_non_tokens() {
        let tokenizer = cl100k();
        for literal in [&b"I love"[..], b"", b"\xff\xff\xff\xff\xff\xff"] {
            assert_eq!(
                tokenizer.resolve_literal(literal),
                Err(Error::token_not_found(literal, "cl100k_base"))
            );
        }
    }

    #[test]
    fn test_resolve_byte_level_literal() {
        let tokenizer = cl100k();
        let encoded = tokenizer.encode("🙂");
        assert_eq!(encoded.len(), 2);
        assert_eq!(tokenizer.resolve_literal(b"\xf0\x9f"), Ok(encoded[0]));
        assert_eq!(tokenizer.resolve_literal(b"\x99\x82"), Ok(encoded[1]));
    }

    #[test]
    fn test_byte_level_pattern() {
        let pattern = PatternBuilder::new()
            .one(b"\xf0\x9f")
            .one(b"\x99\x82")
            .end_mode(EndMode::Strict)
            .build("cl100k_base")
            .unwrap();
        assert!(pattern.matches("🙂"));
        assert!(!pattern.matches("🙂🙂"));

        let prefix = PatternBuilder::new()
            .one(b"\xf0\x9f")
            .build("cl100k_base")
            .unwrap();
        assert!(prefix.matches("🙂"));
        assert!(!prefix.matches("x🙂"));
    }

    #[test]
    fn test_special_tokens_encode_as_text() {
        let tokenizer = cl100k();
        let tokens = tokenizer.encode(END_OF_TEXT);
        assert!(tokens.len() > 1);
        assert!(!tokens.contains(&tokenizer.end_of_text()));
    }

    #[test]
    fn test_love_hate_scenario() {
        let builder = PatternBuilder::new()
            .one(b"I")
            .set([b" love", b" hate"])
            .one(b" MIT")
            .one(b".");
        let pattern = builder.build("cl100k_base").unwrap();
        assert!(pattern.matches("I love MIT."));
        assert!(pattern.matches("I hate MIT."));
        assert!(!pattern.matches("I like MIT."));
        assert!(!pattern.matches("I love MIT"));

        let rebuilt = builder.build("cl100k_base").unwrap();
        assert!(pattern.matches("I love MIT.") && rebuilt.matches("I hate MIT."));
    }

    #[test]
    fn test_love_hate_scenario_strict() {
        let pattern = PatternBuilder::new()
            .one("I")
            .set([" love", " hate"])
            .one(" MIT")
            .one(".")
            .end_mode(EndMode::Strict)
            .build("cl100k_base")
            .unwrap();
        assert!(pattern.matches("I love MIT."));
        assert!(!pattern.matches("I love MIT. Really."));

        let prefix = PatternBuilder::new()
            .one("I")
            .set([" love", " hate"])
            .one(" MIT")
            .build("cl100k_base")
            .unwrap();
        assert!(prefix.matches("I love MIT. Really."));
    }

    #[test]
    fn test_literal_checked_at_build() {
        let err = PatternBuilder::new()
            .one("I")
            .one(" love MIT")
            .build("cl100k_base")
            .unwrap_err();
        assert_eq!(err, Error::token_not_found(b" love MIT", "cl100k_base"));
    }

    #[test]
    fn test_repetition_over_real_tokens() {
        let tokenizer = cl100k();
        let tokens = tokenizer.encode("I love");
        let [i, love] = tokens[..] else {
            panic!("`I love` should be two tokens");
        };
        let pattern = PatternBuilder::new()
            .one(i)
            .one_or_more(love)
            .optional(".")
            .one(i)
            .build_with(Arc::clone(&tokenizer))
            .unwrap();
        assert!(pattern.matches_tokens(&[i, love, i]));
        assert!(pattern.matches_tokens(&[i, love, love, love, i]));
        assert!(!pattern.matches_tokens(&[i, i]));
    }
}
