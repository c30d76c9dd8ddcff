//! Pattern matching over BPE token streams.
//!
//! Based on the token-level matching idea from
//! <https://mastodon.social/@rrika/110220304288351185>: instead of matching
//! characters, a [`Pattern`] is a sequence of constraints on the token ids a
//! byte-pair-encoding tokenizer produces for the input text.
//!
//! # Architecture
//!
//! ```text
//! PatternBuilder ──build──> Pattern ──MatcherMemory::matcher──> Matcher
//!   (unresolved records)      (resolved ids + tokenizer)        (step / chunk / finish)
//! ```
//!
//! ## Matching
//!
//! The scan is strictly left to right and never backtracks.  The matcher
//! keeps a cursor into the operation list and offers every token to the
//! operation under the cursor, which answers with a [`MatchingState`]:
//!
//! | State            | Cursor      | Token                            |
//! |------------------|-------------|----------------------------------|
//! | `MatchConsume`   | advance     | used                             |
//! | `MatchNoConsume` | advance     | re-offered to the next operation |
//! | `Continue`       | stay        | used                             |
//! | `NoMatch`        | -           | whole match fails                |
//!
//! Every transition either uses a token or moves the cursor, so a match
//! takes at most `tokens + operations` steps.
//!
//! Repetitions are greedy: `ZeroOrMore(x)` followed by `One(x)` can never
//! match, because the repetition absorbs every `x` before handing off.
//!
//! ## End of text
//!
//! Every pattern ends with an implicit [`Operation::EndOfText`] anchor.  How
//! that anchor is honoured is selected by [`EndMode`]:
//!
//! - [`EndMode::Prefix`] stops as soon as the cursor reaches the anchor, so
//!   trailing tokens are ignored and the anchor is never compared.  At the
//!   end of input the match succeeds only if the cursor got that far, which
//!   means a repetition that is still running when the input ends leaves the
//!   match unfinished.  A pattern with no operations besides the anchor
//!   accepts every text, the empty text included.
//! - [`EndMode::Strict`] feeds the tokenizer's end-of-text id after the last
//!   input token and requires the anchor to consume it.  Here the empty
//!   pattern makes the end-of-text comparison its only check, so it accepts
//!   the empty text alone.
//!
//! ## Progress state
//!
//! [`Operation::OneOrMore`] has to remember whether it has seen its token.
//! That flag lives in a [`Progress`] slot owned by [`MatcherMemory`], not in
//! the operation, so one [`Pattern`] can be matched any number of times and
//! from several threads at once.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexSet;
use thiserror::Error;

pub mod tokenizer;

pub use tokenizer::Tokenizer;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while building or driving a pattern.
///
/// A token stream that does not satisfy a pattern is not an error; it is
/// reported as `false` by [`Pattern::matches`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// An operation was given arguments it cannot be built from, such as a
    /// set with no members.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    /// A literal does not correspond to exactly one token of the vocabulary.
    #[error("`{literal}` is not a single token in `{tokenizer}`")]
    TokenNotFound { literal: String, tokenizer: String },
    /// No tokenizer profile is registered under this name.
    #[error("unknown tokenizer `{0}`")]
    UnknownTokenizer(String),
    /// A known profile failed to load its vocabulary.
    #[error("failed to load tokenizer `{name}`: {reason}")]
    TokenizerLoad { name: String, reason: String },
    /// The matcher was driven in a state that does not allow it.
    #[error("matcher precondition violated: {0}")]
    StatePrecondition(&'static str),
}

impl Error {
    pub(crate) fn token_not_found(literal: &[u8], tokenizer: &str) -> Self {
        Self::TokenNotFound {
            literal: literal.escape_ascii().to_string(),
            tokenizer: tokenizer.to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// A resolved token id.
pub type TokenId = u32;

/// A token as written in a pattern: either a raw byte string that still has
/// to be looked up in a vocabulary, or an id that already has been.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Token {
    Literal(Vec<u8>),
    Id(TokenId),
}

impl Token {
    /// Resolve this token against `tokenizer`.  Pure and idempotent.
    pub fn resolve(&self, tokenizer: &dyn Tokenizer) -> Result<TokenId, Error> {
        match self {
            Token::Literal(bytes) => tokenizer.resolve_literal(bytes),
            Token::Id(id) => Ok(*id),
        }
    }
}

impl From<TokenId> for Token {
    fn from(id: TokenId) -> Self {
        Token::Id(id)
    }
}

impl From<&[u8]> for Token {
    fn from(bytes: &[u8]) -> Self {
        Token::Literal(bytes.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Token {
    fn from(bytes: &[u8; N]) -> Self {
        Token::Literal(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Token {
    fn from(bytes: Vec<u8>) -> Self {
        Token::Literal(bytes)
    }
}

impl From<&str> for Token {
    fn from(text: &str) -> Self {
        Token::Literal(text.as_bytes().to_vec())
    }
}

impl From<String> for Token {
    fn from(text: String) -> Self {
        Token::Literal(text.into_bytes())
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// The answer an [`Operation`] gives for one offered token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchingState {
    /// The token satisfies the operation; move past both.
    MatchConsume,
    /// The operation is satisfied without the token; move past the
    /// operation and offer the same token to the next one.
    MatchNoConsume,
    /// The token is absorbed and the operation stays active.
    Continue,
    /// The token violates the operation and the match fails.
    NoMatch,
}

/// Per-operation state carried across the tokens offered to it within one
/// match attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    seen: bool,
}

impl Progress {
    /// Whether the operation has absorbed at least one token.
    pub fn seen(&self) -> bool {
        self.seen
    }
}

/// One constraint in a [`Pattern`], with every token already resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Exactly this token.
    One(TokenId),
    /// Any token of a non-empty set.
    Set(IndexSet<TokenId>),
    /// One or more repetitions of the token.
    OneOrMore(TokenId),
    /// Zero or more repetitions of the token.  Never fails.
    ZeroOrMore(TokenId),
    /// The token, or nothing.  Never fails.
    Optional(TokenId),
    /// The tokenizer's reserved end-of-text id.
    EndOfText,
    /// Any single token.
    Any,
}

impl Operation {
    /// Build a [`Operation::Set`], rejecting an empty set.
    pub fn set(tokens: impl IntoIterator<Item = TokenId>) -> Result<Self, Error> {
        let tokens: IndexSet<TokenId> = tokens.into_iter().collect();
        if tokens.is_empty() {
            return Err(Error::InvalidOperation("set has no tokens"));
        }
        Ok(Operation::Set(tokens))
    }

    /// Whether this operation reads or writes its [`Progress`] slot.
    pub fn is_stateful(&self) -> bool {
        matches!(self, Operation::OneOrMore(_))
    }

    /// Offer `token` to this operation.
    ///
    /// `progress` must be the slot belonging to this operation for the
    /// current match attempt.
    pub fn matches(
        &self,
        token: TokenId,
        tokenizer: &dyn Tokenizer,
        progress: &mut Progress,
    ) -> MatchingState {
        use MatchingState::*;
        match self {
            Operation::One(target) => {
                if token == *target {
                    MatchConsume
                } else {
                    NoMatch
                }
            }
            Operation::Set(targets) => {
                if targets.contains(&token) {
                    MatchConsume
                } else {
                    NoMatch
                }
            }
            Operation::OneOrMore(target) => {
                if token == *target {
                    progress.seen = true;
                    Continue
                } else if progress.seen {
                    MatchNoConsume
                } else {
                    NoMatch
                }
            }
            Operation::ZeroOrMore(target) => {
                if token == *target {
                    Continue
                } else {
                    MatchNoConsume
                }
            }
            Operation::Optional(target) => {
                if token == *target {
                    MatchConsume
                } else {
                    MatchNoConsume
                }
            }
            Operation::EndOfText => {
                if token == tokenizer.end_of_text() {
                    MatchConsume
                } else {
                    NoMatch
                }
            }
            Operation::Any => MatchConsume,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::One(id) => write!(f, "{id}"),
            Operation::Set(ids) => {
                f.write_str("[")?;
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        f.write_str("|")?;
                    }
                    write!(f, "{id}")?;
                }
                f.write_str("]")
            }
            Operation::OneOrMore(id) => write!(f, "{id}+"),
            Operation::ZeroOrMore(id) => write!(f, "{id}*"),
            Operation::Optional(id) => write!(f, "{id}?"),
            Operation::EndOfText => f.write_str("$"),
            Operation::Any => f.write_str("."),
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled pattern
// ---------------------------------------------------------------------------

/// How the implicit end-of-text anchor is honoured.  See the crate docs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EndMode {
    /// Succeed as soon as every operation before the anchor is satisfied.
    #[default]
    Prefix,
    /// Require the anchor to consume the end-of-text id after the input.
    Strict,
}

/// A resolved operation sequence bound to one tokenizer.
///
/// The last operation is always [`Operation::EndOfText`].
#[derive(Clone, Debug)]
pub struct Pattern {
    operations: Box<[Operation]>,
    tokenizer: Arc<dyn Tokenizer>,
    end_mode: EndMode,
}

impl Pattern {
    /// The operations, including the trailing anchor.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    pub fn end_mode(&self) -> EndMode {
        self.end_mode
    }

    /// Tokenize `text` and match the resulting token stream.
    pub fn matches(&self, text: &str) -> bool {
        let tokens = self.tokenizer.encode(text);
        self.matches_tokens(&tokens)
    }

    /// Match an already tokenized stream.
    pub fn matches_tokens(&self, tokens: &[TokenId]) -> bool {
        let mut memory = MatcherMemory::default();
        let mut matcher = memory.matcher(self);
        matcher.chunk(tokens);
        matcher.finish()
    }

    /// Index of the end-of-text anchor.
    fn anchor(&self) -> usize {
        self.operations.len() - 1
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, op) in self.operations.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{op}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pattern builder
// ---------------------------------------------------------------------------

/// An operation recorded by [`PatternBuilder`], resolved on
/// [`build`](PatternBuilder::build).
#[derive(Clone, Debug, PartialEq, Eq)]
enum OperationSpec {
    One(Token),
    Set(Vec<Token>),
    OneOrMore(Token),
    ZeroOrMore(Token),
    Optional(Token),
    Any,
}

impl OperationSpec {
    fn resolve(&self, tokenizer: &dyn Tokenizer) -> Result<Operation, Error> {
        Ok(match self {
            OperationSpec::One(token) => Operation::One(token.resolve(tokenizer)?),
            OperationSpec::Set(tokens) => Operation::set(
                tokens
                    .iter()
                    .map(|token| token.resolve(tokenizer))
                    .collect::<Result<Vec<_>, _>>()?,
            )?,
            OperationSpec::OneOrMore(token) => Operation::OneOrMore(token.resolve(tokenizer)?),
            OperationSpec::ZeroOrMore(token) => Operation::ZeroOrMore(token.resolve(tokenizer)?),
            OperationSpec::Optional(token) => Operation::Optional(token.resolve(tokenizer)?),
            OperationSpec::Any => Operation::Any,
        })
    }
}

/// Collects operations in order and turns them into a [`Pattern`].
///
/// ```no_run
/// use bpe_regex::PatternBuilder;
///
/// let pattern = PatternBuilder::new()
///     .one("I")
///     .set([" love", " hate"])
///     .one(" MIT")
///     .one(".")
///     .build("cl100k_base")?;
/// assert!(pattern.matches("I love MIT."));
/// # Ok::<(), bpe_regex::Error>(())
/// ```
///
/// The builder is not consumed by `build`, so one builder can produce any
/// number of independent patterns.
#[derive(Clone, Debug, Default)]
pub struct PatternBuilder {
    records: Vec<OperationSpec>,
    end_mode: EndMode,
}

impl PatternBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn one(mut self, token: impl Into<Token>) -> Self {
        self.records.push(OperationSpec::One(token.into()));
        self
    }

    /// Any one of `tokens`.  An empty set is reported by `build`.
    pub fn set<T: Into<Token>>(mut self, tokens: impl IntoIterator<Item = T>) -> Self {
        let tokens = tokens.into_iter().map(Into::into).collect();
        self.records.push(OperationSpec::Set(tokens));
        self
    }

    pub fn one_or_more(mut self, token: impl Into<Token>) -> Self {
        self.records.push(OperationSpec::OneOrMore(token.into()));
        self
    }

    pub fn zero_or_more(mut self, token: impl Into<Token>) -> Self {
        self.records.push(OperationSpec::ZeroOrMore(token.into()));
        self
    }

    pub fn optional(mut self, token: impl Into<Token>) -> Self {
        self.records.push(OperationSpec::Optional(token.into()));
        self
    }

    pub fn any(mut self) -> Self {
        self.records.push(OperationSpec::Any);
        self
    }

    pub fn end_mode(mut self, end_mode: EndMode) -> Self {
        self.end_mode = end_mode;
        self
    }

    /// Number of recorded operations, not counting the anchor.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Build against a named tokenizer profile (see [`tokenizer::load`]).
    pub fn build(&self, tokenizer: &str) -> Result<Pattern, Error> {
        self.build_with(tokenizer::load(tokenizer)?)
    }

    /// Build against a specific tokenizer.
    ///
    /// Every literal is resolved here, so a pattern that builds never fails
    /// while matching.
    pub fn build_with(&self, tokenizer: Arc<dyn Tokenizer>) -> Result<Pattern, Error> {
        let mut operations = Vec::with_capacity(self.records.len() + 1);
        for record in &self.records {
            operations.push(record.resolve(tokenizer.as_ref())?);
        }
        operations.push(Operation::EndOfText);

        tracing::debug!(
            tokenizer = tokenizer.name(),
            operations = operations.len(),
            end_mode = ?self.end_mode,
            "built pattern"
        );

        Ok(Pattern {
            operations: operations.into_boxed_slice(),
            tokenizer,
            end_mode: self.end_mode,
        })
    }
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

/// Reusable memory for [`Matcher`].  Create once, call
/// [`matcher`](Self::matcher) for each match attempt.
#[derive(Debug, Default)]
pub struct MatcherMemory {
    /// One slot per operation of the pattern being matched.
    progress: Vec<Progress>,
}

impl MatcherMemory {
    /// Start a fresh match attempt against `pattern`.  All progress from
    /// earlier attempts is discarded.
    pub fn matcher<'a>(&'a mut self, pattern: &'a Pattern) -> Matcher<'a> {
        self.progress.clear();
        self.progress
            .resize(pattern.operations.len(), Progress::default());

        Matcher {
            pattern,
            progress: &mut self.progress,
            cursor: 0,
            verdict: Verdict::Pending,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Verdict {
    Pending,
    Accepted,
    Rejected,
}

/// Feeds a token stream through a [`Pattern`], one token at a time.
#[derive(Debug)]
pub struct Matcher<'a> {
    pattern: &'a Pattern,
    progress: &'a mut [Progress],
    /// Index of the operation the next token is offered to.
    cursor: usize,
    verdict: Verdict,
}

impl<'a> Matcher<'a> {
    /// Offer one token.
    ///
    /// Fails with [`Error::StatePrecondition`] once the matcher has settled;
    /// see [`is_settled`](Self::is_settled).
    pub fn step(&mut self, token: TokenId) -> Result<(), Error> {
        match self.verdict {
            Verdict::Pending => {
                self.offer(token);
                Ok(())
            }
            Verdict::Accepted => Err(Error::StatePrecondition(
                "token fed after the match was accepted",
            )),
            Verdict::Rejected => Err(Error::StatePrecondition(
                "token fed after the match was rejected",
            )),
        }
    }

    /// Offer tokens in order, stopping as soon as the outcome is known.
    pub fn chunk(&mut self, tokens: &[TokenId]) {
        for &token in tokens {
            if self.is_settled() {
                break;
            }
            self.offer(token);
        }
    }

    /// Whether the outcome no longer depends on further tokens.
    pub fn is_settled(&self) -> bool {
        self.verdict != Verdict::Pending
    }

    /// Whether the match has already been accepted.  This does not signal
    /// end of input; use [`finish`](Self::finish) for the final answer.
    pub fn is_match(&self) -> bool {
        self.verdict == Verdict::Accepted
    }

    /// Signal end of input and return the final result.
    pub fn finish(mut self) -> bool {
        if self.verdict == Verdict::Pending
            && self.pattern.end_mode == EndMode::Strict
            && self.cursor < self.pattern.operations.len()
        {
            let end_of_text = self.pattern.tokenizer.end_of_text();
            self.offer(end_of_text);
        }

        match self.verdict {
            Verdict::Accepted => true,
            Verdict::Rejected => false,
            Verdict::Pending => match self.pattern.end_mode {
                EndMode::Prefix => self.cursor >= self.pattern.anchor(),
                EndMode::Strict => self.cursor == self.pattern.operations.len(),
            },
        }
    }

    /// Run `token` through operations until one of them uses it or the
    /// match settles.
    fn offer(&mut self, token: TokenId) {
        let pattern = self.pattern;
        loop {
            if pattern.end_mode == EndMode::Prefix && self.cursor >= pattern.anchor() {
                tracing::trace!(token, "operations exhausted with input pending");
                self.verdict = Verdict::Accepted;
                return;
            }
            let Some(operation) = pattern.operations.get(self.cursor) else {
                tracing::trace!(token, "input continues past the end-of-text anchor");
                self.verdict = Verdict::Rejected;
                return;
            };

            let state = operation.matches(
                token,
                pattern.tokenizer.as_ref(),
                &mut self.progress[self.cursor],
            );
            tracing::trace!(cursor = self.cursor, token, %operation, ?state);

            match state {
                MatchingState::MatchConsume => {
                    self.cursor += 1;
                    return;
                }
                MatchingState::MatchNoConsume => {
                    self.cursor += 1;
                }
                MatchingState::Continue => return,
                MatchingState::NoMatch => {
                    self.verdict = Verdict::Rejected;
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
