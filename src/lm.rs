//! The linguistic constraint interface. The two passes don't care whether word sequences are
//! judged by a statistical N-gram or a hand-written finite-state grammar; they ask for scores
//! and admissibility through this trait and the concrete models answer in their own way:
//! an N-gram returns back-off log probabilities and admits everything, a grammar returns zero
//! for legal transitions and forbids the rest through the category-pair test.
use crate::logprob::LogProb;

/// Id of an entry in the language model (a word for word N-grams, a class for class N-grams,
/// a category for grammars).
pub type LmId = u32;
pub const LM_INVALID: LmId = u32::MAX;

/// Which adjacency a set of N-gram tuples describes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Context is the preceding words, the usual reading order.
    Forward,
    /// Context is the following words; what the backward second pass consumes natively.
    Reverse,
}

pub trait LangModel: Send + Sync {
    /// Resolves an entry name. `None` for out-of-vocabulary names; open-vocabulary callers
    /// then fall back to [`LangModel::unknown_id`].
    fn entry_id(&self, name: &str) -> Option<LmId>;

    /// Sentence-start entry, when the model has one.
    fn begin_id(&self) -> Option<LmId>;

    /// Sentence-end entry, when the model has one.
    fn end_id(&self) -> Option<LmId>;

    /// The `<unk>` entry in open-vocabulary models, `None` when the vocabulary is closed.
    fn unknown_id(&self) -> Option<LmId>;

    /// Full-context score used by the second pass. Because pass 2 extends sentences right to
    /// left, `context` holds the words *following* `word` in time, nearest first. Reverse
    /// N-grams score this natively; forward models approximate (exactly so at bigram order).
    fn logp(&self, word: LmId, context: &[LmId]) -> LogProb;

    /// Two-word approximation used frame-synchronously by the first pass.
    fn logp_fast(&self, word: LmId, prev: LmId) -> LogProb;

    /// Context-independent upper bound on `word`'s score, the quantity the tree lexicon
    /// factors along its arcs. Must never underestimate any reachable [`LangModel::logp`].
    fn factor_bound(&self, word: LmId) -> LogProb;

    /// Category-pair admissibility for grammar-backed models. `prev_cat` precedes `next_cat`
    /// in time. Statistical models admit everything.
    fn admissible(&self, prev_cat: u32, next_cat: u32) -> bool {
        let _ = (prev_cat, next_cat);
        true
    }

    /// Whether a category may start a sentence (grammar modes).
    fn starts_sentence(&self, cat: u32) -> bool {
        let _ = cat;
        true
    }

    /// Whether a category may end a sentence (grammar modes).
    fn ends_sentence(&self, cat: u32) -> bool {
        let _ = cat;
        true
    }
}
