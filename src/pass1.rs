//! First pass: frame-synchronous token passing over the tree lexicon. Each live token pins one
//! search hypothesis to a (tree node, HMM state) cell; every frame the tokens advance through
//! their phone models, spill across arc boundaries (paying the factoring difference), and at
//! word ends emit trellis atoms before restarting at the root with a fresh language-model
//! context. Merging at each destination cell keeps either the single best token or, under the
//! word-pair approximation, the best per previous word. Beam pruning against the frame best and
//! a hard envelope on the population keep the whole thing linear in utterance length.
//!
//! All the per-frame work is driven by [`Pass1::step`]; the engine owns the loop so it can
//! observe pause and terminate requests between frames.
use ahash::AHashMap;
use tracing::debug;

use crate::config::{DecoderConfig, MergeMode};
use crate::hmm::AcousticModel;
use crate::lexicon::{Vocabulary, WordId, WORD_INVALID};
use crate::lm::{LangModel, LmId, LM_INVALID};
use crate::logprob::{LogProb, LOG_ZERO};
use crate::scorer::Scorer;
use crate::tree_lexicon::{NodeId, TreeLexicon, ROOT};
use crate::trellis::{TrellisWord, WordTrellis, TrellisId, TRELLIS_NONE};

/// Emission/pruning guard: anything at or below this is a dead path.
const SCORE_FLOOR: LogProb = LOG_ZERO / 2.0;

#[derive(Clone, Copy, Debug)]
struct Token {
    node: NodeId,
    /// Emitting state position within the node's phone (0-based).
    state: u8,
    /// Accumulated AM + weighted LM score.
    score: LogProb,
    /// The factoring amount currently folded into `score`, subtracted again when the exact
    /// word score is known.
    last_factor: LogProb,
    /// Last non-transparent word, the LM context and cross-word phone context.
    context_word: WordId,
    /// Trellis atom of the word that preceded this token's word.
    trellis: TrellisId,
}

/// A token that has crossed an arc-exit and is looking for somewhere to go.
#[derive(Clone, Copy, Debug)]
struct ExitToken {
    node: NodeId,
    score: LogProb,
    last_factor: LogProb,
    context_word: WordId,
    trellis: TrellisId,
}

pub struct Pass1<'a> {
    am: &'a AcousticModel,
    tree: &'a TreeLexicon,
    voca: &'a Vocabulary,
    lm: &'a dyn LangModel,
    cfg: &'a DecoderConfig,
    grammar: bool,
    tokens: Vec<Token>,
    trellis: WordTrellis,
    t: usize,
    /// Root re-entries waiting for the next frame (initially the utterance start).
    pending: Vec<ExitToken>,
}

impl<'a> Pass1<'a> {
    pub fn new(
        am: &'a AcousticModel,
        tree: &'a TreeLexicon,
        voca: &'a Vocabulary,
        lm: &'a dyn LangModel,
        cfg: &'a DecoderConfig,
        grammar: bool,
    ) -> Self {
        Self {
            am,
            tree,
            voca,
            lm,
            cfg,
            grammar,
            tokens: Vec::new(),
            trellis: WordTrellis::new(),
            t: 0,
            pending: vec![ExitToken {
                node: ROOT,
                score: 0.0,
                last_factor: 0.0,
                context_word: WORD_INVALID,
                trellis: TRELLIS_NONE,
            }],
        }
    }

    pub fn frame(&self) -> usize {
        self.t
    }

    pub fn num_active(&self) -> usize {
        self.tokens.len()
    }

    fn left_context(&self, context_word: WordId) -> Option<&str> {
        if context_word == WORD_INVALID {
            None
        } else {
            Some(self.tree.last_phone(context_word))
        }
    }

    fn lm_id(&self, w: WordId) -> LmId {
        self.tree.lm_ids[w as usize]
    }

    /// Weighted exact LM score for ending word `w` after `context_word`, or `None` when the
    /// transition is inadmissible.
    fn word_lm_score(&self, w: WordId, context_word: WordId) -> Option<LogProb> {
        let wid = self.lm_id(w);
        if wid == LM_INVALID {
            return None;
        }
        let raw = if context_word == WORD_INVALID {
            if self.grammar {
                if self.lm.starts_sentence(wid) {
                    0.0
                } else {
                    LOG_ZERO
                }
            } else {
                match self.lm.begin_id() {
                    Some(b) => self.lm.logp_fast(wid, b),
                    None => self.lm.factor_bound(wid),
                }
            }
        } else {
            let ctx = self.lm_id(context_word);
            self.lm.logp_fast(wid, ctx)
        };
        if raw <= SCORE_FLOOR {
            return None;
        }
        let class = self.voca.word(w).class_log_prob;
        Some(self.cfg.lm_weight * (raw + class) + self.cfg.lm_penalty)
    }

    /// Advances the search by one frame. The scorer must already hold frame `self.frame()`.
    /// Returns `false` when the beam has emptied and the pass should stop early.
    pub fn step(&mut self, scorer: &mut Scorer) -> bool {
        let t = self.t;
        let mut candidates: AHashMap<(NodeId, u8, WordId), Token> = AHashMap::new();
        let mut exits: Vec<ExitToken> = Vec::new();

        // In-arc transitions from last frame's tokens.
        for tok in std::mem::take(&mut self.tokens) {
            let model = self
                .tree
                .phone_model(tok.node, self.left_context(tok.context_word));
            let hmm = self.am.phone_trans(model);
            let emitting = hmm.emitting_len();
            let from = tok.state as usize + 1;
            for to in 1..=emitting {
                let p = hmm.trans(from, to);
                if p <= LOG_ZERO {
                    continue;
                }
                self.propose(
                    &mut candidates,
                    Token {
                        node: tok.node,
                        state: (to - 1) as u8,
                        score: tok.score + p,
                        ..tok
                    },
                );
            }
            let p_exit = hmm.trans(from, emitting + 1);
            if p_exit > LOG_ZERO {
                exits.push(ExitToken {
                    node: tok.node,
                    score: tok.score + p_exit,
                    last_factor: tok.last_factor,
                    context_word: tok.context_word,
                    trellis: tok.trellis,
                });
            }
        }

        // Root re-entries scheduled by the previous frame (or the utterance start).
        exits.append(&mut self.pending);

        // Arc crossings, word-end emission, and tee-model pass-through.
        let tree = self.tree;
        while let Some(exit) = exits.pop() {
            if exit.node != ROOT {
                for &w in tree.word_ends(exit.node) {
                    self.emit_word(&exit, w, t, &mut exits);
                }
            }
            for &child in tree.successors(exit.node) {
                self.enter_arc(child, &exit, &mut candidates, &mut exits);
            }
        }

        // Output probabilities, then the beam.
        let mut toks: Vec<Token> = candidates.into_values().collect();
        for tok in toks.iter_mut() {
            let model = self
                .tree
                .phone_model(tok.node, self.left_context(tok.context_word));
            tok.score += scorer.score(t, self.am.state_at(model, tok.state as usize));
        }
        toks.retain(|tok| tok.score > SCORE_FLOOR);
        toks.sort_unstable_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.node.cmp(&b.node))
                .then(a.state.cmp(&b.state))
                .then(a.context_word.cmp(&b.context_word))
        });
        if let Some(best) = toks.first().map(|t| t.score) {
            let floor = best - self.cfg.beam_width;
            toks.retain(|tok| tok.score >= floor);
        }
        if toks.len() > self.cfg.beam_envelope {
            // envelope exceeded: the effective pruning floor rises to the envelope boundary
            toks.truncate(self.cfg.beam_envelope);
        }
        self.tokens = toks;

        if t > 0 {
            self.trellis.finish_frame(t - 1);
        }
        self.t += 1;
        if self.tokens.is_empty() {
            debug!("beam emptied at frame {}", t);
            false
        } else {
            true
        }
    }

    fn propose(&self, candidates: &mut AHashMap<(NodeId, u8, WordId), Token>, tok: Token) {
        let key = match self.cfg.merge_mode {
            MergeMode::OneBest => (tok.node, tok.state, WORD_INVALID),
            MergeMode::WordPair => (tok.node, tok.state, tok.context_word),
        };
        match candidates.get_mut(&key) {
            Some(old) => {
                // Deterministic merge: higher score wins, ties resolved on stable fields so
                // results never depend on map iteration order.
                let replace = tok.score > old.score
                    || (tok.score == old.score
                        && (tok.context_word, tok.trellis) < (old.context_word, old.trellis));
                if replace {
                    *old = tok;
                }
            }
            None => {
                candidates.insert(key, tok);
            }
        }
    }

    /// Emits a trellis atom for word `w` ending at frame `t - 1` and schedules the root
    /// re-entry carrying the updated context.
    fn emit_word(&mut self, exit: &ExitToken, w: WordId, t: usize, exits: &mut Vec<ExitToken>) {
        if t == 0 {
            return;
        }
        let Some(lscore) = self.word_lm_score(w, exit.context_word) else {
            return;
        };
        let score = exit.score - exit.last_factor + lscore;
        if score <= SCORE_FLOOR {
            return;
        }
        let begin = if exit.trellis == TRELLIS_NONE {
            0
        } else {
            self.trellis.get(exit.trellis).end + 1
        };
        if begin > t - 1 {
            // a word must occupy at least one frame; also cuts tee-model emission cycles
            return;
        }
        let atom = self.trellis.push(TrellisWord {
            word: w,
            begin,
            end: t - 1,
            score,
            lm_score: lscore,
            last: exit.trellis,
        });
        let context_word = if self.voca.word(w).transparent {
            exit.context_word
        } else {
            w
        };
        exits.push(ExitToken {
            node: ROOT,
            score,
            last_factor: 0.0,
            context_word,
            trellis: atom,
        });
    }

    /// Enters `child`'s phone from its entry state, applying the factoring delta. A model that
    /// can pass entry to exit without emitting chains back onto the exit list.
    fn enter_arc(
        &self,
        child: NodeId,
        exit: &ExitToken,
        candidates: &mut AHashMap<(NodeId, u8, WordId), Token>,
        exits: &mut Vec<ExitToken>,
    ) {
        let factor = self.cfg.lm_weight * self.tree.node(child).factor;
        if factor <= SCORE_FLOOR && !self.grammar {
            return;
        }
        let base = exit.score - exit.last_factor + factor;
        if base <= SCORE_FLOOR {
            return;
        }
        let model = self
            .tree
            .phone_model(child, self.left_context(exit.context_word));
        let hmm = self.am.phone_trans(model);
        let emitting = hmm.emitting_len();
        for to in 1..=emitting {
            let p = hmm.trans(0, to);
            if p <= LOG_ZERO {
                continue;
            }
            self.propose(
                candidates,
                Token {
                    node: child,
                    state: (to - 1) as u8,
                    score: base + p,
                    last_factor: factor,
                    context_word: exit.context_word,
                    trellis: exit.trellis,
                },
            );
        }
        let p_through = hmm.trans(0, emitting + 1);
        if p_through > LOG_ZERO {
            exits.push(ExitToken {
                node: child,
                score: base + p_through,
                last_factor: factor,
                context_word: exit.context_word,
                trellis: exit.trellis,
            });
        }
    }

    /// Ends the utterance: flushes word ends reachable from the final tokens (ending at the
    /// last processed frame) and returns the finished trellis.
    pub fn finish(mut self) -> WordTrellis {
        let t = self.t;
        if t > 0 {
            let mut exits: Vec<ExitToken> = Vec::new();
            for tok in std::mem::take(&mut self.tokens) {
                let model = self
                    .tree
                    .phone_model(tok.node, self.left_context(tok.context_word));
                let hmm = self.am.phone_trans(model);
                let from = tok.state as usize + 1;
                let p_exit = hmm.trans(from, hmm.emitting_len() + 1);
                if p_exit > LOG_ZERO {
                    exits.push(ExitToken {
                        node: tok.node,
                        score: tok.score + p_exit,
                        last_factor: tok.last_factor,
                        context_word: tok.context_word,
                        trellis: tok.trellis,
                    });
                }
            }
            // Only word ends matter here; re-entries would be beyond the last frame. Tee
            // chains still need following so short tail models flush completely.
            while let Some(exit) = exits.pop() {
                if exit.node != ROOT {
                    let ends: Vec<WordId> = self.tree.word_ends(exit.node).to_vec();
                    for w in ends {
                        self.flush_word(&exit, w, t);
                    }
                }
                for &child in self.tree.successors(exit.node) {
                    let model = self
                        .tree
                        .phone_model(child, self.left_context(exit.context_word));
                    let hmm = self.am.phone_trans(model);
                    let p_through = hmm.trans(0, hmm.emitting_len() + 1);
                    if p_through > LOG_ZERO {
                        let factor = self.cfg.lm_weight * self.tree.node(child).factor;
                        exits.push(ExitToken {
                            node: child,
                            score: exit.score - exit.last_factor + factor + p_through,
                            last_factor: factor,
                            context_word: exit.context_word,
                            trellis: exit.trellis,
                        });
                    }
                }
            }
            self.trellis.finish_frame(t - 1);
        }
        self.trellis
    }

    fn flush_word(&mut self, exit: &ExitToken, w: WordId, t: usize) {
        let Some(lscore) = self.word_lm_score(w, exit.context_word) else {
            return;
        };
        let score = exit.score - exit.last_factor + lscore;
        if score <= SCORE_FLOOR {
            return;
        }
        let begin = if exit.trellis == TRELLIS_NONE {
            0
        } else {
            self.trellis.get(exit.trellis).end + 1
        };
        if begin > t - 1 {
            return;
        }
        self.trellis.push(TrellisWord {
            word: w,
            begin,
            end: t - 1,
            score,
            lm_score: lscore,
            last: exit.trellis,
        });
    }
}
