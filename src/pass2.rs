//! Second pass: best-first stack decoding over the word trellis, right to left. Hypotheses are
//! partial sentences anchored at the utterance end; the exact part g covers the frames already
//! re-scored, and the estimate h is the first pass's forward score up to the open boundary,
//! read straight off the trellis. Because the first pass scored words with an upper-bounding
//! factored LM, h never underestimates and the first terminal popped is the best sentence; the
//! next pops give the N-best.
//!
//! Expanding a hypothesis means: pick trellis words ending just left of the boundary, re-run a
//! short exact Viterbi for each over its frame span with the true cross-word context, add the
//! full-context LM score, push. Fan-out, total pops and a beam below the best complete sentence
//! keep the stack bounded.
use std::collections::BinaryHeap;
use tracing::{debug, info};

use crate::config::DecoderConfig;
use crate::hmm::{center_name, AcousticModel, PhoneModel};
use crate::lexicon::{Vocabulary, WordId};
use crate::lm::{LangModel, LmId, LM_INVALID};
use crate::logprob::{LogProb, LOG_ZERO};
use crate::scorer::Scorer;
use crate::tree_lexicon::word_phone_models;
use crate::trellis::WordTrellis;

const SCORE_FLOOR: LogProb = LOG_ZERO / 2.0;

/// One recognised word in a finished sentence, in time order.
#[derive(Clone, Debug)]
pub struct WordResult {
    pub word: WordId,
    pub begin: usize,
    pub end: usize,
    pub am_score: LogProb,
    pub lm_score: LogProb,
}

/// A completed sentence from the stack search.
#[derive(Clone, Debug)]
pub struct SentenceResult {
    pub words: Vec<WordResult>,
    pub score: LogProb,
    pub rank: usize,
    pub confidence: Option<f32>,
}

/// A word instance re-scored during the search; raw material for the word graph. `right` points
/// at the instance that followed it in the hypothesis it was created for.
#[derive(Clone, Debug)]
pub struct GraphSeed {
    pub word: WordId,
    pub begin: usize,
    pub end: usize,
    pub am_score: LogProb,
    pub lm_score: LogProb,
    pub f_score: LogProb,
    pub right: Option<usize>,
    /// Instance belongs to at least one terminal (complete) hypothesis.
    pub on_terminal: bool,
}

#[derive(Clone, Debug)]
pub struct Pass2Output {
    pub sentences: Vec<SentenceResult>,
    pub seeds: Vec<GraphSeed>,
    pub pops: usize,
    /// True when the pop budget ran out before the N-best list filled.
    pub exhausted: bool,
}

#[derive(Clone, Debug)]
struct Hypothesis {
    /// Word instances right-to-left: `words[0]` is the last word of the sentence.
    words: Vec<WordResult>,
    /// Seed index of the leftmost instance, for graph adjacency.
    leftmost_seed: usize,
    /// LM context: entries of the leftmost non-transparent words, nearest first (at most 2).
    ctx_lm: Vec<LmId>,
    /// Category of the leftmost word, transparent or not, for grammar admissibility.
    leftmost_cat: u32,
    leftmost_word: WordId,
    /// First frame already exactly scored; the hypothesis is terminal at 0.
    boundary: usize,
    g: LogProb,
    f: LogProb,
}

struct StackItem {
    hyp: Hypothesis,
    seq: u64,
}

impl PartialEq for StackItem {
    fn eq(&self, other: &Self) -> bool {
        self.hyp.f == other.hyp.f && self.seq == other.seq
    }
}
impl Eq for StackItem {}
impl PartialOrd for StackItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for StackItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // max-heap on f; on ties the later insert (older boundary) pops first
        self.hyp
            .f
            .total_cmp(&other.hyp.f)
            .then(self.seq.cmp(&other.seq))
    }
}

pub struct Pass2<'a> {
    am: &'a AcousticModel,
    voca: &'a Vocabulary,
    lm: &'a dyn LangModel,
    /// LM entry per word, shared with the tree lexicon.
    lm_ids: &'a [LmId],
    cfg: &'a DecoderConfig,
    grammar: bool,
}

impl<'a> Pass2<'a> {
    pub fn new(
        am: &'a AcousticModel,
        voca: &'a Vocabulary,
        lm: &'a dyn LangModel,
        lm_ids: &'a [LmId],
        cfg: &'a DecoderConfig,
        grammar: bool,
    ) -> Self {
        Self {
            am,
            voca,
            lm,
            lm_ids,
            cfg,
            grammar,
        }
    }

    /// Runs the stack search. `interrupted` is sampled between pops; returning true abandons
    /// the utterance with whatever was found so far.
    pub fn run(
        &self,
        scorer: &mut Scorer,
        trellis: &WordTrellis,
        frames: usize,
        interrupted: &mut dyn FnMut() -> bool,
    ) -> Pass2Output {
        let mut out = Pass2Output {
            sentences: Vec::new(),
            seeds: Vec::new(),
            pops: 0,
            exhausted: false,
        };
        if frames == 0 || trellis.is_empty() {
            return out;
        }
        let mut pq: BinaryHeap<StackItem> = BinaryHeap::new();
        let mut seq = 0u64;
        let mut best_complete = LOG_ZERO;

        // Initial stack: one hypothesis per surviving word end at the final frame.
        for &tid in trellis.ending_at(frames - 1) {
            let atom = trellis.get(tid);
            let w = atom.word;
            if self.grammar && !self.lm.ends_sentence(self.cat(w)) {
                continue;
            }
            let Some(lm_score) = self.final_word_lm(w) else {
                continue;
            };
            let am_score = self.align(scorer, w, atom.begin, frames - 1, None);
            if am_score <= SCORE_FLOOR {
                continue;
            }
            let g = am_score + lm_score;
            let h = self.heuristic(trellis, atom.begin);
            let word = WordResult {
                word: w,
                begin: atom.begin,
                end: frames - 1,
                am_score,
                lm_score,
            };
            let seed = out.seeds.len();
            out.seeds.push(GraphSeed {
                word: w,
                begin: atom.begin,
                end: frames - 1,
                am_score,
                lm_score,
                f_score: g + h,
                right: None,
                on_terminal: false,
            });
            let hyp = Hypothesis {
                ctx_lm: self.push_context(&[], w),
                leftmost_cat: self.cat(w),
                leftmost_word: w,
                leftmost_seed: seed,
                boundary: atom.begin,
                g,
                f: g + h,
                words: vec![word],
            };
            pq.push(StackItem { hyp, seq });
            seq += 1;
        }

        while let Some(StackItem { hyp, .. }) = pq.pop() {
            if interrupted() {
                break;
            }
            out.pops += 1;
            if out.pops > self.cfg.stack_pop_limit {
                out.exhausted = true;
                debug!("stack pop budget exhausted after {} pops", out.pops - 1);
                break;
            }
            if hyp.f < best_complete - self.cfg.stack_beam {
                continue; // discarded: hopeless next to what is already complete
            }
            if hyp.boundary == 0 {
                if let Some(final_term) = self.sentence_start_lm(&hyp) {
                    let score = hyp.g + final_term;
                    if score > best_complete {
                        best_complete = score;
                    }
                    // mark the whole chain of instances behind this sentence
                    let mut link = Some(hyp.leftmost_seed);
                    while let Some(i) = link {
                        if out.seeds[i].on_terminal {
                            break;
                        }
                        out.seeds[i].on_terminal = true;
                        link = out.seeds[i].right;
                    }
                    let mut words = hyp.words.clone();
                    words.reverse();
                    let rank = out.sentences.len();
                    out.sentences.push(SentenceResult {
                        words,
                        score,
                        rank,
                        confidence: None,
                    });
                    if out.sentences.len() >= self.cfg.nbest {
                        break;
                    }
                }
                continue;
            }

            // Expand leftward with trellis words ending just before the boundary.
            let bucket = trellis.ending_at(hyp.boundary - 1);
            let mut fanout = 0usize;
            let mut tried = ahash::AHashSet::new();
            for &tid in bucket {
                if fanout >= self.cfg.stack_fanout {
                    break;
                }
                let atom = trellis.get(tid);
                let v = atom.word;
                // several trellis atoms may name the same word with the same span
                if !tried.insert((v, atom.begin)) {
                    continue;
                }
                if self.grammar && !self.lm.admissible(self.cat(v), hyp.leftmost_cat) {
                    continue;
                }
                let Some(lm_score) = self.expansion_lm(v, &hyp) else {
                    continue;
                };
                let right_phone = center_name(&self.voca.word(hyp.leftmost_word).phones[0]);
                let am_score =
                    self.align(scorer, v, atom.begin, hyp.boundary - 1, Some(right_phone));
                if am_score <= SCORE_FLOOR {
                    continue;
                }
                fanout += 1;
                let g = hyp.g + am_score + lm_score;
                let h = self.heuristic(trellis, atom.begin);
                let f = g + h;
                if f <= SCORE_FLOOR || f < best_complete - self.cfg.stack_beam {
                    continue;
                }
                let seed = out.seeds.len();
                out.seeds.push(GraphSeed {
                    word: v,
                    begin: atom.begin,
                    end: hyp.boundary - 1,
                    am_score,
                    lm_score,
                    f_score: f,
                    right: Some(hyp.leftmost_seed),
                    on_terminal: false,
                });
                let mut words = hyp.words.clone();
                words.push(WordResult {
                    word: v,
                    begin: atom.begin,
                    end: hyp.boundary - 1,
                    am_score,
                    lm_score,
                });
                let next = Hypothesis {
                    ctx_lm: self.push_context(&hyp.ctx_lm, v),
                    leftmost_cat: self.cat(v),
                    leftmost_word: v,
                    leftmost_seed: seed,
                    boundary: atom.begin,
                    g,
                    f,
                    words,
                };
                pq.push(StackItem { hyp: next, seq });
                seq += 1;
            }
        }

        if out.sentences.is_empty() {
            info!("second pass found no complete hypothesis ({} pops)", out.pops);
        } else {
            info!(
                "second pass: {} sentences, best score {:.2}, {} pops",
                out.sentences.len(),
                out.sentences[0].score,
                out.pops
            );
        }
        out
    }

    fn cat(&self, w: WordId) -> u32 {
        self.voca.word(w).category
    }

    fn lm_id(&self, w: WordId) -> LmId {
        self.lm_ids[w as usize]
    }

    /// LM context for a hypothesis gaining leftmost word `w`: transparent words keep the
    /// previous context.
    fn push_context(&self, ctx: &[LmId], w: WordId) -> Vec<LmId> {
        if self.voca.word(w).transparent {
            return ctx.to_vec();
        }
        let mut next = Vec::with_capacity(2);
        next.push(self.lm_id(w));
        if let Some(&c) = ctx.first() {
            next.push(c);
        }
        next
    }

    /// Weighted LM score for the sentence-final word.
    fn final_word_lm(&self, w: WordId) -> Option<LogProb> {
        let id = self.lm_id(w);
        if id == LM_INVALID {
            return None;
        }
        let raw = if self.grammar {
            0.0
        } else {
            match self.lm.end_id() {
                Some(eos) => self.lm.logp(id, &[eos]),
                None => self.lm.logp(id, &[]),
            }
        };
        if raw <= SCORE_FLOOR {
            return None;
        }
        Some(self.cfg.lm_weight * (raw + self.voca.word(w).class_log_prob) + self.cfg.lm_penalty)
    }

    /// Weighted LM score for extending `hyp` leftward with `v`.
    fn expansion_lm(&self, v: WordId, hyp: &Hypothesis) -> Option<LogProb> {
        let id = self.lm_id(v);
        if id == LM_INVALID {
            return None;
        }
        let raw = if self.grammar {
            0.0 // admissibility already checked against the category pair
        } else {
            self.lm.logp(id, &hyp.ctx_lm)
        };
        if raw <= SCORE_FLOOR {
            return None;
        }
        Some(self.cfg.lm_weight * (raw + self.voca.word(v).class_log_prob) + self.cfg.lm_penalty)
    }

    /// Final LM term when a hypothesis reaches frame 0: the sentence-start marker scored
    /// against the leftmost words (grammar mode instead checks the category may begin).
    fn sentence_start_lm(&self, hyp: &Hypothesis) -> Option<LogProb> {
        if self.grammar {
            return self.lm.starts_sentence(hyp.leftmost_cat).then_some(0.0);
        }
        match self.lm.begin_id() {
            Some(bos) => {
                let raw = self.lm.logp(bos, &hyp.ctx_lm);
                if raw <= SCORE_FLOOR {
                    None
                } else {
                    Some(self.cfg.lm_weight * raw)
                }
            }
            None => Some(0.0),
        }
    }

    /// h for a boundary at `begin`: the first pass's best accumulated score through the frame
    /// just left of it.
    fn heuristic(&self, trellis: &WordTrellis, begin: usize) -> LogProb {
        if begin == 0 {
            return 0.0;
        }
        trellis
            .ending_at(begin - 1)
            .first()
            .map(|&tid| trellis.get(tid).score)
            .unwrap_or(LOG_ZERO)
    }

    /// Exact Viterbi over one word's concrete phone chain on a fixed frame span. The right
    /// cross-word context comes from the following word; the left stays open (pseudo).
    fn align(
        &self,
        scorer: &mut Scorer,
        w: WordId,
        begin: usize,
        end: usize,
        right_context: Option<&str>,
    ) -> LogProb {
        let Ok(models) = word_phone_models(self.am, self.voca, w, None, right_context) else {
            return LOG_ZERO;
        };
        let auto = WordAutomaton::build(self.am, &models);
        auto.viterbi(scorer, begin, end)
    }
}

/// Flattened state machine for one word: every emitting state of every phone in sequence, with
/// in-phone transitions, cross-phone chaining (following tee skips), entry and exit masses.
struct WordAutomaton {
    states: Vec<crate::hmm::StateRef>,
    /// Incoming transitions per state: (source state, log prob). Entry mass uses `None`.
    incoming: Vec<Vec<(Option<usize>, LogProb)>>,
    /// Log probability of reaching the word exit from each state.
    exit: Vec<LogProb>,
}

impl WordAutomaton {
    fn build(am: &AcousticModel, models: &[PhoneModel]) -> Self {
        let mut states = Vec::new();
        let mut offsets = Vec::with_capacity(models.len());
        for &m in models {
            offsets.push(states.len());
            let n = am.phone_trans(m).emitting_len();
            for pos in 0..n {
                states.push(am.state_at(m, pos));
            }
        }
        let total = states.len();
        let mut incoming: Vec<Vec<(Option<usize>, LogProb)>> = vec![Vec::new(); total];
        let mut exit = vec![LOG_ZERO; total];

        // word-entry mass: chain through phone entries, following tee skips
        let mut entry_mass = 0.0f32;
        for (pi, &m) in models.iter().enumerate() {
            let hmm = am.phone_trans(m);
            let n = hmm.emitting_len();
            for to in 1..=n {
                let p = hmm.trans(0, to);
                if p > LOG_ZERO {
                    incoming[offsets[pi] + to - 1].push((None, entry_mass + p));
                }
            }
            let skip = hmm.trans(0, n + 1);
            if skip <= LOG_ZERO {
                break;
            }
            entry_mass += skip;
        }

        for (pi, &m) in models.iter().enumerate() {
            let hmm = am.phone_trans(m);
            let n = hmm.emitting_len();
            for from in 1..=n {
                let src = offsets[pi] + from - 1;
                for to in 1..=n {
                    let p = hmm.trans(from, to);
                    if p > LOG_ZERO {
                        incoming[offsets[pi] + to - 1].push((Some(src), p));
                    }
                }
                let p_exit = hmm.trans(from, n + 1);
                if p_exit <= LOG_ZERO {
                    continue;
                }
                // chain into following phones, skipping through tees
                let mut mass = p_exit;
                let mut next = pi + 1;
                loop {
                    if next >= models.len() {
                        exit[src] = mass;
                        break;
                    }
                    let nh = am.phone_trans(models[next]);
                    let nn = nh.emitting_len();
                    for to in 1..=nn {
                        let p = nh.trans(0, to);
                        if p > LOG_ZERO {
                            incoming[offsets[next] + to - 1].push((Some(src), mass + p));
                        }
                    }
                    let skip = nh.trans(0, nn + 1);
                    if skip <= LOG_ZERO {
                        break;
                    }
                    mass += skip;
                    next += 1;
                }
            }
        }
        Self {
            states,
            incoming,
            exit,
        }
    }

    /// Best path score entering at `begin`, emitting every frame of `begin..=end`, and leaving
    /// the word exit after `end`.
    fn viterbi(&self, scorer: &mut Scorer, begin: usize, end: usize) -> LogProb {
        if self.states.is_empty() || begin > end {
            return LOG_ZERO;
        }
        let n = self.states.len();
        let mut prev = vec![LOG_ZERO; n];
        for t in begin..=end {
            let mut cur = vec![LOG_ZERO; n];
            for i in 0..n {
                let mut best = LOG_ZERO;
                for &(src, p) in &self.incoming[i] {
                    let base = match src {
                        None => {
                            if t == begin {
                                0.0
                            } else {
                                continue;
                            }
                        }
                        Some(s) => {
                            if t == begin {
                                continue;
                            }
                            prev[s]
                        }
                    };
                    if base + p > best {
                        best = base + p;
                    }
                }
                if best > SCORE_FLOOR {
                    cur[i] = best + scorer.score(t, self.states[i]);
                }
            }
            prev = cur;
        }
        let mut out = LOG_ZERO;
        for i in 0..n {
            if self.exit[i] > LOG_ZERO && prev[i] + self.exit[i] > out {
                out = prev[i] + self.exit[i];
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecoderConfig;
    use crate::lm::Direction;
    use crate::ngram::NGramBuilder;
    use crate::pass1::tests::{toy_am, uniform_unigram};
    use crate::pass1::Pass1;
    use crate::tree_lexicon::TreeLexicon;
    use std::io::Cursor;

    fn decode(
        frames: &[f32],
        dict: &str,
        lm: &dyn LangModel,
        cfg: &DecoderConfig,
    ) -> (Pass2Output, Vocabulary) {
        let am = toy_am(&[("s", 0.0), ("p", 3.0), ("q", -3.0)]);
        let voca = Vocabulary::from_reader(Cursor::new(dict), "d").unwrap();
        let tree = TreeLexicon::build(&voca, &am, lm, false).unwrap();
        let mut scorer = Scorer::new(&am, None, 0, 16);
        scorer.begin_utterance(am.param_kind, 1).unwrap();
        let mut p1 = Pass1::new(&am, &tree, &voca, lm, cfg, false);
        for &v in frames {
            scorer.push_frame(&[v]);
            if !p1.step(&mut scorer) {
                break;
            }
        }
        let trellis = p1.finish();
        let p2 = Pass2::new(&am, &voca, lm, &tree.lm_ids, cfg, false);
        let out = p2.run(&mut scorer, &trellis, frames.len(), &mut || false);
        (out, voca)
    }

    const DICT: &str = "uno [uno] p\ndos [dos] q\nsil [sil] s\n";

    #[test]
    fn single_word_utterance() {
        let lm = uniform_unigram(&["uno", "dos", "sil"]);
        let cfg = DecoderConfig::default();
        let (out, voca) = decode(&[3.0, 3.0, 3.0, 3.0], DICT, &lm, &cfg);
        assert_eq!(out.sentences.len(), 1);
        let s = &out.sentences[0];
        assert_eq!(s.words.len(), 1);
        assert_eq!(voca.word(s.words[0].word).output, "uno");
        assert_eq!(s.words[0].begin, 0);
        assert_eq!(s.words[0].end, 3);
    }

    #[test]
    fn two_word_sequence_in_time_order() {
        let lm = uniform_unigram(&["uno", "dos", "sil"]);
        let mut cfg = DecoderConfig::default();
        cfg.merge_mode = crate::config::MergeMode::WordPair;
        let (out, voca) = decode(&[3.0, 3.0, 3.0, -3.0, -3.0, -3.0], DICT, &lm, &cfg);
        assert!(!out.sentences.is_empty());
        let words: Vec<&str> = out.sentences[0]
            .words
            .iter()
            .map(|w| voca.word(w.word).output.as_str())
            .collect();
        assert_eq!(words, vec!["uno", "dos"]);
        // spans tile the utterance
        assert_eq!(out.sentences[0].words[0].begin, 0);
        assert_eq!(
            out.sentences[0].words[0].end + 1,
            out.sentences[0].words[1].begin
        );
        assert_eq!(out.sentences[0].words[1].end, 5);
    }

    /// N-best ordering follows the LM when acoustics can't tell the words apart (the "b vs c
    /// after a" construction).
    #[test]
    fn nbest_order_follows_lm() {
        // phones: p for "a", q shared by "b" and "c", so the suffixes sound identical
        let am = toy_am(&[("p", 3.0), ("q", -3.0)]);
        let dict = "a [a] p\nb [b] q\nc [c] q\n";
        let voca = Vocabulary::from_reader(Cursor::new(dict), "d").unwrap();
        let mut b = NGramBuilder::new(2, Direction::Forward);
        let ids: Vec<_> = ["a", "b", "c"].iter().map(|w| b.intern(w)).collect();
        let (a, bb, c) = (ids[0], ids[1], ids[2]);
        b.add(0, vec![a], (0.4f32).ln(), 0.0);
        b.add(0, vec![bb], (0.3f32).ln(), 0.0);
        b.add(0, vec![c], (0.3f32).ln(), 0.0);
        b.add(1, vec![a, bb], (0.6f32).ln(), 0.0);
        b.add(1, vec![a, c], (0.3f32).ln(), 0.0);
        let lm = b.build().unwrap();

        let mut cfg = DecoderConfig::default();
        cfg.nbest = 2;
        cfg.merge_mode = crate::config::MergeMode::WordPair;
        let tree = TreeLexicon::build(&voca, &am, &lm, false).unwrap();
        let mut scorer = Scorer::new(&am, None, 0, 16);
        scorer.begin_utterance(am.param_kind, 1).unwrap();
        let mut p1 = Pass1::new(&am, &tree, &voca, &lm, &cfg, false);
        let frames = [3.0, 3.0, 3.0, -3.0, -3.0, -3.0];
        for &v in &frames {
            scorer.push_frame(&[v]);
            assert!(p1.step(&mut scorer));
        }
        let trellis = p1.finish();
        let p2 = Pass2::new(&am, &voca, &lm, &tree.lm_ids, &cfg, false);
        let out = p2.run(&mut scorer, &trellis, frames.len(), &mut || false);
        assert_eq!(out.sentences.len(), 2);
        let texts: Vec<String> = out
            .sentences
            .iter()
            .map(|s| {
                s.words
                    .iter()
                    .map(|w| voca.word(w.word).output.clone())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();
        assert_eq!(texts[0], "a b");
        assert_eq!(texts[1], "a c");
        assert!(out.sentences[0].score > out.sentences[1].score);
    }

    /// Admissibility: every pop's f bounds the score of any sentence completed from it.
    #[test]
    fn heuristic_never_underestimates() {
        let lm = uniform_unigram(&["uno", "dos", "sil"]);
        let mut cfg = DecoderConfig::default();
        cfg.nbest = 3;
        cfg.merge_mode = crate::config::MergeMode::WordPair;
        let (out, _) = decode(&[3.0, 3.0, -3.0, -3.0, 3.0, 3.0], DICT, &lm, &cfg);
        assert!(!out.sentences.is_empty());
        // Sentences surface in pop order, so scores arrive non-increasing.
        for pair in out.sentences.windows(2) {
            assert!(pair[0].score >= pair[1].score - 1e-4);
        }
        // Every seed that ended up on a terminal chain carried an f at creation that bounds
        // the worst completed sentence reached through it.
        let worst = out.sentences.last().unwrap().score;
        for seed in out.seeds.iter().filter(|sd| sd.on_terminal) {
            assert!(seed.f_score + 1e-3 >= worst);
        }
    }

    #[test]
    fn empty_trellis_yields_no_result() {
        let lm = uniform_unigram(&["uno", "dos", "sil"]);
        let cfg = DecoderConfig::default();
        let am = toy_am(&[("s", 0.0), ("p", 3.0), ("q", -3.0)]);
        let voca = Vocabulary::from_reader(Cursor::new(DICT), "d").unwrap();
        let mut scorer = Scorer::new(&am, None, 0, 16);
        scorer.begin_utterance(am.param_kind, 1).unwrap();
        let p2 = Pass2::new(&am, &voca, &lm, &[0, 1, 2], &cfg, false);
        let trellis = WordTrellis::new();
        let out = p2.run(&mut scorer, &trellis, 0, &mut || false);
        assert!(out.sentences.is_empty());
        assert_eq!(out.pops, 0);
    }

    #[test]
    fn pop_budget_degrades_gracefully() {
        let lm = uniform_unigram(&["uno", "dos", "sil"]);
        let mut cfg = DecoderConfig::default();
        cfg.stack_pop_limit = 1;
        cfg.nbest = 5;
        cfg.merge_mode = crate::config::MergeMode::WordPair;
        let (out, _) = decode(&[3.0, 3.0, -3.0, -3.0], DICT, &lm, &cfg);
        assert!(out.exhausted || !out.sentences.is_empty());
    }

    #[test]
    fn interruption_stops_the_search() {
        let lm = uniform_unigram(&["uno", "dos", "sil"]);
        let cfg = DecoderConfig::default();
        let am = toy_am(&[("s", 0.0), ("p", 3.0), ("q", -3.0)]);
        let voca = Vocabulary::from_reader(Cursor::new(DICT), "d").unwrap();
        let mut scorer = Scorer::new(&am, None, 0, 16);
        scorer.begin_utterance(am.param_kind, 1).unwrap();
        let tree = TreeLexicon::build(&voca, &am, &lm, false).unwrap();
        let mut p1 = Pass1::new(&am, &tree, &voca, &lm, &cfg, false);
        for _ in 0..4 {
            scorer.push_frame(&[3.0]);
            p1.step(&mut scorer);
        }
        let trellis = p1.finish();
        let p2 = Pass2::new(&am, &voca, &lm, &tree.lm_ids, &cfg, false);
        let out = p2.run(&mut scorer, &trellis, 4, &mut || true);
        assert!(out.sentences.is_empty());
    }
}
