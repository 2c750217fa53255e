//! The recognition engine: owns the loaded models, drives the two passes over each utterance,
//! and exposes the small control surface the host application talks to. Per utterance the flow
//! is strictly `idle → pass1 → pass2 → result → idle`; all per-utterance state (score caches,
//! trellis, stack) is created fresh inside [`Engine::recognize_one_utterance`] and dropped
//! before it returns, so consecutive utterances can't contaminate each other.
//!
//! External pause/terminate/resume requests travel through a shared atomic flag and are
//! observed at exactly three checkpoints: between utterances, between first-pass frames, and
//! between second-pass stack pops. A grammar swap is likewise honoured only at the
//! between-utterance checkpoint.
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::DecoderConfig;
use crate::dfa::{bind_categories, DfaGrammar};
use crate::dnn::DnnModel;
use crate::error::ModelError;
use crate::features::{FeatureSet, FeatureStream, FrameSource};
use crate::graph::{ConfusionNetwork, WordGraph};
use crate::hmm::AcousticModel;
use crate::hmm_parse::load_acoustic_model;
use crate::lexicon::Vocabulary;
use crate::lm::{Direction, LangModel};
use crate::ngram::NGram;
use crate::pass1::Pass1;
use crate::pass2::{Pass2, SentenceResult};
use crate::scorer::Scorer;
use crate::tree_lexicon::TreeLexicon;
use crate::{arpa, logprob};

const RUN: u8 = 0;
const PAUSE: u8 = 1;
const TERMINATE: u8 = 2;

/// Cloneable handle for pause/terminate/resume requests, safe to poke from any thread.
#[derive(Clone, Debug)]
pub struct ControlHandle(Arc<AtomicU8>);

impl ControlHandle {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(RUN)))
    }

    pub fn request_pause(&self) {
        self.0.store(PAUSE, Ordering::SeqCst);
    }

    pub fn request_resume(&self) {
        // resume only clears a pause; a pending terminate stays pending
        let _ = self
            .0
            .compare_exchange(PAUSE, RUN, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn request_terminate(&self) {
        self.0.store(TERMINATE, Ordering::SeqCst);
    }
}

/// Blocks through a pause; returns true when the utterance should be abandoned.
fn checkpoint(control: &ControlHandle) -> bool {
    loop {
        match control.0.load(Ordering::SeqCst) {
            TERMINATE => {
                control.0.store(RUN, Ordering::SeqCst);
                return true;
            }
            PAUSE => std::thread::sleep(Duration::from_millis(5)),
            _ => return false,
        }
    }
}

/// The linguistic resource the engine was loaded with.
pub enum LmKind {
    NGram(NGram),
    Grammar(DfaGrammar),
}

impl LmKind {
    fn as_dyn(&self) -> &dyn LangModel {
        match self {
            Self::NGram(g) => g,
            Self::Grammar(g) => g,
        }
    }

    fn is_grammar(&self) -> bool {
        matches!(self, Self::Grammar(_))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecognitionStatus {
    /// At least one sentence came out.
    Success,
    /// The utterance was decoded but nothing survived (empty input, beam died, stack empty).
    NoResult,
    /// A terminate request abandoned the utterance.
    Terminated,
}

#[derive(Debug)]
pub struct RecognitionResult {
    pub status: RecognitionStatus,
    pub frames: usize,
    /// Ranked sentence hypotheses, best first; up to the configured N.
    pub sentences: Vec<SentenceResult>,
    pub graph: Option<WordGraph>,
    pub confusion_network: Option<ConfusionNetwork>,
}

impl RecognitionResult {
    fn empty(status: RecognitionStatus, frames: usize) -> Self {
        Self {
            status,
            frames,
            sentences: Vec::new(),
            graph: None,
            confusion_network: None,
        }
    }
}

/// Where to find the models on disk; see [`Engine::load`].
#[derive(Clone, Debug)]
pub struct ModelPaths {
    pub hmmdefs: PathBuf,
    pub hmmlist: Option<PathBuf>,
    pub dict: PathBuf,
    pub lm: LmPaths,
    pub dnn: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub enum LmPaths {
    Arpa { path: PathBuf, reverse: bool },
    BinaryNgram(PathBuf),
    Dfa(PathBuf),
}

pub struct Engine {
    config: DecoderConfig,
    am: AcousticModel,
    dnn: Option<DnnModel>,
    voca: Vocabulary,
    lm: LmKind,
    tree: TreeLexicon,
    control: ControlHandle,
    stream: Option<Box<dyn FrameSource>>,
    pending_grammar: Option<(DfaGrammar, Vocabulary)>,
}

impl Engine {
    /// Loads every resource from disk and freezes the search structures.
    pub fn load(config: DecoderConfig, paths: &ModelPaths) -> Result<Self, ModelError> {
        let am = load_acoustic_model(&paths.hmmdefs, paths.hmmlist.as_deref())?;
        let dnn = match &paths.dnn {
            Some(p) => {
                let file = std::fs::File::open(p).map_err(|e| ModelError::io(p, e))?;
                Some(DnnModel::read(
                    std::io::BufReader::new(file),
                    config.dnn_threads,
                )?)
            }
            None => None,
        };
        let dict = Vocabulary::open(&paths.dict)?;
        let lm = match &paths.lm {
            LmPaths::Arpa { path, reverse } => {
                let dir = if *reverse {
                    Direction::Reverse
                } else {
                    Direction::Forward
                };
                LmKind::NGram(arpa::read_arpa(path, dir)?)
            }
            LmPaths::BinaryNgram(path) => {
                let file = std::fs::File::open(path).map_err(|e| ModelError::io(path, e))?;
                LmKind::NGram(NGram::read_binary(std::io::BufReader::new(file))?)
            }
            LmPaths::Dfa(path) => LmKind::Grammar(DfaGrammar::open(path)?),
        };
        Self::from_parts(config, am, dnn, dict, lm)
    }

    /// Assembles an engine from already-loaded resources. This is the seam everything else
    /// (binaries, tests, embedders) goes through.
    pub fn from_parts(
        config: DecoderConfig,
        am: AcousticModel,
        dnn: Option<DnnModel>,
        mut dict: Vocabulary,
        mut lm: LmKind,
    ) -> Result<Self, ModelError> {
        logprob::prepare_add_table();
        let dropped = dict.validate_phones(&am, config.strict_vocabulary)?;
        if dropped > 0 {
            warn!("{} lexicon entries dropped for unknown phones", dropped);
        }
        if dict.is_empty() {
            return Err(ModelError::Malformed {
                what: "lexicon",
                msg: "no usable words".into(),
            });
        }
        if let LmKind::Grammar(dfa) = &mut lm {
            bind_categories(&mut dict, dfa.n_categories())?;
            dfa.mark_skippable(&dict);
            dfa.extract_pairs()?;
        }
        let tree = TreeLexicon::build(&dict, &am, lm.as_dyn(), lm.is_grammar())?;
        info!(
            "engine ready: {} words, {} tree nodes, {} mode",
            dict.len(),
            tree.len(),
            if lm.is_grammar() { "grammar" } else { "N-gram" }
        );
        Ok(Self {
            config,
            am,
            dnn,
            voca: dict,
            lm,
            tree,
            control: ControlHandle::new(),
            stream: None,
            pending_grammar: None,
        })
    }

    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.voca
    }

    /// Opens an input stream for the next utterance(s).
    pub fn open_stream(&mut self, source: Box<dyn FrameSource>) {
        self.stream = Some(source);
    }

    /// Convenience for whole-utterance feature sets: applies the optional zero-frame
    /// stripping, then streams the frames.
    pub fn open_features(&mut self, mut features: FeatureSet) {
        if self.config.strip_zero {
            if crate::features::strip_zero_frames(&mut features).is_none() {
                warn!("strip_zero requested but the features carry no absolute energy");
            }
        }
        self.open_stream(Box::new(FeatureStream::new(features)));
    }

    pub fn close_stream(&mut self) {
        self.stream = None;
    }

    /// Requests a grammar (and companion dictionary) swap. Takes effect at the next
    /// between-utterance checkpoint, never mid-decode.
    pub fn reload_grammar(&mut self, dfa: DfaGrammar, dict: Vocabulary) {
        self.pending_grammar = Some((dfa, dict));
    }

    fn apply_pending_grammar(&mut self) -> Result<(), ModelError> {
        let Some((mut dfa, mut dict)) = self.pending_grammar.take() else {
            return Ok(());
        };
        dict.validate_phones(&self.am, self.config.strict_vocabulary)?;
        bind_categories(&mut dict, dfa.n_categories())?;
        dfa.mark_skippable(&dict);
        dfa.extract_pairs()?;
        let tree = TreeLexicon::build(&dict, &self.am, &dfa, true)?;
        self.voca = dict;
        self.lm = LmKind::Grammar(dfa);
        self.tree = tree;
        info!("grammar swapped in at utterance boundary");
        Ok(())
    }

    /// Runs both passes over the currently open stream and returns the utterance result.
    /// Decode-time trouble (type mismatch, dead beam, empty stack) is reported in the result's
    /// status; only the absence of an open stream is an error.
    pub fn recognize_one_utterance(&mut self) -> Result<RecognitionResult, ModelError> {
        if self.stream.is_none() {
            return Err(ModelError::Malformed {
                what: "stream",
                msg: "no input stream is open".into(),
            });
        }

        // between-utterance checkpoint: control plus any pending grammar swap
        if checkpoint(&self.control) {
            return Ok(RecognitionResult::empty(RecognitionStatus::Terminated, 0));
        }
        self.apply_pending_grammar()?;

        let start = Instant::now();
        let grammar = self.lm.is_grammar();
        let lm = self.lm.as_dyn();
        let mut scorer = Scorer::new(
            &self.am,
            self.dnn.as_ref(),
            self.config.gprune_num,
            self.config.cache_block_frames,
        );
        {
            let stream = self.stream.as_ref().unwrap();
            if let Err(e) = scorer.begin_utterance(stream.kind(), stream.dim()) {
                warn!("input rejected: {}", e);
                return Ok(RecognitionResult::empty(RecognitionStatus::NoResult, 0));
            }
        }

        // pass 1, frame-synchronous
        let mut pass1 = Pass1::new(&self.am, &self.tree, &self.voca, lm, &self.config, grammar);
        let stream = self.stream.as_mut().unwrap();
        let mut beam_died = false;
        loop {
            if checkpoint(&self.control) {
                return Ok(RecognitionResult::empty(
                    RecognitionStatus::Terminated,
                    pass1.frame(),
                ));
            }
            let Some(frame) = stream.next_frame() else {
                break;
            };
            scorer.push_frame(&frame);
            if !pass1.step(&mut scorer) {
                beam_died = true;
                break;
            }
        }
        let frames = scorer.num_frames();
        let pass1_time = start.elapsed();
        if frames == 0 {
            debug!("empty utterance");
            return Ok(RecognitionResult::empty(RecognitionStatus::NoResult, 0));
        }
        if beam_died {
            warn!("first pass pruned every hypothesis at frame {}", frames - 1);
        }
        let trellis = pass1.finish();
        if trellis.is_empty() {
            return Ok(RecognitionResult::empty(RecognitionStatus::NoResult, frames));
        }
        info!(
            "pass 1: {} frames, {} trellis words in {:?}",
            frames,
            trellis.num_atoms(),
            pass1_time
        );

        // pass 2, best-first
        let control = self.control.clone();
        let mut terminated = false;
        let pass2 = Pass2::new(
            &self.am,
            &self.voca,
            lm,
            &self.tree.lm_ids,
            &self.config,
            grammar,
        );
        let out = {
            let mut interrupted = || {
                if checkpoint(&control) {
                    terminated = true;
                    true
                } else {
                    false
                }
            };
            pass2.run(&mut scorer, &trellis, frames, &mut interrupted)
        };
        info!("recognition finished in {:?}", start.elapsed());
        if terminated {
            return Ok(RecognitionResult::empty(RecognitionStatus::Terminated, frames));
        }
        if out.exhausted {
            warn!(
                "second pass stopped at the pop budget with {} of {} hypotheses",
                out.sentences.len(),
                self.config.nbest
            );
        }

        let mut result = RecognitionResult {
            status: if out.sentences.is_empty() {
                RecognitionStatus::NoResult
            } else {
                RecognitionStatus::Success
            },
            frames,
            sentences: out.sentences,
            graph: None,
            confusion_network: None,
        };
        if self.config.word_graph || self.config.confusion_network {
            let graph = WordGraph::build(&out.seeds, frames);
            for sentence in result.sentences.iter_mut() {
                sentence.confidence = sentence_confidence(&graph, sentence);
            }
            if self.config.confusion_network {
                result.confusion_network = Some(ConfusionNetwork::build(
                    &graph,
                    self.config.cn_merge_threshold,
                ));
            }
            if self.config.word_graph {
                result.graph = Some(graph);
            }
        }
        Ok(result)
    }
}

/// Sentence confidence: the lowest graph posterior among its words, the weakest-link reading.
fn sentence_confidence(graph: &WordGraph, sentence: &SentenceResult) -> Option<f32> {
    let mut worst: Option<f32> = None;
    for w in &sentence.words {
        let node = graph
            .nodes
            .iter()
            .find(|n| n.word == w.word && n.begin == w.begin && n.end == w.end)?;
        worst = Some(match worst {
            Some(v) => v.min(node.posterior),
            None => node.posterior,
        });
    }
    worst
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MergeMode;
    use crate::features::{BaseKind, ParamKind};
    use crate::lm::Direction;
    use crate::ngram::NGramBuilder;
    use crate::pass1::tests::{toy_am, uniform_unigram};
    use std::io::Cursor;

    fn features(values: &[f32]) -> FeatureSet {
        let mut f = FeatureSet::new(ParamKind::new(BaseKind::User, 0), 1);
        for &v in values {
            f.push_frame(&[v]);
        }
        f
    }

    fn digit_engine(nbest: usize) -> Engine {
        let am = toy_am(&[("s", 0.0), ("w", 2.0), ("t", 4.0), ("th", 6.0)]);
        let dict = "one [one] w\ntwo [two] t\nthree [three] th\n";
        let voca = Vocabulary::from_reader(Cursor::new(dict), "d").unwrap();
        let lm = uniform_unigram(&["one", "two", "three"]);
        let mut cfg = DecoderConfig::default();
        cfg.nbest = nbest;
        cfg.merge_mode = MergeMode::WordPair;
        Engine::from_parts(cfg, am, None, voca, LmKind::NGram(lm)).unwrap()
    }

    /// Isolated word: silence-ish lead-in followed by the "two" phone; top-1 must be "two"
    /// and the AM score must equal the sum of per-frame scores along that path.
    #[test]
    fn isolated_word() {
        let mut engine = digit_engine(1);
        let mut values = vec![4.0; 8];
        values.splice(0..0, std::iter::repeat(3.9).take(2));
        engine.open_features(features(&values));
        let result = engine.recognize_one_utterance().unwrap();
        assert_eq!(result.status, RecognitionStatus::Success);
        let s = &result.sentences[0];
        assert_eq!(engine.vocabulary().word(s.words[0].word).output, "two");
        // exact re-aligned AM score: all frames on the single "t" state
        let am_frame = |x: f32| -0.5 * ((2.0 * std::f32::consts::PI).ln() + (x - 4.0) * (x - 4.0));
        let expect: f32 = values.iter().map(|&v| am_frame(v)).sum::<f32>()
            + 9.0 * 0.6f32.ln()
            + 0.4f32.ln();
        assert!(
            (s.words[0].am_score - expect).abs() < 1e-2,
            "{} vs {}",
            s.words[0].am_score,
            expect
        );
    }

    /// Grammar enforcement: the acoustics say "maybe" but only yes/no are in the grammar.
    #[test]
    fn grammar_keeps_out_unknown_words() {
        // phones: y≈1, n≈-1, m≈5. "maybe" isn't in the dictionary at all.
        let am = toy_am(&[("y", 1.0), ("n", -1.0), ("m", 5.0)]);
        let dict = "0 [yes] y\n0 [no] n\n";
        let voca = Vocabulary::from_reader(Cursor::new(dict), "d").unwrap();
        let dfa = DfaGrammar::from_reader(Cursor::new("0 1 0 0 1\n1 -1 -1 1 0\n"), "g").unwrap();
        let mut cfg = DecoderConfig::default();
        cfg.merge_mode = MergeMode::WordPair;
        let mut engine =
            Engine::from_parts(cfg, am, None, voca, LmKind::Grammar(dfa)).unwrap();
        engine.open_features(features(&[5.0, 5.0, 5.0, 5.0]));
        let result = engine.recognize_one_utterance().unwrap();
        assert_eq!(result.status, RecognitionStatus::Success);
        let text = engine
            .vocabulary()
            .word(result.sentences[0].words[0].word)
            .output
            .clone();
        assert!(text == "yes" || text == "no");
    }

    /// Same bigram expressed forward and reverse gives the same top-1 text.
    #[test]
    fn forward_and_reverse_bigram_agree() {
        let am = toy_am(&[("p", 3.0), ("q", -3.0)]);
        let dict = "a [a] p\nb [b] q\nc [c] q\n";
        let build = |dir: Direction| {
            let mut b = NGramBuilder::new(2, dir);
            let ids: Vec<_> = ["a", "b", "c"].iter().map(|w| b.intern(w)).collect();
            let (a, bb, c) = (ids[0], ids[1], ids[2]);
            b.add(0, vec![a], 0.4f32.ln(), 0.0);
            b.add(0, vec![bb], 0.36f32.ln(), 0.0);
            b.add(0, vec![c], 0.24f32.ln(), 0.0);
            // forward reading: P(b|a) > P(c|a); the reverse file stores P(a|following)
            match dir {
                Direction::Forward => {
                    b.add(1, vec![a, bb], 0.6f32.ln(), 0.0);
                    b.add(1, vec![a, c], 0.4f32.ln(), 0.0);
                }
                Direction::Reverse => {
                    // P_rev(a | b) = P(b|a) P(a) / P(b), P_rev(a | c) likewise
                    b.add(1, vec![bb, a], (0.6f32 * 0.4 / 0.36).ln(), 0.0);
                    b.add(1, vec![c, a], (0.4f32 * 0.4 / 0.24).ln(), 0.0);
                }
            }
            b.build().unwrap()
        };
        let frames = [3.0f32, 3.0, 3.0, -3.0, -3.0, -3.0];
        let mut texts = Vec::new();
        for dir in [Direction::Forward, Direction::Reverse] {
            let voca = Vocabulary::from_reader(Cursor::new(dict), "d").unwrap();
            let mut cfg = DecoderConfig::default();
            cfg.merge_mode = MergeMode::WordPair;
            let mut engine = Engine::from_parts(
                cfg,
                am.clone(),
                None,
                voca,
                LmKind::NGram(build(dir)),
            )
            .unwrap();
            engine.open_features(features(&frames));
            let result = engine.recognize_one_utterance().unwrap();
            assert_eq!(result.status, RecognitionStatus::Success);
            let text: Vec<String> = result.sentences[0]
                .words
                .iter()
                .map(|w| engine.vocabulary().word(w.word).output.clone())
                .collect();
            texts.push(text.join(" "));
        }
        assert_eq!(texts[0], texts[1]);
        assert_eq!(texts[0], "a b");
    }

    /// Pause mid-decode then resume: same result as an uninterrupted run.
    #[test]
    fn pause_resume_is_transparent() {
        let run = |pause: bool| {
            let mut engine = digit_engine(1);
            engine.open_features(features(&vec![4.0; 30]));
            if pause {
                let control = engine.control();
                control.request_pause();
                let resumer = std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(30));
                    control.request_resume();
                });
                let r = engine.recognize_one_utterance().unwrap();
                resumer.join().unwrap();
                r
            } else {
                engine.recognize_one_utterance().unwrap()
            }
        };
        let plain = run(false);
        let paused = run(true);
        assert_eq!(plain.status, paused.status);
        assert_eq!(plain.sentences[0].words.len(), paused.sentences[0].words.len());
        assert_eq!(
            plain.sentences[0].score.to_bits(),
            paused.sentences[0].score.to_bits()
        );
    }

    /// Terminate abandons the utterance, and the next run behaves like a fresh engine.
    #[test]
    fn terminate_then_reset_is_idempotent() {
        let mut engine = digit_engine(1);
        engine.open_features(features(&vec![4.0; 10]));
        engine.control().request_terminate();
        let aborted = engine.recognize_one_utterance().unwrap();
        assert_eq!(aborted.status, RecognitionStatus::Terminated);
        assert!(aborted.sentences.is_empty());

        engine.open_features(features(&vec![4.0; 10]));
        let second = engine.recognize_one_utterance().unwrap();

        let mut fresh = digit_engine(1);
        fresh.open_features(features(&vec![4.0; 10]));
        let reference = fresh.recognize_one_utterance().unwrap();
        assert_eq!(second.status, reference.status);
        assert_eq!(
            second.sentences[0].score.to_bits(),
            reference.sentences[0].score.to_bits()
        );
    }

    /// A pronunciation whose triphone context was never trained falls back to the pooled
    /// pseudo model and still decodes to a non-empty result.
    #[test]
    fn unseen_triphone_falls_back_to_pseudo() {
        use crate::hmm_parse::ModelBuilder;
        let mut b = ModelBuilder::new();
        b.parse_hmmdefs_text(crate::hmm_parse::SMALL_HMMDEFS, "t").unwrap();
        // only one trained triphone of "a"; anything else must pool
        b.parse_hmmlist_reader(Cursor::new("b-a+b a\n"), "l").unwrap();
        let am = b.build().unwrap();
        // "x" and "y" are unknown contexts: b-a+b resolves exactly, x-a+y through the pools
        let dict = "seen [seen] b-a+b\nunseen [unseen] x-a+y\n";
        let voca = Vocabulary::from_reader(Cursor::new(dict), "d").unwrap();
        let lm = uniform_unigram(&["seen", "unseen"]);
        let mut cfg = DecoderConfig::default();
        cfg.merge_mode = MergeMode::WordPair;
        cfg.nbest = 2;
        let mut engine = Engine::from_parts(cfg, am, None, voca, LmKind::NGram(lm)).unwrap();
        let mut f = FeatureSet::new(ParamKind::from_code(6).unwrap(), 2);
        for _ in 0..6 {
            f.push_frame(&[1.0, 0.2]);
        }
        engine.open_features(f);
        let result = engine.recognize_one_utterance().unwrap();
        assert_eq!(result.status, RecognitionStatus::Success);
        assert!(!result.sentences[0].words.is_empty());
        // both words share the underlying states, so both spellings must be decodable
        assert_eq!(result.sentences.len(), 2);
        let am_diff = (result.sentences[0].words[0].am_score
            - result.sentences[1].words[0].am_score)
            .abs();
        assert!(am_diff < 1e-3, "pseudo and seen AM scores diverge: {}", am_diff);
    }

    #[test]
    fn empty_input_reports_no_result() {
        let mut engine = digit_engine(1);
        engine.open_features(features(&[]));
        let result = engine.recognize_one_utterance().unwrap();
        assert_eq!(result.status, RecognitionStatus::NoResult);
        assert_eq!(result.frames, 0);
    }

    #[test]
    fn kind_mismatch_is_a_decode_error_not_fatal() {
        let mut engine = digit_engine(1);
        let mut f = FeatureSet::new(ParamKind::new(BaseKind::Mfcc, 0), 1);
        f.push_frame(&[1.0]);
        engine.open_features(f);
        let result = engine.recognize_one_utterance().unwrap();
        assert_eq!(result.status, RecognitionStatus::NoResult);
        // the engine is still usable afterwards
        engine.open_features(features(&[4.0, 4.0, 4.0]));
        assert_eq!(
            engine.recognize_one_utterance().unwrap().status,
            RecognitionStatus::Success
        );
    }

    #[test]
    fn no_stream_is_an_error() {
        let mut engine = digit_engine(1);
        assert!(engine.recognize_one_utterance().is_err());
    }

    #[test]
    fn graph_and_confusion_network_outputs() {
        let am = toy_am(&[("p", 3.0), ("q", -3.0)]);
        let dict = "a [a] p\nb [b] q\nc [c] q\n";
        let voca = Vocabulary::from_reader(Cursor::new(dict), "d").unwrap();
        let lm = uniform_unigram(&["a", "b", "c"]);
        let mut cfg = DecoderConfig::default();
        cfg.nbest = 3;
        cfg.merge_mode = MergeMode::WordPair;
        cfg.word_graph = true;
        cfg.confusion_network = true;
        let mut engine = Engine::from_parts(cfg, am, None, voca, LmKind::NGram(lm)).unwrap();
        engine.open_features(features(&[3.0, 3.0, -3.0, -3.0]));
        let result = engine.recognize_one_utterance().unwrap();
        assert_eq!(result.status, RecognitionStatus::Success);
        let graph = result.graph.as_ref().unwrap();
        assert!(!graph.nodes.is_empty());
        let cn = result.confusion_network.as_ref().unwrap();
        assert!(!cn.clusters.is_empty());
        // b and c are acoustically identical: both should appear in the graph
        let words: Vec<u32> = graph.nodes.iter().map(|n| n.word).collect();
        assert!(words.contains(&1) && words.contains(&2));
        assert!(result.sentences[0].confidence.is_some());
    }

    #[test]
    fn grammar_reload_waits_for_the_boundary() {
        let am = toy_am(&[("y", 1.0), ("n", -1.0)]);
        let dict = "0 [yes] y\n1 [no] n\n";
        let voca = Vocabulary::from_reader(Cursor::new(dict), "d").unwrap();
        let dfa =
            DfaGrammar::from_reader(Cursor::new("0 1 0 0 1\n0 1 1 0 1\n1 -1 -1 1 0\n"), "g")
                .unwrap();
        let mut cfg = DecoderConfig::default();
        cfg.merge_mode = MergeMode::WordPair;
        let mut engine =
            Engine::from_parts(cfg, am, None, voca, LmKind::Grammar(dfa)).unwrap();

        // swap to a grammar that only allows "no"
        let only_no = DfaGrammar::from_reader(Cursor::new("0 1 1 0 1\n1 -1 -1 1 0\n"), "g2")
            .unwrap();
        let dict2 = Vocabulary::from_reader(Cursor::new("0 [yes] y\n1 [no] n\n"), "d").unwrap();
        engine.reload_grammar(only_no, dict2);

        // acoustics prefer "yes", but the swapped-in grammar forbids it
        engine.open_features(features(&[1.0, 1.0, 1.0]));
        let result = engine.recognize_one_utterance().unwrap();
        assert_eq!(result.status, RecognitionStatus::Success);
        assert_eq!(
            engine
                .vocabulary()
                .word(result.sentences[0].words[0].word)
                .output,
            "no"
        );
    }
}
