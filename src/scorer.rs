//! Per-frame acoustic scoring. The search layers above ask one question, over and over:
//! "what is log P(x_t | state)?", tens of thousands of times per frame once the beam widens.
//! Two caches keep that affordable: a state-level cache so a state shared by many lexicon arcs
//! is evaluated once per frame, and a Gaussian-level cache underneath it so mixtures sharing
//! codebook Gaussians don't recompute densities. Both caches grow in fixed frame blocks to keep
//! allocation out of the frame loop.
//!
//! Large codebooks additionally get Gaussian pruning: only the best K densities take part in the
//! weighted sum. The evaluation keeps a small sorted buffer; once K candidates are present, any
//! Gaussian whose partial distance already falls below the current worst is abandoned mid-sum.
//!
//! The scorer owns the utterance's feature frames. Asking for a frame that has not arrived yet
//! returns [`LOG_ZERO`] rather than blocking, which is what lets streaming callers poll.
use tracing::debug;

use crate::dnn::DnnModel;
use crate::error::ModelError;
use crate::features::{FeatureSet, ParamKind};
use crate::hmm::{AcousticModel, StatePdf, StateRef};
use crate::logprob::{add_log_array, LogProb, LOG_ZERO};

/// Cache slot sentinel: no score is ever positive, so +inf marks "not yet computed".
const UNCACHED: f32 = f32::INFINITY;

pub struct Scorer<'a> {
    model: &'a AcousticModel,
    dnn: Option<&'a DnnModel>,
    features: FeatureSet,
    gprune_num: usize,
    block_frames: usize,
    /// `state_cache[t][state]`, rows allocated lazily per block.
    state_cache: Vec<Option<Box<[f32]>>>,
    /// `gauss_cache[t][gaussian]`.
    gauss_cache: Vec<Option<Box<[f32]>>>,
    /// Per-frame DNN senone scores.
    dnn_cache: Vec<Option<Vec<f32>>>,
    /// Scratch for the top-K evaluation: (density, component index), sorted best first.
    topk_score: Vec<f32>,
    topk_comp: Vec<usize>,
}

impl<'a> Scorer<'a> {
    pub fn new(
        model: &'a AcousticModel,
        dnn: Option<&'a DnnModel>,
        gprune_num: usize,
        block_frames: usize,
    ) -> Self {
        Self {
            model,
            dnn,
            features: FeatureSet::new(model.param_kind, model.dim),
            gprune_num,
            block_frames: block_frames.max(1),
            state_cache: Vec::new(),
            gauss_cache: Vec::new(),
            dnn_cache: Vec::new(),
            topk_score: Vec::new(),
            topk_comp: Vec::new(),
        }
    }

    /// Starts a new utterance: checks the input kind against the model and drops all cached
    /// scores and frames from the previous one.
    pub fn begin_utterance(&mut self, kind: ParamKind, dim: usize) -> Result<(), ModelError> {
        if !self.model.param_kind.matches(kind) {
            return Err(ModelError::ParameterKindMismatch {
                model: self.model.param_kind.to_string(),
                input: kind.to_string(),
            });
        }
        if dim != self.model.dim {
            return Err(ModelError::VectorLength {
                expected: self.model.dim,
                got: dim,
            });
        }
        self.features = FeatureSet::new(self.model.param_kind, self.model.dim);
        self.state_cache.clear();
        self.gauss_cache.clear();
        self.dnn_cache.clear();
        Ok(())
    }

    pub fn push_frame(&mut self, frame: &[f32]) {
        self.features.push_frame(frame);
    }

    pub fn num_frames(&self) -> usize {
        self.features.len()
    }

    pub fn frame(&self, t: usize) -> Option<&[f32]> {
        self.features.frame(t)
    }

    /// Output log-probability of `state` at frame `t`. Pooled (pseudo model) positions take the
    /// best candidate. Frames beyond the input give [`LOG_ZERO`].
    pub fn score(&mut self, t: usize, state: StateRef) -> LogProb {
        if t >= self.features.len() {
            return LOG_ZERO;
        }
        match state {
            StateRef::Single(id) => self.score_state(t, id),
            StateRef::Pooled { cdset, position } => {
                let candidates =
                    self.model.cdsets[cdset as usize].state_sets[position as usize].clone();
                let mut best = LOG_ZERO;
                for sid in candidates {
                    let s = self.score_state(t, sid);
                    if s > best {
                        best = s;
                    }
                }
                best
            }
        }
    }

    fn ensure_row(
        rows: &mut Vec<Option<Box<[f32]>>>,
        t: usize,
        width: usize,
        block: usize,
    ) -> &mut [f32] {
        if t >= rows.len() {
            let grown = (t / block + 1) * block;
            rows.resize_with(grown, || None);
        }
        rows[t].get_or_insert_with(|| vec![UNCACHED; width].into_boxed_slice())
    }

    pub fn score_state(&mut self, t: usize, state: u32) -> LogProb {
        let width = self.model.states.len();
        let row = Self::ensure_row(&mut self.state_cache, t, width, self.block_frames);
        let cached = row[state as usize];
        if cached != UNCACHED {
            return cached;
        }
        let value = match &self.model.states[state as usize].pdf {
            StatePdf::Gmm {
                log_weights,
                gaussians,
            } => {
                // cloned: the mixture evaluation takes &mut self for the Gaussian cache
                let (log_weights, gaussians) = (log_weights.clone(), gaussians.clone());
                self.score_mixture(t, &log_weights, &gaussians)
            }
            StatePdf::Dnn { senone } => {
                let senone = *senone as usize;
                self.dnn_frame(t)[senone]
            }
        };
        let row = Self::ensure_row(&mut self.state_cache, t, width, self.block_frames);
        row[state as usize] = value;
        value
    }

    /// Weighted mixture sum with top-K Gaussian pruning.
    fn score_mixture(&mut self, t: usize, log_weights: &[f32], gaussians: &[u32]) -> LogProb {
        let k = if self.gprune_num == 0 {
            gaussians.len()
        } else {
            self.gprune_num.min(gaussians.len())
        };
        self.topk_score.clear();
        self.topk_comp.clear();

        let x = self.features.frame(t).expect("frame bounds checked").to_vec();
        let width = self.model.gaussians.len();
        for (comp, &gid) in gaussians.iter().enumerate() {
            let row = Self::ensure_row(&mut self.gauss_cache, t, width, self.block_frames);
            let cached = row[gid as usize];
            let density = if cached != UNCACHED {
                cached
            } else {
                let g = &self.model.gaussians[gid as usize];
                let full = self.topk_score.len() == k;
                let d = if full {
                    // Already have K candidates: abandon this one as soon as its partial sum
                    // falls below the current worst kept density.
                    let floor = *self.topk_score.last().unwrap();
                    g.log_density_pruned(&x, floor).unwrap_or(LOG_ZERO)
                } else {
                    g.log_density(&x)
                };
                let row = Self::ensure_row(&mut self.gauss_cache, t, width, self.block_frames);
                row[gid as usize] = d;
                d
            };
            self.topk_push(density, comp, k);
        }

        let mut weighted = Vec::with_capacity(self.topk_score.len());
        for (i, &d) in self.topk_score.iter().enumerate() {
            if d <= LOG_ZERO {
                continue;
            }
            weighted.push(d + log_weights[self.topk_comp[i]]);
        }
        if weighted.is_empty() {
            return LOG_ZERO;
        }
        add_log_array(&weighted)
    }

    /// Inserts into the sorted top-K buffer, best first. Ties keep insertion order so results
    /// are deterministic across runs.
    fn topk_push(&mut self, score: f32, comp: usize, k: usize) {
        let len = self.topk_score.len();
        if len > 0 && self.topk_score[len - 1] >= score {
            // below (or tied with) the current bottom
            if len < k {
                self.topk_score.push(score);
                self.topk_comp.push(comp);
            }
            return;
        }
        let insert = if len == 0 || self.topk_score[0] < score {
            0
        } else {
            // first position whose value is <= score
            self.topk_score.partition_point(|&v| v > score)
        };
        self.topk_score.insert(insert, score);
        self.topk_comp.insert(insert, comp);
        if self.topk_score.len() > k {
            self.topk_score.pop();
            self.topk_comp.pop();
        }
    }

    /// Per-frame DNN senone vector, computed once and cached.
    fn dnn_frame(&mut self, t: usize) -> &[f32] {
        if t >= self.dnn_cache.len() {
            let grown = (t / self.block_frames + 1) * self.block_frames;
            self.dnn_cache.resize_with(grown, || None);
        }
        if self.dnn_cache[t].is_none() {
            let dnn = self
                .dnn
                .expect("DNN state pdf requires a network to be bound");
            let features = &self.features;
            let len = features.len();
            let lookup = |i: isize| features.frame(i as usize).map(|f| f.to_vec());
            let scores = dnn.score_frame(&lookup, t, len);
            debug!("DNN frame {} evaluated ({} senones)", t, scores.len());
            self.dnn_cache[t] = Some(scores);
        }
        self.dnn_cache[t].as_deref().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmm::{Gaussian, HmmState, PhysicalHmm};
    use crate::features::BaseKind;
    use ahash::AHashMap;

    fn gauss(mean: f32) -> Gaussian {
        Gaussian {
            mean: vec![mean, mean],
            inv_var: vec![1.0, 1.0],
            gconst: 2.0 * (2.0 * std::f32::consts::PI).ln(),
        }
    }

    /// Model with one 4-component mixture state over shared Gaussians.
    fn mixture_model() -> AcousticModel {
        let gaussians = vec![gauss(0.0), gauss(1.0), gauss(2.0), gauss(10.0)];
        let states = vec![HmmState {
            pdf: StatePdf::Gmm {
                log_weights: vec![0.25f32.ln(); 4],
                gaussians: vec![0, 1, 2, 3],
            },
        }];
        AcousticModel {
            param_kind: ParamKind::new(BaseKind::User, 0),
            dim: 2,
            gaussians,
            states,
            phys: vec![PhysicalHmm {
                name: "p".into(),
                nstate: 3,
                states: vec![0],
                trans: vec![LOG_ZERO; 9],
            }],
            cdsets: Vec::new(),
            logical: AHashMap::new(),
            senone_count: 0,
        }
    }

    #[test]
    fn unpruned_matches_direct_sum() {
        let model = mixture_model();
        let mut scorer = Scorer::new(&model, None, 0, 4);
        scorer
            .begin_utterance(model.param_kind, 2)
            .unwrap();
        scorer.push_frame(&[0.5, 0.5]);

        let got = scorer.score(0, StateRef::Single(0));
        let x = [0.5f32, 0.5];
        let parts: Vec<f32> = model
            .gaussians
            .iter()
            .map(|g| g.log_density(&x) + 0.25f32.ln())
            .collect();
        let expect = add_log_array(&parts);
        assert!((got - expect).abs() < 1e-3, "{} vs {}", got, expect);
    }

    #[test]
    fn pruned_keeps_top_k() {
        let model = mixture_model();
        let mut full = Scorer::new(&model, None, 0, 4);
        full.begin_utterance(model.param_kind, 2).unwrap();
        full.push_frame(&[0.5, 0.5]);
        let exact = full.score(0, StateRef::Single(0));

        let mut pruned = Scorer::new(&model, None, 2, 4);
        pruned.begin_utterance(model.param_kind, 2).unwrap();
        pruned.push_frame(&[0.5, 0.5]);
        let approx = pruned.score(0, StateRef::Single(0));

        // The far-away component (mean 10) contributes ~nothing; top-2 keeps the result close
        // but never above the exact sum.
        assert!(approx <= exact + 1e-4);
        assert!((approx - exact).abs() < 0.2, "{} vs {}", approx, exact);
    }

    #[test]
    fn cache_is_consistent_across_calls() {
        let model = mixture_model();
        let mut scorer = Scorer::new(&model, None, 2, 2);
        scorer.begin_utterance(model.param_kind, 2).unwrap();
        scorer.push_frame(&[0.5, 0.5]);
        scorer.push_frame(&[1.5, 1.5]);
        let a1 = scorer.score(0, StateRef::Single(0));
        let a2 = scorer.score(0, StateRef::Single(0));
        assert_eq!(a1, a2);
        let b = scorer.score(1, StateRef::Single(0));
        assert_ne!(a1, b);
    }

    #[test]
    fn pooled_state_takes_the_best_candidate() {
        use crate::hmm::CdSet;
        let mut model = mixture_model();
        // single-Gaussian states around each arena Gaussian
        for gid in 0..4u32 {
            model.states.push(HmmState {
                pdf: StatePdf::Gmm {
                    log_weights: vec![0.0],
                    gaussians: vec![gid],
                },
            });
        }
        model.cdsets.push(CdSet {
            name: "a+?".into(),
            state_sets: vec![vec![1, 2, 3]],
            representative: 0,
        });
        let mut scorer = Scorer::new(&model, None, 0, 4);
        scorer.begin_utterance(model.param_kind, 2).unwrap();
        scorer.push_frame(&[1.0, 1.0]);
        let pooled = scorer.score(
            0,
            StateRef::Pooled {
                cdset: 0,
                position: 0,
            },
        );
        let best = (1..4)
            .map(|s| scorer.score_state(0, s))
            .fold(LOG_ZERO, f32::max);
        assert_eq!(pooled, best);
        // frame sits on the mean-1 Gaussian, so candidate state 2 wins
        assert_eq!(pooled, scorer.score_state(0, 2));
    }

    #[test]
    fn missing_frame_is_log_zero() {
        let model = mixture_model();
        let mut scorer = Scorer::new(&model, None, 0, 4);
        scorer.begin_utterance(model.param_kind, 2).unwrap();
        assert_eq!(scorer.score(0, StateRef::Single(0)), LOG_ZERO);
        scorer.push_frame(&[0.0, 0.0]);
        assert!(scorer.score(0, StateRef::Single(0)) > LOG_ZERO);
        assert_eq!(scorer.score(5, StateRef::Single(0)), LOG_ZERO);
    }

    #[test]
    fn kind_mismatch_refused() {
        let model = mixture_model();
        let mut scorer = Scorer::new(&model, None, 0, 4);
        let wrong = ParamKind::new(BaseKind::Mfcc, 0);
        assert!(scorer.begin_utterance(wrong, 2).is_err());
        assert!(scorer.begin_utterance(model.param_kind, 3).is_err());
    }

    #[test]
    fn reset_clears_previous_utterance() {
        let model = mixture_model();
        let mut scorer = Scorer::new(&model, None, 0, 4);
        scorer.begin_utterance(model.param_kind, 2).unwrap();
        scorer.push_frame(&[0.5, 0.5]);
        let first = scorer.score(0, StateRef::Single(0));
        scorer.begin_utterance(model.param_kind, 2).unwrap();
        assert_eq!(scorer.num_frames(), 0);
        scorer.push_frame(&[0.5, 0.5]);
        assert_eq!(scorer.score(0, StateRef::Single(0)), first);
    }
}
