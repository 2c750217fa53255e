//! Runtime configuration for the decoder. Everything here can come from a JSON file so that
//! experiments don't need a recompile, and every field has a default that matches the common
//! large-vocabulary setup. The search parameters are the usual speed/accuracy trade-offs: a wider
//! beam or envelope explores more of the lexicon tree per frame, a bigger stack budget lets the
//! second pass rescue more alternatives.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::ModelError;

/// How hypotheses landing on the same lexicon-tree node are merged in the first pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Keep only the single best token per node.
    #[default]
    OneBest,
    /// Keep one token per (node, previous word) pair. Slower but the trellis keeps enough
    /// context variety for the second pass to reorder words reliably.
    WordPair,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// First-pass beam width in log-probability. Tokens scoring worse than the frame best minus
    /// this are pruned.
    pub beam_width: f32,
    /// Hard cap on live tokens per frame. When exceeded the pruning floor is raised until the
    /// population fits.
    pub beam_envelope: usize,
    /// Token merge behaviour at tree nodes.
    pub merge_mode: MergeMode,

    /// Language model log-probabilities are scaled by this before being added to acoustic
    /// scores.
    pub lm_weight: f32,
    /// Flat per-word insertion penalty, added at every word end.
    pub lm_penalty: f32,

    /// Number of Gaussians kept per mixture evaluation. 0 disables pruning.
    pub gprune_num: usize,
    /// Score caches grow in blocks of this many frames.
    pub cache_block_frames: usize,

    /// How many sentence hypotheses the second pass should produce.
    pub nbest: usize,
    /// Per-hypothesis expansion fan-out cap in the second pass.
    pub stack_fanout: usize,
    /// Total number of stack pops before the second pass gives up with partial results.
    pub stack_pop_limit: usize,
    /// Hypotheses scoring worse than the best complete sentence minus this are discarded.
    pub stack_beam: f32,

    /// Emit a word graph alongside the N-best list.
    pub word_graph: bool,
    /// Cluster the word graph into a confusion network.
    pub confusion_network: bool,
    /// Maximum normalised inter-cluster distance at which confusion-network clusters merge.
    pub cn_merge_threshold: f32,

    /// Threads for DNN output-layer row parallelism. 0 or 1 means single threaded.
    pub dnn_threads: usize,

    /// Fail the whole lexicon load when a word references an unknown phone, instead of
    /// skipping the word.
    pub strict_vocabulary: bool,
    /// Drop runs of frames whose leading coefficients sit in a narrow dead band. Off unless
    /// explicitly requested; see [`crate::features::strip_zero_frames`].
    pub strip_zero: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            beam_width: 230.0,
            beam_envelope: 8000,
            merge_mode: MergeMode::OneBest,
            lm_weight: 1.0,
            lm_penalty: 0.0,
            gprune_num: 10,
            cache_block_frames: 100,
            nbest: 1,
            stack_fanout: 30,
            stack_pop_limit: 2000,
            stack_beam: 120.0,
            word_graph: false,
            confusion_network: false,
            cn_merge_threshold: 0.4,
            dnn_threads: 0,
            strict_vocabulary: false,
            strip_zero: false,
        }
    }
}

impl DecoderConfig {
    /// Reads a configuration from a JSON file. Missing fields take their defaults so config
    /// files only need to state what they change.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ModelError::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| ModelError::Malformed {
            what: "config",
            msg: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_takes_defaults() {
        let cfg: DecoderConfig =
            serde_json::from_str(r#"{"beam_width": 100.0, "merge_mode": "word_pair"}"#).unwrap();
        assert_eq!(cfg.beam_width, 100.0);
        assert_eq!(cfg.merge_mode, MergeMode::WordPair);
        assert_eq!(cfg.nbest, DecoderConfig::default().nbest);
        assert_eq!(cfg.gprune_num, DecoderConfig::default().gprune_num);
    }

    #[test]
    fn round_trips_through_json() {
        let mut cfg = DecoderConfig::default();
        cfg.nbest = 5;
        cfg.word_graph = true;
        let text = serde_json::to_string(&cfg).unwrap();
        let back: DecoderConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.nbest, 5);
        assert!(back.word_graph);
    }
}
