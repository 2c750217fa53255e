//! Word graph and confusion network generation. The second pass leaves behind every word
//! instance it re-scored; instances agreeing on word identity and frame span merge into one
//! graph node, and the hypothesis adjacencies become edges. A forward-backward sweep in log
//! domain turns the node scores into posterior probabilities, which is what downstream
//! consumers usually want from a graph: not "what scored best" but "how sure was the engine".
//!
//! The confusion network flattens the graph into time slots: same-word nodes merge first, then
//! overlapping clusters combine while their distance stays under the configured threshold.
//! Each slot lists its competing words with posteriors plus the skip entry for the remaining
//! mass, printed as `-`.
use ahash::AHashMap;
use tracing::info;

use crate::lexicon::{Vocabulary, WordId};
use crate::logprob::{add_log, LogProb, LOG_ZERO};
use crate::pass2::GraphSeed;

/// Score scaling applied before exponentiation so posteriors don't collapse to 0/1; raw
/// log-likelihood differences between paths run in the hundreds.
const POSTERIOR_SCALE: f32 = 0.05;

#[derive(Clone, Debug)]
pub struct GraphNode {
    pub word: WordId,
    pub begin: usize,
    pub end: usize,
    pub am_score: LogProb,
    pub lm_score: LogProb,
    pub left: Vec<usize>,
    pub right: Vec<usize>,
    pub posterior: f32,
}

#[derive(Clone, Debug, Default)]
pub struct WordGraph {
    pub nodes: Vec<GraphNode>,
}

impl WordGraph {
    /// Builds the graph from second-pass seeds. Nodes merge on (word, begin, end); adjacency
    /// accumulates from every hypothesis that touched the pair.
    pub fn build(seeds: &[GraphSeed], frames: usize) -> Self {
        let mut index: AHashMap<(WordId, usize, usize), usize> = AHashMap::new();
        let mut nodes: Vec<GraphNode> = Vec::new();
        let mut seed_node = Vec::with_capacity(seeds.len());
        for seed in seeds {
            let key = (seed.word, seed.begin, seed.end);
            let id = *index.entry(key).or_insert_with(|| {
                nodes.push(GraphNode {
                    word: seed.word,
                    begin: seed.begin,
                    end: seed.end,
                    am_score: seed.am_score,
                    lm_score: seed.lm_score,
                    left: Vec::new(),
                    right: Vec::new(),
                    posterior: 0.0,
                });
                nodes.len() - 1
            });
            seed_node.push(id);
        }
        for (i, seed) in seeds.iter().enumerate() {
            if let Some(r) = seed.right {
                let (a, b) = (seed_node[i], seed_node[r]);
                if !nodes[a].right.contains(&b) {
                    nodes[a].right.push(b);
                }
                if !nodes[b].left.contains(&a) {
                    nodes[b].left.push(a);
                }
            }
        }
        let mut graph = Self { nodes };
        graph.compute_posteriors(frames);
        info!("word graph: {} nodes from {} seeds", graph.nodes.len(), seeds.len());
        graph
    }

    /// Forward-backward over the DAG with log-sum-exp, yielding per-node posteriors. Scores
    /// are scaled down first so the soft-max doesn't saturate.
    fn compute_posteriors(&mut self, frames: usize) {
        let n = self.nodes.len();
        if n == 0 || frames == 0 {
            return;
        }
        // topological order: edges always go from earlier to later spans
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_unstable_by_key(|&i| (self.nodes[i].begin, self.nodes[i].end, i));

        let own = |node: &GraphNode| (node.am_score + node.lm_score) * POSTERIOR_SCALE;

        let mut forward = vec![LOG_ZERO; n];
        for &i in &order {
            let node = &self.nodes[i];
            let base = if node.begin == 0 {
                0.0
            } else {
                let mut acc = LOG_ZERO;
                for &l in &node.left {
                    acc = add_log(acc, forward[l]);
                }
                acc
            };
            if base > LOG_ZERO {
                forward[i] = base + own(node);
            }
        }
        let mut backward = vec![LOG_ZERO; n];
        for &i in order.iter().rev() {
            let node = &self.nodes[i];
            let base = if node.end + 1 == frames {
                0.0
            } else {
                let mut acc = LOG_ZERO;
                for &r in &node.right {
                    acc = add_log(acc, backward[r]);
                }
                acc
            };
            if base > LOG_ZERO {
                backward[i] = base + own(node);
            }
        }
        let mut total = LOG_ZERO;
        for &i in &order {
            if self.nodes[i].end + 1 == frames {
                total = add_log(total, forward[i]);
            }
        }
        if total <= LOG_ZERO {
            return;
        }
        for i in 0..n {
            if forward[i] <= LOG_ZERO || backward[i] <= LOG_ZERO {
                continue;
            }
            let own_i = own(&self.nodes[i]);
            let p = (forward[i] + backward[i] - own_i - total).exp();
            self.nodes[i].posterior = p.clamp(0.0, 1.0);
        }
    }
}

/// One slot of a confusion network: competing words with posteriors; `None` is the skip entry.
#[derive(Clone, Debug)]
pub struct CnCluster {
    pub begin: usize,
    pub end: usize,
    pub entries: Vec<(Option<WordId>, f32)>,
}

#[derive(Clone, Debug, Default)]
pub struct ConfusionNetwork {
    pub clusters: Vec<CnCluster>,
}

impl ConfusionNetwork {
    /// Clusters a word graph into a linear network. `merge_threshold` is the maximum distance
    /// at which two overlapping clusters still combine.
    pub fn build(graph: &WordGraph, merge_threshold: f32) -> Self {
        #[derive(Clone)]
        struct Cluster {
            begin: usize,
            end: usize,
            words: Vec<(WordId, f32)>,
        }
        // intra-word step: same word, overlapping spans
        let mut clusters: Vec<Cluster> = Vec::new();
        let mut order: Vec<usize> = (0..graph.nodes.len()).collect();
        order.sort_unstable_by(|&a, &b| {
            graph.nodes[b]
                .posterior
                .total_cmp(&graph.nodes[a].posterior)
                .then(a.cmp(&b))
        });
        for &i in &order {
            let node = &graph.nodes[i];
            if node.posterior <= 0.0 {
                continue;
            }
            let found = clusters.iter_mut().find(|c| {
                overlaps(c.begin, c.end, node.begin, node.end)
                    && c.words.iter().all(|(w, _)| *w == node.word)
            });
            match found {
                Some(c) => {
                    c.begin = c.begin.min(node.begin);
                    c.end = c.end.max(node.end);
                    c.words[0].1 += node.posterior;
                }
                None => clusters.push(Cluster {
                    begin: node.begin,
                    end: node.end,
                    words: vec![(node.word, node.posterior)],
                }),
            }
        }
        // inter-word step: overlapping clusters join while close enough
        clusters.sort_by_key(|c| (c.begin, c.end));
        let mut merged: Vec<Cluster> = Vec::new();
        for c in clusters {
            match merged.last_mut() {
                Some(last) if overlaps(last.begin, last.end, c.begin, c.end) => {
                    let dist = cluster_distance(last.begin, last.end, c.begin, c.end);
                    if dist < merge_threshold {
                        last.begin = last.begin.min(c.begin);
                        last.end = last.end.max(c.end);
                        for (w, p) in c.words {
                            match last.words.iter_mut().find(|(lw, _)| *lw == w) {
                                Some(e) => e.1 += p,
                                None => last.words.push((w, p)),
                            }
                        }
                    } else {
                        merged.push(c);
                    }
                }
                _ => merged.push(c),
            }
        }

        let clusters = merged
            .into_iter()
            .map(|mut c| {
                c.words
                    .sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
                let mass: f32 = c.words.iter().map(|(_, p)| p).sum();
                let mut entries: Vec<(Option<WordId>, f32)> =
                    c.words.into_iter().map(|(w, p)| (Some(w), p)).collect();
                if mass < 1.0 {
                    entries.push((None, 1.0 - mass));
                }
                CnCluster {
                    begin: c.begin,
                    end: c.end,
                    entries,
                }
            })
            .collect();
        Self { clusters }
    }

    /// Renders the network one slot per line, `word:posterior` pairs separated by spaces and
    /// the skip entry as `-`.
    pub fn format(&self, voca: &Vocabulary) -> String {
        let mut out = String::new();
        for c in &self.clusters {
            let mut first = true;
            for (w, p) in &c.entries {
                if !first {
                    out.push(' ');
                }
                first = false;
                match w {
                    Some(w) => out.push_str(&format!("{}:{:.3}", voca.word(*w).output, p)),
                    None => out.push_str(&format!("-:{:.3}", p)),
                }
            }
            out.push('\n');
        }
        out
    }
}

fn overlaps(b1: usize, e1: usize, b2: usize, e2: usize) -> bool {
    b1 <= e2 && b2 <= e1
}

/// Distance between two overlapping spans: 1 minus the overlap fraction of the shorter one.
fn cluster_distance(b1: usize, e1: usize, b2: usize, e2: usize) -> f32 {
    let overlap = (e1.min(e2) + 1).saturating_sub(b1.max(b2)) as f32;
    let shorter = ((e1 - b1 + 1).min(e2 - b2 + 1)) as f32;
    1.0 - overlap / shorter
}
