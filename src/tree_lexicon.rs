//! The prefix-shared tree over the vocabulary that pass 1 searches. Words sharing an initial
//! phone sequence share the corresponding arcs, so the few thousand states near the root carry
//! most of the beam instead of every word paying its own way. Each arc is one phone in
//! word-internal triphone context; the first arc of every word keeps a variant table per
//! possible *left* (cross-word) context, and the last arc leaves its right context open by
//! resolving to the pooled pseudo model, since the following word is unknown during the first
//! pass.
//!
//! Every node carries the factoring score: the best language-model bound over all words
//! reachable through it. A token pays the difference in factoring as it descends and settles
//! the exact word score when it reaches a word end, so LM knowledge arrives as early as the
//! tree can provide it without ever underestimating.
use ahash::AHashMap;
use tracing::info;

use crate::error::ModelError;
use crate::hmm::{add_left_context, center_name, AcousticModel, PhoneModel};
use crate::lexicon::{Vocabulary, WordId};
use crate::lm::{LangModel, LmId, LM_INVALID};
use crate::logprob::{LogProb, LOG_ZERO};

pub type NodeId = u32;
pub const ROOT: NodeId = 0;

/// What an arc resolves to acoustically.
#[derive(Clone, Debug)]
pub enum ArcModel {
    /// Word-internal arc with full context known at build time.
    Fixed(PhoneModel),
    /// Word-initial arc: the left context depends on the preceding word. `variants` is keyed
    /// by the preceding centre phone; `default` is the open-context pseudo model.
    Head {
        variants: AHashMap<String, PhoneModel>,
        default: PhoneModel,
    },
}

#[derive(Clone, Debug)]
pub struct TreeNode {
    /// `None` only at the root.
    pub arc: Option<ArcModel>,
    pub children: Vec<NodeId>,
    /// LM factoring bound over every word reachable through this node.
    pub factor: LogProb,
    /// Words whose pronunciation ends on this arc. Homophones share the path and both appear
    /// here.
    pub word_ends: Vec<WordId>,
}

pub struct TreeLexicon {
    nodes: Vec<TreeNode>,
    /// LM entry per word (category id in grammar mode, [`LM_INVALID`] when out of vocabulary
    /// in a closed LM).
    pub lm_ids: Vec<LmId>,
    /// Centre phone of each word's first / last arc, for cross-word context selection.
    first_phones: Vec<String>,
    last_phones: Vec<String>,
}

impl TreeLexicon {
    /// Builds the tree for a vocabulary against a loaded acoustic model and language model.
    pub fn build(
        voca: &Vocabulary,
        am: &AcousticModel,
        lm: &dyn LangModel,
        grammar_mode: bool,
    ) -> Result<Self, ModelError> {
        let mut nodes = vec![TreeNode {
            arc: None,
            children: Vec::new(),
            factor: LOG_ZERO,
            word_ends: Vec::new(),
        }];
        // arc sharing key per (parent, triphone name)
        let mut edge: AHashMap<(NodeId, String), NodeId> = AHashMap::new();

        // Left contexts a word-initial arc can meet: the final centre phone of every word.
        let mut left_contexts: Vec<String> = voca
            .iter()
            .map(|(_, w)| center_name(w.phones.last().unwrap()).to_string())
            .collect();
        left_contexts.sort_unstable();
        left_contexts.dedup();

        let mut lm_ids = Vec::with_capacity(voca.len());
        let mut first_phones = Vec::with_capacity(voca.len());
        let mut last_phones = Vec::with_capacity(voca.len());

        for (wid, word) in voca.iter() {
            let lm_id = if grammar_mode {
                word.category
            } else {
                match lm.entry_id(&word.name).or_else(|| lm.unknown_id()) {
                    Some(id) => id,
                    None => LM_INVALID,
                }
            };
            lm_ids.push(lm_id);
            first_phones.push(center_name(&word.phones[0]).to_string());
            last_phones.push(center_name(word.phones.last().unwrap()).to_string());

            let names = word_arc_names(&word.phones);
            let mut at = ROOT;
            for (i, name) in names.iter().enumerate() {
                let key = (at, name.clone());
                let next = match edge.get(&key) {
                    Some(&n) => n,
                    None => {
                        let arc = if i == 0 {
                            build_head_arc(am, name, &left_contexts).ok_or_else(|| {
                                ModelError::UnknownPhone {
                                    word: word.name.clone(),
                                    phone: name.clone(),
                                }
                            })?
                        } else {
                            ArcModel::Fixed(am.resolve(name).ok_or_else(|| {
                                ModelError::UnknownPhone {
                                    word: word.name.clone(),
                                    phone: name.clone(),
                                }
                            })?)
                        };
                        let id = nodes.len() as NodeId;
                        nodes.push(TreeNode {
                            arc: Some(arc),
                            children: Vec::new(),
                            factor: LOG_ZERO,
                            word_ends: Vec::new(),
                        });
                        nodes[at as usize].children.push(id);
                        edge.insert(key, id);
                        id
                    }
                };
                at = next;
            }
            nodes[at as usize].word_ends.push(wid);
        }

        let mut tree = Self {
            nodes,
            lm_ids,
            first_phones,
            last_phones,
        };
        tree.refresh_factoring(voca, lm);
        info!(
            "tree lexicon: {} nodes for {} words",
            tree.nodes.len(),
            voca.len()
        );
        Ok(tree)
    }

    /// Recomputes the factoring bounds, e.g. after a grammar swap. Post-order accumulation
    /// keeps every node's bound the max over its subtree, so the bound never increases on the
    /// way down.
    pub fn refresh_factoring(&mut self, voca: &Vocabulary, lm: &dyn LangModel) {
        // iterative post-order over the arena
        let mut order: Vec<NodeId> = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![ROOT];
        while let Some(n) = stack.pop() {
            order.push(n);
            stack.extend_from_slice(&self.nodes[n as usize].children);
        }
        for &n in order.iter().rev() {
            let mut best = LOG_ZERO;
            for &w in &self.nodes[n as usize].word_ends {
                let bound = lm.factor_bound(self.lm_ids[w as usize])
                    + voca.word(w).class_log_prob;
                if bound > best {
                    best = bound;
                }
            }
            for &c in &self.nodes[n as usize].children {
                let f = self.nodes[c as usize].factor;
                if f > best {
                    best = f;
                }
            }
            self.nodes[n as usize].factor = best;
        }
    }

    pub fn node(&self, n: NodeId) -> &TreeNode {
        &self.nodes[n as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn successors(&self, n: NodeId) -> &[NodeId] {
        &self.nodes[n as usize].children
    }

    pub fn is_leaf(&self, n: NodeId) -> bool {
        !self.nodes[n as usize].word_ends.is_empty()
    }

    pub fn word_ends(&self, n: NodeId) -> &[WordId] {
        &self.nodes[n as usize].word_ends
    }

    /// The acoustic model of an arc, selecting the cross-word variant when the node is
    /// word-initial and the previous word's final phone is known.
    pub fn phone_model(&self, n: NodeId, left_context: Option<&str>) -> PhoneModel {
        match self.nodes[n as usize].arc.as_ref().expect("root has no arc") {
            ArcModel::Fixed(m) => *m,
            ArcModel::Head { variants, default } => match left_context {
                Some(lc) => variants.get(lc).copied().unwrap_or(*default),
                None => *default,
            },
        }
    }

    pub fn first_phone(&self, w: WordId) -> &str {
        &self.first_phones[w as usize]
    }

    pub fn last_phone(&self, w: WordId) -> &str {
        &self.last_phones[w as usize]
    }
}

/// Word-internal triphone names for a pronunciation: the first arc leaves its left context
/// open, the last its right context, and single-phone words leave both.
fn word_arc_names(phones: &[String]) -> Vec<String> {
    let n = phones.len();
    (0..n)
        .map(|i| {
            let c = center_name(&phones[i]);
            match (i > 0, i + 1 < n) {
                (false, false) => c.to_string(),
                (false, true) => format!("{}+{}", c, center_name(&phones[i + 1])),
                (true, false) => format!("{}-{}", center_name(&phones[i - 1]), c),
                (true, true) => format!(
                    "{}-{}+{}",
                    center_name(&phones[i - 1]),
                    c,
                    center_name(&phones[i + 1])
                ),
            }
        })
        .collect()
}

fn build_head_arc(
    am: &AcousticModel,
    open_name: &str,
    left_contexts: &[String],
) -> Option<ArcModel> {
    let default = am.resolve(open_name)?;
    let mut variants = AHashMap::new();
    for lc in left_contexts {
        let full = add_left_context(open_name, lc);
        if let Some(m) = am.resolve(&full) {
            if m != default {
                variants.insert(lc.clone(), m);
            }
        }
    }
    Some(ArcModel::Head { variants, default })
}

/// Concrete phone model sequence for one word with explicit cross-word contexts, used by the
/// second pass for exact re-alignment. Either context may be unknown, in which case the open
/// pseudo model stands in.
pub fn word_phone_models(
    am: &AcousticModel,
    voca: &Vocabulary,
    w: WordId,
    left_context: Option<&str>,
    right_context: Option<&str>,
) -> Result<Vec<PhoneModel>, ModelError> {
    let word = voca.word(w);
    let phones = &word.phones;
    let n = phones.len();
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let c = center_name(&phones[i]);
        let left = if i > 0 {
            Some(center_name(&phones[i - 1]))
        } else {
            left_context
        };
        let right = if i + 1 < n {
            Some(center_name(&phones[i + 1]))
        } else {
            right_context
        };
        let name = match (left, right) {
            (Some(l), Some(r)) => format!("{}-{}+{}", l, c, r),
            (Some(l), None) => format!("{}-{}", l, c),
            (None, Some(r)) => format!("{}+{}", c, r),
            (None, None) => c.to_string(),
        };
        out.push(am.resolve(&name).ok_or_else(|| ModelError::UnknownPhone {
            word: word.name.clone(),
            phone: name,
        })?);
    }
    Ok(out)
}
