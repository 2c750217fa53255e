//! Finite-state grammar support. A grammar arrives as two files: the `.dfa` automaton whose arcs
//! are labelled with word *categories*, and a companion dictionary whose first column is the
//! category number each word belongs to. The decoder never walks the automaton during search;
//! instead the category-pair constraint is extracted up front: which category may follow which,
//! which may start a sentence, which may end one. Those tables are all the passes consult.
//!
//! Skippable short-pause categories get special treatment during extraction: a pair reaching
//! across an optional pause is also admissible, while a pause at either sentence edge or two
//! pauses in a row is a grammar error.
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::info;

use crate::error::ModelError;
use crate::lexicon::{Vocabulary, WordId};
use crate::lm::{LangModel, LmId};
use crate::logprob::{LogProb, LOG_ZERO};

#[derive(Clone, Debug)]
struct DfaArc {
    category: u32,
    to: u32,
}

#[derive(Clone, Debug, Default)]
struct DfaState {
    arcs: Vec<DfaArc>,
    accept: bool,
    initial: bool,
}

#[derive(Clone, Debug)]
pub struct DfaGrammar {
    states: Vec<DfaState>,
    n_categories: usize,
    /// Per category: every word in it is an optional pause.
    skippable: Vec<bool>,
    /// cp[left * n + right]: may `right` follow `left`.
    cp: Vec<bool>,
    cp_begin: Vec<bool>,
    cp_end: Vec<bool>,
}

impl DfaGrammar {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| ModelError::io(path, e))?;
        Self::from_reader(BufReader::new(file), &path.display().to_string())
    }

    /// Parses `.dfa` lines: `from to category accept-flag initial-flag`, flags describing the
    /// `from` state. A negative `to` or `category` carries flags for an arc-less state.
    pub fn from_reader(reader: impl BufRead, file: &str) -> Result<Self, ModelError> {
        let mut states: Vec<DfaState> = Vec::new();
        let mut n_categories = 0usize;
        let ensure = |states: &mut Vec<DfaState>, id: usize| {
            if id >= states.len() {
                states.resize_with(id + 1, DfaState::default);
            }
        };
        for (lno, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| ModelError::format(file, lno + 1, e.to_string()))?;
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<i64> = line
                .split_whitespace()
                .map(|t| t.parse::<i64>())
                .collect::<Result<_, _>>()
                .map_err(|_| ModelError::format(file, lno + 1, "non-numeric field"))?;
            if fields.len() != 5 {
                return Err(ModelError::format(
                    file,
                    lno + 1,
                    format!("expected 5 fields, found {}", fields.len()),
                ));
            }
            let from = fields[0] as usize;
            ensure(&mut states, from);
            states[from].accept |= fields[3] != 0;
            states[from].initial |= fields[4] != 0;
            if fields[1] < 0 || fields[2] < 0 {
                continue;
            }
            let to = fields[1] as usize;
            let category = fields[2] as u32;
            ensure(&mut states, to);
            n_categories = n_categories.max(category as usize + 1);
            states[from].arcs.push(DfaArc {
                category,
                to: to as u32,
            });
        }
        if !states.iter().any(|s| s.initial) {
            return Err(ModelError::Grammar("no initial state".into()));
        }
        if !states.iter().any(|s| s.accept) {
            return Err(ModelError::Grammar("no accepting state".into()));
        }
        info!(
            "{}: DFA with {} states, {} categories",
            file,
            states.len(),
            n_categories
        );
        Ok(Self {
            states,
            n_categories,
            skippable: vec![false; n_categories],
            cp: Vec::new(),
            cp_begin: Vec::new(),
            cp_end: Vec::new(),
        })
    }

    pub fn n_categories(&self) -> usize {
        self.n_categories
    }

    /// Marks the optional-pause categories before pair extraction: a category is skippable when
    /// every dictionary word in it is transparent.
    pub fn mark_skippable(&mut self, voca: &Vocabulary) {
        let mut any_word = vec![false; self.n_categories];
        let mut all_transparent = vec![true; self.n_categories];
        for (_, w) in voca.iter() {
            let c = w.category as usize;
            if c < self.n_categories {
                any_word[c] = true;
                all_transparent[c] &= w.transparent;
            }
        }
        for c in 0..self.n_categories {
            self.skippable[c] = any_word[c] && all_transparent[c];
        }
    }

    /// Tabulates the category-pair constraint from the automaton. Pairs across a skippable
    /// pause are admitted too; a pause at a sentence edge or repeated is refused.
    pub fn extract_pairs(&mut self) -> Result<(), ModelError> {
        let n = self.n_categories;
        let mut cp = vec![false; n * n];
        let mut cp_begin = vec![false; n];
        let mut cp_end = vec![false; n];

        for state in &self.states {
            if state.initial {
                for arc in &state.arcs {
                    if self.skippable[arc.category as usize] {
                        return Err(ModelError::Grammar(
                            "skippable pause category at sentence start".into(),
                        ));
                    }
                    cp_begin[arc.category as usize] = true;
                }
            }
        }
        for state in &self.states {
            for arc_l in &state.arcs {
                let left = arc_l.category as usize;
                let mid = &self.states[arc_l.to as usize];
                if mid.accept {
                    if self.skippable[left] {
                        return Err(ModelError::Grammar(
                            "skippable pause category at sentence end".into(),
                        ));
                    }
                    cp_end[left] = true;
                }
                for arc_r in &mid.arcs {
                    let right = arc_r.category as usize;
                    cp[left * n + right] = true;
                    if self.skippable[right] {
                        // the pause may be skipped: admit what follows it as well
                        for arc_r2 in &self.states[arc_r.to as usize].arcs {
                            if self.skippable[arc_r2.category as usize] {
                                return Err(ModelError::Grammar(
                                    "skippable pause categories may not repeat".into(),
                                ));
                            }
                            cp[left * n + arc_r2.category as usize] = true;
                        }
                    }
                }
            }
        }
        let pairs = cp.iter().filter(|&&b| b).count();
        info!(
            "category pairs extracted: {} of {} possible",
            pairs,
            n * n
        );
        self.cp = cp;
        self.cp_begin = cp_begin;
        self.cp_end = cp_end;
        Ok(())
    }

    pub fn is_skippable(&self, cat: u32) -> bool {
        self.skippable
            .get(cat as usize)
            .copied()
            .unwrap_or(false)
    }
}

/// Assigns each dictionary word its category from the grammar-mode name column (the category
/// number as text).
pub fn bind_categories(voca: &mut Vocabulary, n_categories: usize) -> Result<(), ModelError> {
    let mut assignments: Vec<(WordId, u32)> = Vec::with_capacity(voca.len());
    for (id, w) in voca.iter() {
        let cat: u32 = w.name.parse().map_err(|_| ModelError::Grammar(format!(
            "word \"{}\" has a non-numeric category column",
            w.output
        )))?;
        if cat as usize >= n_categories {
            return Err(ModelError::Grammar(format!(
                "word \"{}\" references category {} of {}",
                w.output, cat, n_categories
            )));
        }
        assignments.push((id, cat));
    }
    for (id, cat) in assignments {
        voca.set_category(id, cat);
    }
    Ok(())
}

impl LangModel for DfaGrammar {
    fn entry_id(&self, name: &str) -> Option<LmId> {
        let cat: u32 = name.parse().ok()?;
        ((cat as usize) < self.n_categories).then_some(cat)
    }

    fn begin_id(&self) -> Option<LmId> {
        None
    }

    fn end_id(&self) -> Option<LmId> {
        None
    }

    fn unknown_id(&self) -> Option<LmId> {
        None
    }

    fn logp(&self, word: LmId, context: &[LmId]) -> LogProb {
        // context[0] follows `word` in time (second pass goes right to left)
        match context.first() {
            Some(&next) => {
                if self.admissible(word, next) {
                    0.0
                } else {
                    LOG_ZERO
                }
            }
            None => 0.0,
        }
    }

    fn logp_fast(&self, word: LmId, prev: LmId) -> LogProb {
        if self.admissible(prev, word) {
            0.0
        } else {
            LOG_ZERO
        }
    }

    fn factor_bound(&self, _word: LmId) -> LogProb {
        0.0
    }

    fn admissible(&self, prev_cat: u32, next_cat: u32) -> bool {
        let n = self.n_categories;
        if (prev_cat as usize) >= n || (next_cat as usize) >= n {
            return false;
        }
        self.cp[prev_cat as usize * n + next_cat as usize]
    }

    fn starts_sentence(&self, cat: u32) -> bool {
        self.cp_begin.get(cat as usize).copied().unwrap_or(false)
    }

    fn ends_sentence(&self, cat: u32) -> bool {
        self.cp_end.get(cat as usize).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// S0 -0-> S1 -1-> S2(accept), S1 -2(sp)-> S3 -1-> S2. S0 initial.
    const DFA: &str = "\
# from to category accept initial
0 1 0 0 1
1 2 1 0 0
1 3 2 0 0
3 2 1 0 0
2 -1 -1 1 0
";

    fn dict() -> Vocabulary {
        let text = "0 [yes] y eh s\n0 [no] n ow\n1 [bye] b ay\n2 {} sp\n";
        Vocabulary::from_reader(Cursor::new(text), "dict").unwrap()
    }

    #[test]
    fn parses_states_and_flags() {
        let g = DfaGrammar::from_reader(Cursor::new(DFA), "g.dfa").unwrap();
        assert_eq!(g.n_categories(), 3);
        assert_eq!(g.states.len(), 4);
        assert!(g.states[0].initial);
        assert!(g.states[2].accept);
    }

    #[test]
    fn category_pairs() {
        let mut g = DfaGrammar::from_reader(Cursor::new(DFA), "g.dfa").unwrap();
        let mut v = dict();
        bind_categories(&mut v, g.n_categories()).unwrap();
        g.mark_skippable(&v);
        assert!(g.is_skippable(2));
        g.extract_pairs().unwrap();

        assert!(g.starts_sentence(0));
        assert!(!g.starts_sentence(1));
        assert!(g.ends_sentence(1));
        assert!(!g.ends_sentence(0));
        assert!(g.admissible(0, 1));
        assert!(g.admissible(0, 2));
        // pair across the skippable pause
        assert!(g.admissible(0, 1));
        assert!(g.admissible(2, 1));
        assert!(!g.admissible(1, 0));
        // LangModel view
        assert_eq!(g.logp_fast(1, 0), 0.0);
        assert_eq!(g.logp_fast(0, 1), LOG_ZERO);
    }

    #[test]
    fn categories_bind_from_name_column() {
        let mut v = dict();
        bind_categories(&mut v, 3).unwrap();
        assert_eq!(v.word(v.id_of("1").unwrap()).category, 1);
        assert_eq!(v.word(v.id_of("2").unwrap()).category, 2);
        // out-of-range category is refused
        let mut v = dict();
        assert!(bind_categories(&mut v, 2).is_err());
    }

    #[test]
    fn rejects_pause_at_edges() {
        // sp reachable directly from the initial state
        let text = "0 1 0 0 1\n1 2 1 0 0\n2 -1 -1 1 0\n";
        let mut g = DfaGrammar::from_reader(Cursor::new(text), "g").unwrap();
        g.skippable = vec![true, false];
        assert!(g.extract_pairs().is_err());
    }

    #[test]
    fn grammar_without_initial_state_is_rejected() {
        assert!(DfaGrammar::from_reader(Cursor::new("0 1 0 1 0\n"), "g").is_err());
    }
}
