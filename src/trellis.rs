//! The word trellis: everything pass 1 hands to pass 2. Every word end that survived the beam
//! becomes an atom holding its span, its accumulated score from the utterance start, the LM
//! score it carried, and a back-pointer to the word it followed. Atoms live in one arena with
//! index back-pointers; per-frame buckets hold the atoms ending at each frame, kept sorted best
//! first. Immutable once the first pass finishes.
use crate::lexicon::WordId;
use crate::logprob::LogProb;

pub type TrellisId = u32;
pub const TRELLIS_NONE: TrellisId = u32::MAX;

#[derive(Clone, Debug)]
pub struct TrellisWord {
    pub word: WordId,
    /// First frame this word occupied.
    pub begin: usize,
    /// Frame it ended on (the bucket it lives in).
    pub end: usize,
    /// Accumulated AM+LM score from the utterance start through `end`.
    pub score: LogProb,
    /// LM score applied to this word on the first pass.
    pub lm_score: LogProb,
    /// The word this one followed, or [`TRELLIS_NONE`] at the utterance start.
    pub last: TrellisId,
}

#[derive(Debug, Default)]
pub struct WordTrellis {
    atoms: Vec<TrellisWord>,
    frames: Vec<Vec<TrellisId>>,
}

impl WordTrellis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.atoms.clear();
        self.frames.clear();
    }

    pub fn push(&mut self, atom: TrellisWord) -> TrellisId {
        let id = self.atoms.len() as TrellisId;
        if atom.end >= self.frames.len() {
            self.frames.resize_with(atom.end + 1, Vec::new);
        }
        self.frames[atom.end].push(id);
        self.atoms.push(atom);
        id
    }

    /// Sorts a frame's bucket best-first. Pass 1 calls this once per frame after all word ends
    /// of that frame are in.
    pub fn finish_frame(&mut self, t: usize) {
        if t >= self.frames.len() {
            return;
        }
        let atoms = &self.atoms;
        self.frames[t].sort_by(|&a, &b| {
            atoms[b as usize]
                .score
                .partial_cmp(&atoms[a as usize].score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    pub fn get(&self, id: TrellisId) -> &TrellisWord {
        &self.atoms[id as usize]
    }

    /// Atom ids ending at frame `t`, best first.
    pub fn ending_at(&self, t: usize) -> &[TrellisId] {
        self.frames.get(t).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn num_atoms(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(word: WordId, begin: usize, end: usize, score: f32) -> TrellisWord {
        TrellisWord {
            word,
            begin,
            end,
            score,
            lm_score: 0.0,
            last: TRELLIS_NONE,
        }
    }

    #[test]
    fn buckets_sort_best_first() {
        let mut tr = WordTrellis::new();
        tr.push(atom(0, 0, 5, -30.0));
        tr.push(atom(1, 2, 5, -10.0));
        tr.push(atom(2, 1, 5, -20.0));
        tr.push(atom(3, 0, 3, -5.0));
        tr.finish_frame(5);
        let ids = tr.ending_at(5);
        let scores: Vec<f32> = ids.iter().map(|&i| tr.get(i).score).collect();
        assert_eq!(scores, vec![-10.0, -20.0, -30.0]);
        assert_eq!(tr.ending_at(3).len(), 1);
        assert_eq!(tr.ending_at(4).len(), 0);
        assert_eq!(tr.ending_at(99).len(), 0);
    }

    #[test]
    fn back_pointers_chain() {
        let mut tr = WordTrellis::new();
        let first = tr.push(atom(0, 0, 3, -5.0));
        let mut second = atom(1, 4, 8, -12.0);
        second.last = first;
        let id = tr.push(second);
        assert_eq!(tr.get(id).last, first);
        assert_eq!(tr.get(first).last, TRELLIS_NONE);
    }

    #[test]
    fn clear_resets_everything() {
        let mut tr = WordTrellis::new();
        tr.push(atom(0, 0, 1, -1.0));
        tr.clear();
        assert!(tr.is_empty());
        assert_eq!(tr.num_frames(), 0);
    }
}
