//! Acoustic model data structures. An HTK-style model is a two-level affair: *logical* HMMs are
//! the context-dependent phone names the lexicon talks about ("k-a+e"), *physical* HMMs are the
//! actually-trained models they map onto, usually shared between many logical names through state
//! tying. On top of that, triphones never seen in training resolve to *pseudo* models built by
//! pooling the states of every trained triphone that matches the remaining context.
//!
//! Everything here is frozen after load: states, Gaussians and physical models live in flat
//! arenas addressed by integer ids so the per-frame scorer can cache against those ids without
//! chasing pointers.
use ahash::AHashMap;

use crate::features::ParamKind;
use crate::logprob::{LogProb, LOG_ZERO};

pub type StateId = u32;
pub type PhysId = u32;
pub type CdSetId = u32;

/// Left-context delimiter in triphone names.
pub const LC_DELIM: char = '-';
/// Right-context delimiter in triphone names.
pub const RC_DELIM: char = '+';

/// One diagonal-covariance Gaussian. Variances are stored inverted so the density loop is a
/// multiply, and `gconst` carries the `log((2π)^D · Πσ²)` normaliser precomputed at load.
#[derive(Clone, Debug)]
pub struct Gaussian {
    pub mean: Vec<f32>,
    pub inv_var: Vec<f32>,
    pub gconst: f32,
}

impl Gaussian {
    /// Natural-log density of `x` under this Gaussian.
    #[inline]
    pub fn log_density(&self, x: &[f32]) -> LogProb {
        debug_assert_eq!(x.len(), self.mean.len());
        let mut sum = 0.0f32;
        for i in 0..x.len() {
            let d = x[i] - self.mean[i];
            sum += d * d * self.inv_var[i];
        }
        -0.5 * (self.gconst + sum)
    }

    /// Partial-sum variant for pruning: accumulates dimensions until the running score drops
    /// below `floor`, returning `None` once it cannot recover. The returned value equals
    /// [`Self::log_density`] when it completes.
    #[inline]
    pub fn log_density_pruned(&self, x: &[f32], floor: LogProb) -> Option<LogProb> {
        let mut acc = -0.5 * self.gconst;
        for i in 0..x.len() {
            let d = x[i] - self.mean[i];
            acc -= 0.5 * d * d * self.inv_var[i];
            if acc < floor {
                return None;
            }
        }
        Some(acc)
    }
}

/// Output distribution of one emitting state.
#[derive(Clone, Debug)]
pub enum StatePdf {
    /// Gaussian mixture: parallel arrays of log weight and Gaussian arena id.
    Gmm {
        log_weights: Vec<f32>,
        gaussians: Vec<u32>,
    },
    /// Row of the DNN softmax output; scoring goes through the network forward pass.
    Dnn { senone: u32 },
}

#[derive(Clone, Debug)]
pub struct HmmState {
    pub pdf: StatePdf,
}

/// A trained model: `nstate` total states of which the first and last are non-emitting
/// entry/exit, a dense log-domain transition matrix, and arena ids for the emitting states.
#[derive(Clone, Debug)]
pub struct PhysicalHmm {
    pub name: String,
    pub nstate: usize,
    /// Emitting states only, `states[i]` is HMM state `i + 1`.
    pub states: Vec<StateId>,
    /// Row-major `nstate * nstate` log transition probabilities.
    pub trans: Vec<LogProb>,
}

impl PhysicalHmm {
    #[inline]
    pub fn trans(&self, from: usize, to: usize) -> LogProb {
        self.trans[from * self.nstate + to]
    }

    pub fn emitting_len(&self) -> usize {
        self.nstate - 2
    }

    /// Topology restrictions required by the tree-structured search: nothing may transition
    /// into the entry state, nothing may leave the exit state, and the model must be able to
    /// reach its exit.
    pub fn check_topology(&self) -> Result<(), String> {
        if self.nstate < 3 {
            return Err(format!("\"{}\" has no emitting state", self.name));
        }
        for from in 0..self.nstate {
            if self.trans(from, 0) > LOG_ZERO {
                return Err(format!("\"{}\" has a transition into its entry state", self.name));
            }
        }
        for to in 0..self.nstate {
            if self.trans(self.nstate - 1, to) > LOG_ZERO {
                return Err(format!("\"{}\" has a transition out of its exit state", self.name));
            }
        }
        let exit = self.nstate - 1;
        if !(0..self.nstate).any(|from| self.trans(from, exit) > LOG_ZERO) {
            return Err(format!("\"{}\" cannot reach its exit state", self.name));
        }
        Ok(())
    }
}

/// What a logical phone name resolves to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PhoneModel {
    Physical(PhysId),
    Pseudo(CdSetId),
}

/// Pseudo model for an unseen context: per emitting position, the set of candidate states pooled
/// from all matching trained triphones. Scoring takes the best candidate per position, and the
/// transition skeleton is borrowed from one representative member.
#[derive(Clone, Debug)]
pub struct CdSet {
    pub name: String,
    pub state_sets: Vec<Vec<StateId>>,
    pub representative: PhysId,
}

/// The frozen acoustic model.
#[derive(Clone, Debug)]
pub struct AcousticModel {
    pub param_kind: ParamKind,
    pub dim: usize,
    pub gaussians: Vec<Gaussian>,
    pub states: Vec<HmmState>,
    pub phys: Vec<PhysicalHmm>,
    pub cdsets: Vec<CdSet>,
    pub(crate) logical: AHashMap<String, PhoneModel>,
    /// Number of DNN senones when the states are DNN-tied, 0 for pure GMM models.
    pub senone_count: usize,
}

/// A state as seen by the search: either a concrete arena state or one position of a pseudo
/// model whose candidates are maxed over at score time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StateRef {
    Single(StateId),
    Pooled { cdset: CdSetId, position: u8 },
}

impl AcousticModel {
    /// Looks up a logical phone name, falling back to nothing. Pseudo fallback for partial
    /// contexts is handled at model build time by registering cdset names as logical entries.
    pub fn lookup(&self, name: &str) -> Option<PhoneModel> {
        self.logical.get(name).copied()
    }

    /// Resolve with triphone fallback: exact logical name first, then the pseudo model for the
    /// name with one context stripped ("l-c+r" → "c+r" → "c").
    pub fn resolve(&self, name: &str) -> Option<PhoneModel> {
        if let Some(m) = self.lookup(name) {
            return Some(m);
        }
        let right = rightcenter_name(name);
        if right != name {
            if let Some(m) = self.lookup(right) {
                return Some(m);
            }
        }
        let center = center_name(name);
        if center != name {
            return self.lookup(center);
        }
        None
    }

    /// The emitting state sequence of a phone model, pseudo positions pooled.
    pub fn phone_states(&self, model: PhoneModel) -> Vec<StateRef> {
        match model {
            PhoneModel::Physical(id) => self.phys[id as usize]
                .states
                .iter()
                .map(|&s| StateRef::Single(s))
                .collect(),
            PhoneModel::Pseudo(id) => {
                let set = &self.cdsets[id as usize];
                (0..set.state_sets.len())
                    .map(|p| StateRef::Pooled {
                        cdset: id,
                        position: p as u8,
                    })
                    .collect()
            }
        }
    }

    /// The transition skeleton of a phone model.
    pub fn phone_trans(&self, model: PhoneModel) -> &PhysicalHmm {
        match model {
            PhoneModel::Physical(id) => &self.phys[id as usize],
            PhoneModel::Pseudo(id) => {
                &self.phys[self.cdsets[id as usize].representative as usize]
            }
        }
    }

    /// The scoreable state at emitting position `pos` of a phone model. Pseudo models whose
    /// pooled positions fall short of the representative topology reuse their last pool.
    pub fn state_at(&self, model: PhoneModel, pos: usize) -> StateRef {
        match model {
            PhoneModel::Physical(id) => StateRef::Single(self.phys[id as usize].states[pos]),
            PhoneModel::Pseudo(id) => {
                let set = &self.cdsets[id as usize];
                let p = pos.min(set.state_sets.len().saturating_sub(1));
                StateRef::Pooled {
                    cdset: id,
                    position: p as u8,
                }
            }
        }
    }

}

/// Extracts the centre phone of a context-dependent name: `"k-a+e"` → `"a"`.
pub fn center_name(name: &str) -> &str {
    let s = match name.find(LC_DELIM) {
        Some(i) => &name[i + 1..],
        None => name,
    };
    match s.find(RC_DELIM) {
        Some(i) => &s[..i],
        None => s,
    }
}

/// Strips the right context: `"k-a+e"` → `"k-a"`.
pub fn leftcenter_name(name: &str) -> &str {
    match name.find(RC_DELIM) {
        Some(i) => &name[..i],
        None => name,
    }
}

/// Strips the left context: `"k-a+e"` → `"a+e"`.
pub fn rightcenter_name(name: &str) -> &str {
    match name.find(LC_DELIM) {
        Some(i) if i + 1 < name.len() => &name[i + 1..],
        _ => name,
    }
}

/// Replaces (or adds) the right context of `name` with the centre phone of `rc`:
/// `"k-a+e"` + `"r-u+k"` → `"k-a+u"`.
pub fn add_right_context(name: &str, rc: &str) -> String {
    let base = match name.find(RC_DELIM) {
        Some(i) => &name[..i],
        None => name,
    };
    format!("{}{}{}", base, RC_DELIM, center_name(rc))
}

/// Replaces (or adds) the left context of `name` with the centre phone of `lc`:
/// `"a+e"` + `"k"` → `"k-a+e"`.
pub fn add_left_context(name: &str, lc: &str) -> String {
    let base = match name.find(LC_DELIM) {
        Some(i) => &name[i + 1..],
        None => name,
    };
    format!("{}{}{}", center_name(lc), LC_DELIM, base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triphone_name_parts() {
        assert_eq!(center_name("k-a+e"), "a");
        assert_eq!(center_name("a+e"), "a");
        assert_eq!(center_name("k-a"), "a");
        assert_eq!(center_name("a"), "a");
        assert_eq!(leftcenter_name("k-a+e"), "k-a");
        assert_eq!(rightcenter_name("k-a+e"), "a+e");
        assert_eq!(rightcenter_name("a"), "a");
    }

    #[test]
    fn context_substitution() {
        assert_eq!(add_right_context("a", "r"), "a+r");
        assert_eq!(add_right_context("a", "e-k+i"), "a+k");
        assert_eq!(add_right_context("k-a+e", "r-u+k"), "k-a+u");
        assert_eq!(add_left_context("a+e", "k"), "k-a+e");
        assert_eq!(add_left_context("k-a+e", "b"), "b-a+e");
    }

    #[test]
    fn gaussian_density_matches_closed_form() {
        // Unit variance, zero mean, 2-D: log N(x) = -0.5 (2 log 2π + x·x)
        let g = Gaussian {
            mean: vec![0.0, 0.0],
            inv_var: vec![1.0, 1.0],
            gconst: 2.0 * (2.0 * std::f32::consts::PI).ln(),
        };
        let x = [1.0, -2.0];
        let expect = -0.5 * (2.0 * (2.0 * std::f32::consts::PI).ln() + 5.0);
        assert!((g.log_density(&x) - expect).abs() < 1e-5);
        // Pruned variant agrees when not cut off, prunes when floored high.
        let full = g.log_density_pruned(&x, LOG_ZERO).unwrap();
        assert!((full - expect).abs() < 1e-5);
        assert!(g.log_density_pruned(&x, expect + 1.0).is_none());
    }

    fn left_to_right(nstate: usize) -> PhysicalHmm {
        let mut trans = vec![LOG_ZERO; nstate * nstate];
        for i in 0..nstate - 1 {
            trans[i * nstate + i + 1] = -0.5;
            if i > 0 {
                trans[i * nstate + i] = -0.9;
            }
        }
        PhysicalHmm {
            name: "t".into(),
            nstate,
            states: (0..nstate as u32 - 2).collect(),
            trans,
        }
    }

    #[test]
    fn topology_check() {
        assert!(left_to_right(5).check_topology().is_ok());

        let mut bad = left_to_right(5);
        bad.trans[2 * 5] = -0.1; // state 2 -> entry
        assert!(bad.check_topology().is_err());

        let mut bad = left_to_right(5);
        bad.trans[4 * 5 + 1] = -0.1; // exit -> state 1
        assert!(bad.check_topology().is_err());
    }
}
