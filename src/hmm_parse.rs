//! Acoustic model loading. HTK hmmdefs are a macro soup: `~h` model definitions reference `~s`
//! shared states, which reference `~m` mixture pdfs, `~v` variances and `~t` transition
//! matrices, in any order. Loading is therefore two-phase, the way all the model loaders in this
//! crate work: phase one tokenises the file into name-indexed maps without resolving anything,
//! phase two resolves the references and freezes everything into the flat arenas of
//! [`AcousticModel`]. Unseen-triphone pseudo models and the logical name table are also built in
//! phase two.
//!
//! A binary dump format avoids re-parsing hmmdefs on every start. The V1 header stores plain
//! variances; V2 adds qualifier bytes: `V` variances already inverted, `P` an embedded
//! acoustic-analysis parameter blob, `M` mixture-pdf macro names retained.
use ahash::AHashMap;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::ModelError;
use crate::features::ParamKind;
use crate::hmm::{
    center_name, leftcenter_name, rightcenter_name, AcousticModel, CdSet, Gaussian, HmmState,
    PhoneModel, PhysicalHmm, StatePdf, LC_DELIM, RC_DELIM,
};
use crate::logprob::LOG_ZERO;

const BINHMM_MAGIC_V1: &[u8] = b"JBINHMM\n";
const BINHMM_MAGIC_V2: &[u8] = b"JBINHMMV2";
const V2_QUAL_EMBEDPARA: u8 = b'P';
const V2_QUAL_VARINV: u8 = b'V';
const V2_QUAL_MPDFMACRO: u8 = b'M';

/// Whitespace tokeniser over the hmmdefs text with one-token lookahead. HTK keywords arrive as
/// `<KeyWord>` and are matched case-insensitively; macro names may be double-quoted.
struct Tokens {
    items: Vec<String>,
    pos: usize,
    file: String,
}

impl Tokens {
    fn new(text: &str, file: &str) -> Self {
        Self {
            items: text.split_whitespace().map(|s| s.to_string()).collect(),
            pos: 0,
            file: file.to_string(),
        }
    }

    fn peek(&self) -> Option<&str> {
        self.items.get(self.pos).map(|s| s.as_str())
    }

    fn next(&mut self) -> Result<&str, ModelError> {
        let tok = self
            .items
            .get(self.pos)
            .ok_or_else(|| self.err("unexpected end of file"))?;
        self.pos += 1;
        Ok(tok)
    }

    fn err(&self, msg: impl Into<String>) -> ModelError {
        ModelError::format(&self.file, self.pos, msg)
    }

    /// Consumes the next token and checks it is the given `<keyword>`.
    fn expect(&mut self, keyword: &str) -> Result<(), ModelError> {
        let t = self.next()?.to_string();
        if t.eq_ignore_ascii_case(keyword) {
            Ok(())
        } else {
            Err(self.err(format!("expected {} but found \"{}\"", keyword, t)))
        }
    }

    fn next_is(&mut self, keyword: &str) -> bool {
        if self.peek().is_some_and(|t| t.eq_ignore_ascii_case(keyword)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn name(&mut self) -> Result<String, ModelError> {
        let t = self.next()?;
        Ok(t.trim_matches('"').to_string())
    }

    fn usize(&mut self) -> Result<usize, ModelError> {
        let t = self.next()?.to_string();
        t.parse()
            .map_err(|_| self.err(format!("expected an integer, found \"{}\"", t)))
    }

    fn f32(&mut self) -> Result<f32, ModelError> {
        let t = self.next()?.to_string();
        t.parse()
            .map_err(|_| self.err(format!("expected a number, found \"{}\"", t)))
    }

    fn f32_vec(&mut self, n: usize) -> Result<Vec<f32>, ModelError> {
        let mut v = Vec::with_capacity(n);
        for _ in 0..n {
            v.push(self.f32()?);
        }
        Ok(v)
    }
}

/// Reference to a macro or an inline definition.
#[derive(Clone, Debug)]
enum Ref<T> {
    Named(String),
    Inline(T),
}

#[derive(Clone, Debug)]
struct ParsedGaussian {
    mean: Vec<f32>,
    var: Ref<Vec<f32>>,
    gconst: Option<f32>,
}

#[derive(Clone, Debug)]
struct ParsedState {
    /// (weight, pdf) per mixture component; weights are plain probabilities here.
    mixtures: Vec<(f32, Ref<ParsedGaussian>)>,
}

#[derive(Clone, Debug)]
struct ParsedHmm {
    nstate: usize,
    states: Vec<Ref<ParsedState>>,
    trans: Ref<Vec<f32>>,
}

/// Phase-one output: name-indexed macro tables plus the model list in file order.
#[derive(Debug, Default)]
pub struct ModelBuilder {
    param_kind: Option<ParamKind>,
    dim: usize,
    covariance_inverted: bool,
    variances: AHashMap<String, Vec<f32>>,
    transitions: AHashMap<String, Vec<f32>>,
    mixtures: AHashMap<String, ParsedGaussian>,
    state_macros: AHashMap<String, ParsedState>,
    hmms: Vec<(String, ParsedHmm)>,
    /// logical name → physical name, from the HMM list file.
    mapping: Vec<(String, String)>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses an hmmdefs file into the macro tables.
    pub fn parse_hmmdefs(&mut self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ModelError::io(path, e))?;
        self.parse_hmmdefs_text(&text, &path.display().to_string())
    }

    pub fn parse_hmmdefs_text(&mut self, text: &str, file: &str) -> Result<(), ModelError> {
        let mut toks = Tokens::new(text, file);
        while let Some(tok) = toks.peek() {
            match tok {
                "~o" => {
                    toks.next()?;
                    self.parse_options(&mut toks)?;
                }
                "~v" => {
                    toks.next()?;
                    let name = toks.name()?;
                    toks.expect("<VARIANCE>")?;
                    let n = toks.usize()?;
                    let v = toks.f32_vec(n)?;
                    self.variances.insert(name, v);
                }
                "~t" => {
                    toks.next()?;
                    let name = toks.name()?;
                    let m = parse_transp(&mut toks)?;
                    self.transitions.insert(name, m);
                }
                "~m" => {
                    toks.next()?;
                    let name = toks.name()?;
                    let g = parse_gaussian(&mut toks)?;
                    self.mixtures.insert(name, g);
                }
                "~s" => {
                    toks.next()?;
                    let name = toks.name()?;
                    let s = parse_state(&mut toks)?;
                    self.state_macros.insert(name, s);
                }
                "~w" | "~u" | "~i" | "~x" | "~d" | "~p" => {
                    // stream weights / other macros we have no use for: skip to the next macro
                    toks.next()?;
                    skip_to_next_macro(&mut toks);
                }
                "~r" => {
                    // regression tree, irrelevant to decoding
                    toks.next()?;
                    skip_to_next_macro(&mut toks);
                }
                "~h" => {
                    toks.next()?;
                    let name = toks.name()?;
                    let h = parse_hmm(&mut toks)?;
                    self.hmms.push((name, h));
                }
                other => {
                    let msg = format!("unexpected token \"{}\" at top level", other);
                    return Err(toks.err(msg));
                }
            }
        }
        info!(
            "hmmdefs parsed: {} models, {} shared states, {} shared transitions",
            self.hmms.len(),
            self.state_macros.len(),
            self.transitions.len()
        );
        Ok(())
    }

    fn parse_options(&mut self, toks: &mut Tokens) -> Result<(), ModelError> {
        // Global option tokens come in any order; read until something that isn't one of them.
        loop {
            match toks.peek() {
                Some(t) if t.eq_ignore_ascii_case("<STREAMINFO>") => {
                    toks.next()?;
                    let n = toks.usize()?;
                    if n != 1 {
                        return Err(toks.err(format!("{} streams unsupported (single stream only)", n)));
                    }
                    toks.usize()?;
                }
                Some(t) if t.eq_ignore_ascii_case("<VECSIZE>") => {
                    toks.next()?;
                    self.dim = toks.usize()?;
                }
                Some(t) if t.eq_ignore_ascii_case("<INVDIAGC>") => {
                    toks.next()?;
                    self.covariance_inverted = true;
                }
                Some(t) if t.eq_ignore_ascii_case("<DIAGC>") => {
                    toks.next()?;
                    self.covariance_inverted = false;
                }
                Some(t)
                    if t.eq_ignore_ascii_case("<NULLD>") || t.eq_ignore_ascii_case("<POISSOND>") =>
                {
                    toks.next()?;
                }
                Some(t) if t.starts_with('<') => {
                    // Anything else in angle brackets at option position is the parameter kind.
                    let inner = t.trim_matches(|c| c == '<' || c == '>').to_string();
                    match ParamKind::from_str(&inner) {
                        Ok(kind) => {
                            toks.next()?;
                            self.param_kind = Some(kind);
                        }
                        Err(_) => break,
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// Parses an HMM list file: one `logical physical` pair per line, a single name mapping to
    /// itself. `#` starts a comment.
    pub fn parse_hmmlist(&mut self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| ModelError::io(path, e))?;
        self.parse_hmmlist_reader(BufReader::new(file), &path.display().to_string())
    }

    pub fn parse_hmmlist_reader(
        &mut self,
        reader: impl io::BufRead,
        file: &str,
    ) -> Result<(), ModelError> {
        for (lno, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| ModelError::format(file, lno + 1, e.to_string()))?;
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut it = line.split_whitespace();
            let logical = it.next().unwrap().to_string();
            let physical = it.next().unwrap_or(&logical).to_string();
            if it.next().is_some() {
                return Err(ModelError::format(file, lno + 1, "too many fields"));
            }
            self.mapping.push((logical, physical));
        }
        Ok(())
    }

    /// Phase two: resolve every reference and freeze the arenas.
    pub fn build(self) -> Result<AcousticModel, ModelError> {
        let param_kind = self.param_kind.ok_or(ModelError::Malformed {
            what: "hmmdefs",
            msg: "no ~o global options (parameter kind unknown)".into(),
        })?;
        if self.dim == 0 {
            return Err(ModelError::Malformed {
                what: "hmmdefs",
                msg: "no <VECSIZE> in global options".into(),
            });
        }

        let mut gaussians: Vec<Gaussian> = Vec::new();
        let mut states: Vec<HmmState> = Vec::new();
        let mut phys: Vec<PhysicalHmm> = Vec::new();
        let mut phys_index: AHashMap<String, u32> = AHashMap::new();
        // Shared macros freeze once and are reused by id.
        let mut mixture_ids: AHashMap<String, u32> = AHashMap::new();
        let mut state_ids: AHashMap<String, u32> = AHashMap::new();

        let inverted = self.covariance_inverted;
        let dim = self.dim;

        let freeze_gaussian = |g: &ParsedGaussian,
                               gaussians: &mut Vec<Gaussian>,
                               variances: &AHashMap<String, Vec<f32>>|
         -> Result<u32, ModelError> {
            let var = match &g.var {
                Ref::Inline(v) => v.clone(),
                Ref::Named(n) => variances
                    .get(n)
                    .cloned()
                    .ok_or_else(|| ModelError::Malformed {
                        what: "hmmdefs",
                        msg: format!("undefined ~v macro \"{}\"", n),
                    })?,
            };
            if g.mean.len() != dim || var.len() != dim {
                return Err(ModelError::VectorLength {
                    expected: dim,
                    got: g.mean.len().max(var.len()),
                });
            }
            let inv_var: Vec<f32> = if inverted {
                var
            } else {
                var.iter().map(|v| 1.0 / v).collect()
            };
            let gconst = match g.gconst {
                Some(c) => c,
                None => {
                    // log((2π)^D · Π σ²); with inverted variances the product flips sign.
                    let mut c = dim as f32 * (2.0 * std::f32::consts::PI).ln();
                    for &iv in &inv_var {
                        c -= iv.ln();
                    }
                    c
                }
            };
            gaussians.push(Gaussian {
                mean: g.mean.clone(),
                inv_var,
                gconst,
            });
            Ok(gaussians.len() as u32 - 1)
        };

        let freeze_state = |s: &ParsedState,
                            gaussians: &mut Vec<Gaussian>,
                            states: &mut Vec<HmmState>,
                            mixture_ids: &mut AHashMap<String, u32>|
         -> Result<u32, ModelError> {
            let mut log_weights = Vec::with_capacity(s.mixtures.len());
            let mut ids = Vec::with_capacity(s.mixtures.len());
            for (w, pdf) in &s.mixtures {
                let gid = match pdf {
                    Ref::Inline(g) => freeze_gaussian(g, gaussians, &self.variances)?,
                    Ref::Named(n) => match mixture_ids.get(n) {
                        Some(&id) => id,
                        None => {
                            let g = self.mixtures.get(n).ok_or_else(|| ModelError::Malformed {
                                what: "hmmdefs",
                                msg: format!("undefined ~m macro \"{}\"", n),
                            })?;
                            let id = freeze_gaussian(g, gaussians, &self.variances)?;
                            mixture_ids.insert(n.clone(), id);
                            id
                        }
                    },
                };
                log_weights.push(if *w > 0.0 { w.ln() } else { LOG_ZERO });
                ids.push(gid);
            }
            states.push(HmmState {
                pdf: StatePdf::Gmm {
                    log_weights,
                    gaussians: ids,
                },
            });
            Ok(states.len() as u32 - 1)
        };

        for (name, parsed) in &self.hmms {
            let mut emitting = Vec::with_capacity(parsed.nstate.saturating_sub(2));
            for sref in &parsed.states {
                let sid = match sref {
                    Ref::Inline(s) => freeze_state(s, &mut gaussians, &mut states, &mut mixture_ids)?,
                    Ref::Named(n) => match state_ids.get(n) {
                        Some(&id) => id,
                        None => {
                            let s =
                                self.state_macros.get(n).ok_or_else(|| ModelError::Malformed {
                                    what: "hmmdefs",
                                    msg: format!("undefined ~s macro \"{}\"", n),
                                })?;
                            let id =
                                freeze_state(s, &mut gaussians, &mut states, &mut mixture_ids)?;
                            state_ids.insert(n.clone(), id);
                            id
                        }
                    },
                };
                emitting.push(sid);
            }
            let trans = match &parsed.trans {
                Ref::Inline(m) => m.clone(),
                Ref::Named(n) => {
                    self.transitions
                        .get(n)
                        .cloned()
                        .ok_or_else(|| ModelError::Malformed {
                            what: "hmmdefs",
                            msg: format!("undefined ~t macro \"{}\"", n),
                        })?
                }
            };
            if trans.len() != parsed.nstate * parsed.nstate {
                return Err(ModelError::Malformed {
                    what: "hmmdefs",
                    msg: format!("transition matrix size mismatch in \"{}\"", name),
                });
            }
            let hmm = PhysicalHmm {
                name: name.clone(),
                nstate: parsed.nstate,
                states: emitting,
                trans,
            };
            hmm.check_topology().map_err(|msg| ModelError::Malformed {
                what: "hmmdefs",
                msg,
            })?;
            phys_index.insert(name.clone(), phys.len() as u32);
            phys.push(hmm);
        }

        // Logical table: explicit list entries first, then every physical name maps to itself
        // unless shadowed.
        let mut logical: AHashMap<String, PhoneModel> = AHashMap::new();
        for (log_name, phys_name) in &self.mapping {
            let id = phys_index
                .get(phys_name)
                .ok_or_else(|| ModelError::UnknownTriphone(phys_name.clone()))?;
            logical.insert(log_name.clone(), PhoneModel::Physical(*id));
        }
        for (name, &id) in &phys_index {
            logical
                .entry(name.clone())
                .or_insert(PhoneModel::Physical(id));
        }

        let mut model = AcousticModel {
            param_kind,
            dim,
            gaussians,
            states,
            phys,
            cdsets: Vec::new(),
            logical,
            senone_count: 0,
        };
        build_cdsets(&mut model);
        info!(
            "acoustic model: {} physical HMMs, {} logical names, {} states, {} Gaussians, {} pseudo sets, kind {}",
            model.phys.len(),
            model.logical.len(),
            model.states.len(),
            model.gaussians.len(),
            model.cdsets.len(),
            model.param_kind
        );
        Ok(model)
    }
}

fn parse_transp(toks: &mut Tokens) -> Result<Vec<f32>, ModelError> {
    toks.expect("<TRANSP>")?;
    let n = toks.usize()?;
    let probs = toks.f32_vec(n * n)?;
    // HTK stores plain probabilities; the decoder wants logs.
    Ok(probs
        .iter()
        .map(|&p| if p > 0.0 { p.ln() } else { LOG_ZERO })
        .collect())
}

fn parse_gaussian(toks: &mut Tokens) -> Result<ParsedGaussian, ModelError> {
    toks.expect("<MEAN>")?;
    let n = toks.usize()?;
    let mean = toks.f32_vec(n)?;
    let var = if toks.next_is("~v") {
        Ref::Named(toks.name()?)
    } else {
        toks.expect("<VARIANCE>")?;
        let n = toks.usize()?;
        Ref::Inline(toks.f32_vec(n)?)
    };
    let gconst = if toks.next_is("<GCONST>") {
        Some(toks.f32()?)
    } else {
        None
    };
    Ok(ParsedGaussian { mean, var, gconst })
}

fn parse_state(toks: &mut Tokens) -> Result<ParsedState, ModelError> {
    let mixnum = if toks.next_is("<NUMMIXES>") {
        toks.usize()?
    } else {
        1
    };
    let mut mixtures = Vec::with_capacity(mixnum);
    if mixnum == 1 && !toks.peek().is_some_and(|t| t.eq_ignore_ascii_case("<MIXTURE>")) {
        let pdf = if toks.next_is("~m") {
            Ref::Named(toks.name()?)
        } else {
            Ref::Inline(parse_gaussian(toks)?)
        };
        mixtures.push((1.0, pdf));
        return Ok(ParsedState { mixtures });
    }
    for _ in 0..mixnum {
        // Zero-weight components may be omitted from the file entirely.
        if !toks.next_is("<MIXTURE>") {
            break;
        }
        let _index = toks.usize()?;
        let weight = toks.f32()?;
        let pdf = if toks.next_is("~m") {
            Ref::Named(toks.name()?)
        } else {
            Ref::Inline(parse_gaussian(toks)?)
        };
        mixtures.push((weight, pdf));
    }
    if mixtures.is_empty() {
        return Err(toks.err("state with no mixture components"));
    }
    Ok(ParsedState { mixtures })
}

fn parse_hmm(toks: &mut Tokens) -> Result<ParsedHmm, ModelError> {
    toks.expect("<BEGINHMM>")?;
    toks.expect("<NUMSTATES>")?;
    let nstate = toks.usize()?;
    if nstate < 3 {
        return Err(toks.err(format!("HMM with {} states has no emitting state", nstate)));
    }
    let mut states: Vec<Option<Ref<ParsedState>>> = vec![None; nstate - 2];
    while toks.next_is("<STATE>") {
        let idx = toks.usize()?;
        if idx < 2 || idx > nstate - 1 {
            return Err(toks.err(format!("state index {} out of range", idx)));
        }
        let s = if toks.next_is("~s") {
            Ref::Named(toks.name()?)
        } else {
            Ref::Inline(parse_state(toks)?)
        };
        states[idx - 2] = Some(s);
    }
    let states: Vec<Ref<ParsedState>> = states
        .into_iter()
        .enumerate()
        .map(|(i, s)| s.ok_or_else(|| toks.err(format!("state {} missing", i + 2))))
        .collect::<Result<_, _>>()?;
    let trans = if toks.next_is("~t") {
        Ref::Named(toks.name()?)
    } else {
        Ref::Inline(parse_transp(toks)?)
    };
    toks.expect("<ENDHMM>")?;
    Ok(ParsedHmm {
        nstate,
        states,
        trans,
    })
}

fn skip_to_next_macro(toks: &mut Tokens) {
    while let Some(t) = toks.peek() {
        if t.starts_with('~') {
            break;
        }
        toks.pos += 1;
    }
}

/// Registers pseudo models for every partial triphone context. For each trained triphone
/// `l-c+r`, the names `c+r`, `l-c` and `c` gain a pooled state set unless a real model of that
/// name exists. Search code can then resolve any unseen context to the closest trained pool.
fn build_cdsets(model: &mut AcousticModel) {
    let mut pools: AHashMap<String, Vec<u32>> = AHashMap::new();
    for (name, pm) in &model.logical {
        let PhoneModel::Physical(pid) = *pm else {
            continue;
        };
        if !name.contains(LC_DELIM) && !name.contains(RC_DELIM) {
            continue;
        }
        for partial in [
            rightcenter_name(name),
            leftcenter_name(name),
            center_name(name),
        ] {
            if partial == name {
                continue;
            }
            pools.entry(partial.to_string()).or_default().push(pid);
        }
    }
    // fixed registration order keeps pseudo ids stable across runs
    let mut pools: Vec<(String, Vec<u32>)> = pools.into_iter().collect();
    pools.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, mut members) in pools {
        if model.logical.contains_key(&name) {
            continue;
        }
        members.sort_unstable();
        members.dedup();
        let positions = members
            .iter()
            .map(|&p| model.phys[p as usize].emitting_len())
            .max()
            .unwrap_or(0);
        let mut state_sets = vec![Vec::new(); positions];
        for &pid in &members {
            for (pos, &sid) in model.phys[pid as usize].states.iter().enumerate() {
                if !state_sets[pos].contains(&sid) {
                    state_sets[pos].push(sid);
                }
            }
        }
        let representative = members[0];
        let id = model.cdsets.len() as u32;
        debug!(
            "pseudo model \"{}\": {} members, {} positions",
            name,
            members.len(),
            positions
        );
        model.cdsets.push(CdSet {
            name: name.clone(),
            state_sets,
            representative,
        });
        model.logical.insert(name, PhoneModel::Pseudo(id));
    }
}

/// Loads an acoustic model from either a binary dump or hmmdefs text, sniffing the magic.
pub fn load_acoustic_model(
    hmmdefs: impl AsRef<Path>,
    hmmlist: Option<&Path>,
) -> Result<AcousticModel, ModelError> {
    let path = hmmdefs.as_ref();
    let mut file = File::open(path).map_err(|e| ModelError::io(path, e))?;
    let mut magic = [0u8; 8];
    let is_binary = match file.read_exact(&mut magic) {
        Ok(()) => magic[..] == *BINHMM_MAGIC_V1 || magic[..] == BINHMM_MAGIC_V2[..8],
        Err(_) => false,
    };
    if is_binary {
        let file = File::open(path).map_err(|e| ModelError::io(path, e))?;
        let mut model = read_binhmm(BufReader::new(file))?;
        if let Some(list) = hmmlist {
            apply_hmmlist(&mut model, list)?;
        }
        return Ok(model);
    }
    let mut builder = ModelBuilder::new();
    builder.parse_hmmdefs(path)?;
    if let Some(list) = hmmlist {
        builder.parse_hmmlist(list)?;
    }
    builder.build()
}

fn apply_hmmlist(model: &mut AcousticModel, list: &Path) -> Result<(), ModelError> {
    let mut builder = ModelBuilder::new();
    builder.parse_hmmlist(list)?;
    let index: AHashMap<&str, u32> = model
        .phys
        .iter()
        .enumerate()
        .map(|(i, h)| (h.name.as_str(), i as u32))
        .collect();
    for (logical, physical) in builder.mapping {
        let id = *index
            .get(physical.as_str())
            .ok_or(ModelError::UnknownTriphone(physical))?;
        model.logical.insert(logical, PhoneModel::Physical(id));
    }
    model.cdsets.clear();
    model.logical.retain(|_, m| matches!(m, PhoneModel::Physical(_)));
    build_cdsets(model);
    Ok(())
}

/// Writes the frozen model as a V2 binary dump (variance-inverted layout, optional embedded
/// analysis parameter blob).
pub fn write_binhmm(
    model: &AcousticModel,
    mut w: impl Write,
    embedded_params: Option<&[u8]>,
) -> io::Result<()> {
    w.write_all(BINHMM_MAGIC_V2)?;
    let mut quals = vec![V2_QUAL_VARINV];
    if embedded_params.is_some() {
        quals.push(V2_QUAL_EMBEDPARA);
    }
    w.write_u8(quals.len() as u8)?;
    w.write_all(&quals)?;

    w.write_u16::<BigEndian>(model.param_kind.code())?;
    w.write_u16::<BigEndian>(model.dim as u16)?;
    if let Some(blob) = embedded_params {
        w.write_u32::<BigEndian>(blob.len() as u32)?;
        w.write_all(blob)?;
    }

    w.write_u32::<BigEndian>(model.gaussians.len() as u32)?;
    for g in &model.gaussians {
        for v in &g.mean {
            w.write_f32::<BigEndian>(*v)?;
        }
        for v in &g.inv_var {
            w.write_f32::<BigEndian>(*v)?;
        }
        w.write_f32::<BigEndian>(g.gconst)?;
    }

    w.write_u32::<BigEndian>(model.states.len() as u32)?;
    for s in &model.states {
        match &s.pdf {
            StatePdf::Gmm {
                log_weights,
                gaussians,
            } => {
                w.write_u8(0)?;
                w.write_u16::<BigEndian>(log_weights.len() as u16)?;
                for (lw, gid) in log_weights.iter().zip(gaussians) {
                    w.write_f32::<BigEndian>(*lw)?;
                    w.write_u32::<BigEndian>(*gid)?;
                }
            }
            StatePdf::Dnn { senone } => {
                w.write_u8(1)?;
                w.write_u32::<BigEndian>(*senone)?;
            }
        }
    }

    w.write_u32::<BigEndian>(model.phys.len() as u32)?;
    for h in &model.phys {
        write_str(&mut w, &h.name)?;
        w.write_u16::<BigEndian>(h.nstate as u16)?;
        for s in &h.states {
            w.write_u32::<BigEndian>(*s)?;
        }
        for t in &h.trans {
            w.write_f32::<BigEndian>(*t)?;
        }
    }

    // Only physically-mapped logical names; pseudo sets are rebuilt on load.
    let entries: Vec<(&String, u32)> = model
        .logical
        .iter()
        .filter_map(|(n, m)| match m {
            PhoneModel::Physical(id) => Some((n, *id)),
            PhoneModel::Pseudo(_) => None,
        })
        .collect();
    w.write_u32::<BigEndian>(entries.len() as u32)?;
    for (name, id) in entries {
        write_str(&mut w, name)?;
        w.write_u32::<BigEndian>(id)?;
    }
    w.write_u32::<BigEndian>(model.senone_count as u32)?;
    Ok(())
}

/// Reads a binary dump written by [`write_binhmm`] (or a V1 dump with plain variances).
pub fn read_binhmm(mut r: impl Read) -> Result<AcousticModel, ModelError> {
    let bad = |msg: String| ModelError::Malformed {
        what: "binary HMM",
        msg,
    };
    let map_io = |e: io::Error| ModelError::Malformed {
        what: "binary HMM",
        msg: e.to_string(),
    };

    let mut magic = [0u8; 8];
    r.read_exact(&mut magic).map_err(map_io)?;
    let (var_inverted, has_params) = if magic[..] == *BINHMM_MAGIC_V1 {
        (false, false)
    } else if magic[..] == BINHMM_MAGIC_V2[..8] {
        // V2 magic is 9 bytes, pull the ninth then the qualifier list.
        let ninth = r.read_u8().map_err(map_io)?;
        if ninth != BINHMM_MAGIC_V2[8] {
            return Err(bad("corrupt V2 magic".into()));
        }
        let nqual = r.read_u8().map_err(map_io)?;
        let mut quals = vec![0u8; nqual as usize];
        r.read_exact(&mut quals).map_err(map_io)?;
        for q in &quals {
            if ![V2_QUAL_VARINV, V2_QUAL_EMBEDPARA, V2_QUAL_MPDFMACRO].contains(q) {
                return Err(bad(format!("unknown V2 qualifier {:?}", *q as char)));
            }
        }
        (
            quals.contains(&V2_QUAL_VARINV),
            quals.contains(&V2_QUAL_EMBEDPARA),
        )
    } else {
        return Err(bad("bad magic".into()));
    };

    let kind_code = r.read_u16::<BigEndian>().map_err(map_io)?;
    let param_kind = ParamKind::from_code(kind_code)
        .ok_or_else(|| bad(format!("bad parameter kind code {:#06x}", kind_code)))?;
    let dim = r.read_u16::<BigEndian>().map_err(map_io)? as usize;
    if has_params {
        let len = r.read_u32::<BigEndian>().map_err(map_io)?;
        let mut blob = vec![0u8; len as usize];
        r.read_exact(&mut blob).map_err(map_io)?;
        debug!("skipping {} bytes of embedded analysis parameters", len);
    }

    let ngauss = r.read_u32::<BigEndian>().map_err(map_io)?;
    let mut gaussians = Vec::with_capacity(ngauss as usize);
    for _ in 0..ngauss {
        let mut mean = Vec::with_capacity(dim);
        for _ in 0..dim {
            mean.push(r.read_f32::<BigEndian>().map_err(map_io)?);
        }
        let mut var = Vec::with_capacity(dim);
        for _ in 0..dim {
            var.push(r.read_f32::<BigEndian>().map_err(map_io)?);
        }
        let gconst = r.read_f32::<BigEndian>().map_err(map_io)?;
        let inv_var = if var_inverted {
            var
        } else {
            var.iter().map(|v| 1.0 / v).collect()
        };
        gaussians.push(Gaussian {
            mean,
            inv_var,
            gconst,
        });
    }

    let nstate = r.read_u32::<BigEndian>().map_err(map_io)?;
    let mut states = Vec::with_capacity(nstate as usize);
    for _ in 0..nstate {
        let tag = r.read_u8().map_err(map_io)?;
        let pdf = match tag {
            0 => {
                let mixnum = r.read_u16::<BigEndian>().map_err(map_io)?;
                let mut log_weights = Vec::with_capacity(mixnum as usize);
                let mut ids = Vec::with_capacity(mixnum as usize);
                for _ in 0..mixnum {
                    log_weights.push(r.read_f32::<BigEndian>().map_err(map_io)?);
                    ids.push(r.read_u32::<BigEndian>().map_err(map_io)?);
                }
                StatePdf::Gmm {
                    log_weights,
                    gaussians: ids,
                }
            }
            1 => StatePdf::Dnn {
                senone: r.read_u32::<BigEndian>().map_err(map_io)?,
            },
            t => return Err(bad(format!("unknown state pdf tag {}", t))),
        };
        states.push(HmmState { pdf });
    }

    let nphys = r.read_u32::<BigEndian>().map_err(map_io)?;
    let mut phys = Vec::with_capacity(nphys as usize);
    for _ in 0..nphys {
        let name = read_str(&mut r).map_err(map_io)?;
        let n = r.read_u16::<BigEndian>().map_err(map_io)? as usize;
        if n < 3 {
            return Err(bad(format!("model \"{}\" has no emitting state", name)));
        }
        let mut emitting = Vec::with_capacity(n - 2);
        for _ in 0..n - 2 {
            emitting.push(r.read_u32::<BigEndian>().map_err(map_io)?);
        }
        let mut trans = Vec::with_capacity(n * n);
        for _ in 0..n * n {
            trans.push(r.read_f32::<BigEndian>().map_err(map_io)?);
        }
        phys.push(PhysicalHmm {
            name,
            nstate: n,
            states: emitting,
            trans,
        });
    }

    let nlogical = r.read_u32::<BigEndian>().map_err(map_io)?;
    let mut logical = AHashMap::with_capacity(nlogical as usize);
    for _ in 0..nlogical {
        let name = read_str(&mut r).map_err(map_io)?;
        let id = r.read_u32::<BigEndian>().map_err(map_io)?;
        if id as usize >= phys.len() {
            return Err(bad(format!("logical \"{}\" points past model table", name)));
        }
        logical.insert(name, PhoneModel::Physical(id));
    }
    let senone_count = r.read_u32::<BigEndian>().map_err(map_io)? as usize;

    let mut model = AcousticModel {
        param_kind,
        dim,
        gaussians,
        states,
        phys,
        cdsets: Vec::new(),
        logical,
        senone_count,
    };
    build_cdsets(&mut model);
    Ok(model)
}

fn write_str(w: &mut impl Write, s: &str) -> io::Result<()> {
    w.write_u16::<BigEndian>(s.len() as u16)?;
    w.write_all(s.as_bytes())
}

fn read_str(r: &mut impl Read) -> io::Result<String> {
    let len = r.read_u16::<BigEndian>()?;
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// A two-model monophone set with one shared transition macro and one shared state, used by
/// tests across the crate.
#[cfg(test)]
pub(crate) const SMALL_HMMDEFS: &str = r#"
~o <STREAMINFO> 1 2 <VECSIZE> 2 <MFCC> <DIAGC> <NULLD>
~t "tr3" <TRANSP> 4
 0.0 1.0 0.0 0.0
 0.0 0.6 0.4 0.0
 0.0 0.0 0.6 0.4
 0.0 0.0 0.0 0.0
~s "sil_mid" <NUMMIXES> 2
 <MIXTURE> 1 0.5 <MEAN> 2 0.0 0.0 <VARIANCE> 2 1.0 1.0
 <MIXTURE> 2 0.5 <MEAN> 2 1.0 1.0 <VARIANCE> 2 1.0 1.0
~h "a" <BEGINHMM> <NUMSTATES> 4
 <STATE> 2 <MEAN> 2 1.0 0.0 <VARIANCE> 2 1.0 1.0
 <STATE> 3 ~s "sil_mid"
 ~t "tr3"
<ENDHMM>
~h "b" <BEGINHMM> <NUMSTATES> 4
 <STATE> 2 <MEAN> 2 -1.0 0.0 <VARIANCE> 2 1.0 1.0
 <STATE> 3 <MEAN> 2 -2.0 0.0 <VARIANCE> 2 2.0 0.5 <GCONST> 3.0
 ~t "tr3"
<ENDHMM>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmm::StateRef;
    use std::io::Cursor;

    fn small_model() -> AcousticModel {
        let mut b = ModelBuilder::new();
        b.parse_hmmdefs_text(SMALL_HMMDEFS, "test").unwrap();
        b.build().unwrap()
    }

    #[test]
    fn parses_macros_and_sharing() {
        let m = small_model();
        assert_eq!(m.phys.len(), 2);
        assert_eq!(m.dim, 2);
        let a = &m.phys[0];
        assert_eq!(a.name, "a");
        assert_eq!(a.nstate, 4);
        assert_eq!(a.emitting_len(), 2);
        assert!((a.trans(1, 2) - 0.4f32.ln()).abs() < 1e-6);
        // Shared ~t means identical log matrices.
        let b = &m.phys[1];
        assert_eq!(a.trans, b.trans);
        // Explicit GCONST is preserved rather than recomputed.
        let gid = match &m.states[b.states[1] as usize].pdf {
            StatePdf::Gmm { gaussians, .. } => gaussians[0],
            _ => panic!("expected a mixture pdf"),
        };
        assert_eq!(m.gaussians[gid as usize].gconst, 3.0);
    }

    #[test]
    fn logical_fallback_to_self() {
        let m = small_model();
        assert!(matches!(m.lookup("a"), Some(PhoneModel::Physical(_))));
        assert!(m.lookup("z").is_none());
    }

    #[test]
    fn hmmlist_maps_triphones() {
        let mut b = ModelBuilder::new();
        b.parse_hmmdefs_text(SMALL_HMMDEFS, "test").unwrap();
        b.parse_hmmlist_reader(
            Cursor::new("b-a+b a\n# comment\na-b+a b\n"),
            "list",
        )
        .unwrap();
        let m = b.build().unwrap();
        let tri = m.lookup("b-a+b").unwrap();
        let mono = m.lookup("a").unwrap();
        assert_eq!(tri, mono);
        // Pseudo sets exist for the partial contexts of the mapped triphones.
        assert!(matches!(m.lookup("a+b"), Some(PhoneModel::Pseudo(_))));
        assert!(matches!(m.lookup("b-a"), Some(PhoneModel::Pseudo(_))));
        // The bare monophone already has a real model so no pseudo shadows it.
        assert!(matches!(m.lookup("a"), Some(PhoneModel::Physical(_))));
    }

    #[test]
    fn resolve_falls_back_through_contexts() {
        let mut b = ModelBuilder::new();
        b.parse_hmmdefs_text(SMALL_HMMDEFS, "test").unwrap();
        b.parse_hmmlist_reader(Cursor::new("b-a+b a\n"), "list").unwrap();
        let m = b.build().unwrap();
        // Unseen left context: falls back to the "a+b" pseudo set.
        let got = m.resolve("x-a+b").unwrap();
        assert_eq!(got, m.lookup("a+b").unwrap());
        // Entirely unseen context falls back to the monophone.
        let got = m.resolve("x-a+y").unwrap();
        assert_eq!(got, m.lookup("a").unwrap());
        let states = m.phone_states(m.lookup("a+b").unwrap());
        assert!(matches!(states[0], StateRef::Pooled { position: 0, .. }));
    }

    #[test]
    fn binary_round_trip() {
        let m = small_model();
        let mut bytes = Vec::new();
        write_binhmm(&m, &mut bytes, Some(b"analysis-blob")).unwrap();
        assert_eq!(&bytes[..9], BINHMM_MAGIC_V2);
        let back = read_binhmm(Cursor::new(bytes)).unwrap();
        assert_eq!(back.phys.len(), m.phys.len());
        assert_eq!(back.dim, m.dim);
        assert_eq!(back.param_kind, m.param_kind);
        assert_eq!(back.gaussians.len(), m.gaussians.len());
        for (a, b) in m.gaussians.iter().zip(&back.gaussians) {
            assert_eq!(a.mean, b.mean);
            assert_eq!(a.inv_var, b.inv_var);
            assert_eq!(a.gconst, b.gconst);
        }
        for (a, b) in m.phys.iter().zip(&back.phys) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.trans, b.trans);
        }
    }

    #[test]
    fn rejects_malformed() {
        let mut b = ModelBuilder::new();
        assert!(b
            .parse_hmmdefs_text("~h \"x\" <BEGINHMM> <NUMSTATES> 2 <ENDHMM>", "t")
            .is_err());
        let mut b = ModelBuilder::new();
        // Undefined ~t macro only surfaces at build time.
        b.parse_hmmdefs_text(
            "~o <VECSIZE> 1 <MFCC>\n~h \"x\" <BEGINHMM> <NUMSTATES> 3 <STATE> 2 <MEAN> 1 0.0 <VARIANCE> 1 1.0 ~t \"nope\" <ENDHMM>",
            "t",
        )
        .unwrap();
        assert!(b.build().is_err());
    }
}
