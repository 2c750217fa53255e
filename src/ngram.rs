//! Back-off N-gram storage. The tuples live in packed per-level arrays: level 0 is the
//! vocabulary, level k holds all (k+1)-gram tuples sorted so that the children of one context
//! are a contiguous, word-sorted run addressed by a (begin, count) range in the level above.
//! Context pointers use 24-bit split storage when the entry count allows it and plain 32-bit
//! otherwise, chosen per level at build time.
//!
//! Back-off weights only matter for contexts that actually extend to a higher order, so they are
//! *compacted*: an auxiliary entry→context map skips the entries without successors. When a
//! level turns out to have a non-zero back-off weight on a context with no successors the
//! compaction for that level is abandoned and full arrays are kept, matching what the weights
//! mean semantically.
//!
//! Scores are natural logs internally; the ARPA layer converts from and to base 10 at the
//! boundary.
use ahash::AHashMap;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use tracing::{info, warn};

use crate::error::ModelError;
use crate::lm::{Direction, LangModel, LmId};
use crate::logprob::{LogProb, LOG_ZERO};

pub const DEFAULT_BOS: &str = "<s>";
pub const DEFAULT_EOS: &str = "</s>";
pub const DEFAULT_UNK: &str = "<unk>";

const NGRAM_MAGIC: &[u8] = b"HRKNGRM1";
const INVALID_INDEX: u32 = u32::MAX;
/// Largest index representable in the split 24-bit form (reserving the all-ones sentinel).
const MAX_24BIT: u32 = 0x00ff_fffe;

/// Context index storage: 32-bit, or split 24-bit when the level is small enough.
#[derive(Clone, Debug)]
enum IndexStore {
    Wide(Vec<u32>),
    Packed { upper: Vec<u8>, lower: Vec<u16> },
}

impl IndexStore {
    fn with_capacity(packed: bool, cap: usize) -> Self {
        if packed {
            Self::Packed {
                upper: Vec::with_capacity(cap),
                lower: Vec::with_capacity(cap),
            }
        } else {
            Self::Wide(Vec::with_capacity(cap))
        }
    }

    fn push(&mut self, v: u32) {
        match self {
            Self::Wide(w) => w.push(v),
            Self::Packed { upper, lower } => {
                if v == INVALID_INDEX {
                    upper.push(0xff);
                    lower.push(0xffff);
                } else {
                    debug_assert!(v <= MAX_24BIT);
                    upper.push((v >> 16) as u8);
                    lower.push((v & 0xffff) as u16);
                }
            }
        }
    }

    fn get(&self, i: usize) -> u32 {
        match self {
            Self::Wide(w) => w[i],
            Self::Packed { upper, lower } => {
                if upper[i] == 0xff && lower[i] == 0xffff {
                    INVALID_INDEX
                } else {
                    ((upper[i] as u32) << 16) | lower[i] as u32
                }
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Wide(w) => w.len(),
            Self::Packed { upper, .. } => upper.len(),
        }
    }

    fn is_packed(&self) -> bool {
        matches!(self, Self::Packed { .. })
    }
}

#[derive(Clone, Debug)]
struct Level {
    /// log P of each tuple.
    logp: Vec<f32>,
    /// Last word of each tuple. Level 0 is the identity and leaves this empty.
    word: Vec<LmId>,
    /// Parent context entry in the level below (levels > 0 only).
    parent: Vec<u32>,
    /// Entry → compacted context id; identity when `compacted` is false.
    ctid: IndexStore,
    /// Per context: back-off weight and the child run in the next level.
    bo_wt: Vec<f32>,
    child_bgn: IndexStore,
    child_num: Vec<u32>,
    compacted: bool,
}

impl Level {
    fn len(&self) -> usize {
        self.logp.len()
    }

    fn context_of(&self, entry: u32) -> u32 {
        if self.compacted {
            self.ctid.get(entry as usize)
        } else {
            entry
        }
    }
}

#[derive(Clone, Debug)]
pub struct NGram {
    n: usize,
    dir: Direction,
    names: Vec<String>,
    index: AHashMap<String, LmId>,
    levels: Vec<Level>,
    bos: Option<LmId>,
    eos: Option<LmId>,
    unk: Option<LmId>,
}

/// Accumulates tuples in sorted maps, then freezes them into the packed arrays.
pub struct NGramBuilder {
    n: usize,
    dir: Direction,
    names: Vec<String>,
    index: AHashMap<String, LmId>,
    tuples: Vec<BTreeMap<Vec<LmId>, (f32, f32)>>,
}

impl NGramBuilder {
    pub fn new(n: usize, dir: Direction) -> Self {
        Self {
            n,
            dir,
            names: Vec::new(),
            index: AHashMap::new(),
            tuples: (0..n).map(|_| BTreeMap::new()).collect(),
        }
    }

    pub fn order(&self) -> usize {
        self.n
    }

    /// Interns an entry name, assigning ids in first-seen order so they follow the unigram
    /// section of the source file.
    pub fn intern(&mut self, name: &str) -> LmId {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = self.names.len() as LmId;
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), id);
        id
    }

    /// Adds one tuple at `level` (0-based) with natural-log probability and back-off weight.
    pub fn add(&mut self, level: usize, tuple: Vec<LmId>, logp: f32, bo_wt: f32) {
        debug_assert_eq!(tuple.len(), level + 1);
        self.tuples[level].insert(tuple, (logp, bo_wt));
    }

    pub fn build(self) -> Result<NGram, ModelError> {
        let bad = |msg: String| ModelError::Malformed {
            what: "N-gram",
            msg,
        };
        let vocab = self.names.len();
        if self.tuples.is_empty() || self.tuples[0].len() != vocab {
            return Err(bad(format!(
                "{} unigram entries for {} vocabulary words",
                self.tuples.first().map(|t| t.len()).unwrap_or(0),
                vocab
            )));
        }

        // Freeze each level: BTreeMap iteration gives lexicographic tuple order, which makes
        // the children of every context contiguous and sorted by last word.
        let mut levels: Vec<Level> = Vec::with_capacity(self.n);
        let mut entry_of: AHashMap<Vec<LmId>, u32> = AHashMap::new();
        for (k, tuples) in self.tuples.iter().enumerate() {
            let count = tuples.len();
            let mut logp = Vec::with_capacity(count);
            let mut word = Vec::with_capacity(count);
            let mut parent = Vec::with_capacity(count);
            let mut bo = Vec::with_capacity(count);
            let mut next_entry_of: AHashMap<Vec<LmId>, u32> = AHashMap::with_capacity(count);
            for (i, (tuple, (p, b))) in tuples.iter().enumerate() {
                if k == 0 {
                    let w = tuple[0];
                    if w as usize != i {
                        return Err(bad("unigram section does not cover the vocabulary".into()));
                    }
                } else {
                    let ctx = &tuple[..k];
                    let Some(&pidx) = entry_of.get(ctx) else {
                        return Err(bad(format!(
                            "{}-gram tuple {:?} has no {}-gram context",
                            k + 1,
                            tuple,
                            k
                        )));
                    };
                    parent.push(pidx);
                    word.push(tuple[k]);
                }
                logp.push(*p);
                bo.push(*b);
                next_entry_of.insert(tuple.clone(), i as u32);
            }
            entry_of = next_entry_of;
            levels.push(Level {
                logp,
                word,
                parent,
                ctid: IndexStore::Wide(Vec::new()),
                bo_wt: bo,
                child_bgn: IndexStore::Wide(Vec::new()),
                child_num: Vec::new(),
                compacted: false,
            });
        }

        // Child ranges: walk level k+1 grouping by parent (parents arrive in increasing order
        // thanks to the lexicographic sort).
        for k in 0..self.n - 1 {
            let upper_len = levels[k + 1].len();
            let this_len = levels[k].len();
            let mut bgn = vec![INVALID_INDEX; this_len];
            let mut num = vec![0u32; this_len];
            for e in 0..upper_len {
                let p = levels[k + 1].parent[e] as usize;
                if bgn[p] == INVALID_INDEX {
                    bgn[p] = e as u32;
                }
                num[p] += 1;
            }

            // Compaction: keep back-off and child tables only for contexts with successors.
            let with_children = bgn.iter().filter(|&&b| b != INVALID_INDEX).count();
            let losable = (0..this_len)
                .all(|i| bgn[i] != INVALID_INDEX || levels[k].bo_wt[i] == 0.0);
            let compact = losable && with_children < this_len;
            if !losable {
                warn!(
                    "{}-gram has non-zero back-off weight on a context without successors, \
                     compaction disabled",
                    k + 1
                );
            }
            let packed = (upper_len as u32) <= MAX_24BIT && (this_len as u32) <= MAX_24BIT;
            if compact {
                let mut ctid = IndexStore::with_capacity(packed, this_len);
                let mut c_bo = Vec::with_capacity(with_children);
                let mut c_bgn = IndexStore::with_capacity(packed, with_children);
                let mut c_num = Vec::with_capacity(with_children);
                for i in 0..this_len {
                    if bgn[i] == INVALID_INDEX {
                        ctid.push(INVALID_INDEX);
                    } else {
                        ctid.push(c_num.len() as u32);
                        c_bo.push(levels[k].bo_wt[i]);
                        c_bgn.push(bgn[i]);
                        c_num.push(num[i]);
                    }
                }
                info!(
                    "{}-gram context compaction: {} -> {}",
                    k + 1,
                    this_len,
                    c_num.len()
                );
                let level = &mut levels[k];
                level.ctid = ctid;
                level.bo_wt = c_bo;
                level.child_bgn = c_bgn;
                level.child_num = c_num;
                level.compacted = true;
            } else {
                let mut c_bgn = IndexStore::with_capacity(packed, this_len);
                for b in &bgn {
                    c_bgn.push(*b);
                }
                let level = &mut levels[k];
                level.child_bgn = c_bgn;
                level.child_num = num;
                level.compacted = false;
            }
        }

        let index = self.index;
        let bos = index.get(DEFAULT_BOS).copied();
        let eos = index.get(DEFAULT_EOS).copied();
        let unk = index
            .get(DEFAULT_UNK)
            .or_else(|| index.get("<UNK>"))
            .copied();
        let ngram = NGram {
            n: self.n,
            dir: self.dir,
            names: self.names,
            index,
            levels,
            bos,
            eos,
            unk,
        };
        ngram.log_summary();
        Ok(ngram)
    }
}

impl NGram {
    pub fn order(&self) -> usize {
        self.n
    }

    pub fn direction(&self) -> Direction {
        self.dir
    }

    pub fn vocab_len(&self) -> usize {
        self.names.len()
    }

    pub fn name(&self, id: LmId) -> &str {
        &self.names[id as usize]
    }

    pub fn level_len(&self, level: usize) -> usize {
        self.levels[level].len()
    }

    /// Open-vocabulary iff an `<unk>` entry exists.
    pub fn is_open(&self) -> bool {
        self.unk.is_some()
    }

    fn log_summary(&self) {
        let mut bytes = 0usize;
        for l in &self.levels {
            bytes += l.logp.len() * 4 + l.word.len() * 4 + l.parent.len() * 4;
            bytes += l.bo_wt.len() * 4 + l.child_num.len() * 4;
            bytes += l.child_bgn.len() * if l.child_bgn.is_packed() { 3 } else { 4 };
            bytes += l.ctid.len() * if l.ctid.is_packed() { 3 } else { 4 };
        }
        let counts: Vec<String> = self
            .levels
            .iter()
            .enumerate()
            .map(|(k, l)| format!("{}-gram {}", k + 1, l.len()))
            .collect();
        info!(
            "N-gram loaded ({:?}): {}, ~{} kB",
            self.dir,
            counts.join(", "),
            bytes / 1024
        );
    }

    /// Finds the entry of a full tuple, if stored. `tuple` is oldest-first.
    fn find_tuple(&self, tuple: &[LmId]) -> Option<u32> {
        let first = tuple[0];
        if first as usize >= self.levels[0].len() {
            return None;
        }
        let mut entry = first;
        for (k, &w) in tuple.iter().enumerate().skip(1) {
            entry = self.find_child(k - 1, entry, w)?;
        }
        Some(entry)
    }

    /// Child of `ctx_entry` (an entry of `level`) with last word `w`, by binary search over the
    /// word-sorted child run.
    fn find_child(&self, level: usize, ctx_entry: u32, w: LmId) -> Option<u32> {
        let l = &self.levels[level];
        let ct = l.context_of(ctx_entry);
        if ct == INVALID_INDEX {
            return None;
        }
        let bgn = l.child_bgn.get(ct as usize);
        if bgn == INVALID_INDEX {
            return None;
        }
        let num = l.child_num[ct as usize] as usize;
        let words = &self.levels[level + 1].word[bgn as usize..bgn as usize + num];
        let off = words.binary_search(&w).ok()?;
        Some(bgn + off as u32)
    }

    fn context_bo(&self, level: usize, ctx_entry: u32) -> f32 {
        let l = &self.levels[level];
        let ct = l.context_of(ctx_entry);
        if ct == INVALID_INDEX {
            0.0
        } else if l.compacted {
            l.bo_wt[ct as usize]
        } else {
            l.bo_wt[ctx_entry as usize]
        }
    }

    /// Back-off probability of `w` given `ctx` (oldest first), Katz style: use the longest
    /// stored tuple, otherwise back off through the context's weight.
    fn prob_backoff(&self, ctx: &[LmId], w: LmId) -> LogProb {
        if w as usize >= self.levels[0].len() {
            return LOG_ZERO;
        }
        if ctx.is_empty() {
            return self.levels[0].logp[w as usize];
        }
        match self.find_tuple(ctx) {
            Some(entry) => {
                let level = ctx.len() - 1;
                if let Some(e) = self.find_child(level, entry, w) {
                    return self.levels[level + 1].logp[e as usize];
                }
                self.context_bo(level, entry) + self.prob_backoff(&ctx[1..], w)
            }
            None => self.prob_backoff(&ctx[1..], w),
        }
    }

    fn resolve(&self, w: LmId) -> Option<LmId> {
        if (w as usize) < self.names.len() {
            Some(w)
        } else {
            self.unk
        }
    }

    /// Exposes tuples for the ARPA writer: (tuple oldest-first, logp, bo_wt).
    pub(crate) fn tuples(&self, level: usize) -> Vec<(Vec<LmId>, f32, f32)> {
        let l = &self.levels[level];
        let mut out = Vec::with_capacity(l.len());
        for e in 0..l.len() as u32 {
            let mut tuple = Vec::with_capacity(level + 1);
            let mut lv = level;
            let mut cur = e;
            loop {
                if lv == 0 {
                    tuple.push(cur);
                    break;
                }
                tuple.push(self.levels[lv].word[cur as usize]);
                cur = self.levels[lv].parent[cur as usize];
                lv -= 1;
            }
            tuple.reverse();
            let bo = if level < self.n - 1 {
                let ct = l.context_of(e);
                if ct == INVALID_INDEX {
                    0.0
                } else if l.compacted {
                    l.bo_wt[ct as usize]
                } else {
                    l.bo_wt[e as usize]
                }
            } else {
                0.0
            };
            out.push((tuple, l.logp[e as usize], bo));
        }
        out
    }

    /// Writes the packed representation. Same big-endian conventions as the other binary model
    /// dumps in this crate.
    pub fn write_binary(&self, mut w: impl Write) -> io::Result<()> {
        w.write_all(NGRAM_MAGIC)?;
        w.write_u8(match self.dir {
            Direction::Forward => 0,
            Direction::Reverse => 1,
        })?;
        w.write_u8(self.n as u8)?;
        w.write_u32::<BigEndian>(self.names.len() as u32)?;
        for name in &self.names {
            w.write_u16::<BigEndian>(name.len() as u16)?;
            w.write_all(name.as_bytes())?;
        }
        for (k, l) in self.levels.iter().enumerate() {
            w.write_u32::<BigEndian>(l.len() as u32)?;
            for v in &l.logp {
                w.write_f32::<BigEndian>(*v)?;
            }
            if k > 0 {
                for v in &l.word {
                    w.write_u32::<BigEndian>(*v)?;
                }
                for v in &l.parent {
                    w.write_u32::<BigEndian>(*v)?;
                }
            }
            if k < self.n - 1 {
                w.write_u8(l.compacted as u8)?;
                w.write_u8(l.ctid.is_packed() as u8)?;
                if l.compacted {
                    w.write_u32::<BigEndian>(l.ctid.len() as u32)?;
                    for i in 0..l.ctid.len() {
                        w.write_u32::<BigEndian>(l.ctid.get(i))?;
                    }
                }
                w.write_u32::<BigEndian>(l.bo_wt.len() as u32)?;
                for v in &l.bo_wt {
                    w.write_f32::<BigEndian>(*v)?;
                }
                for i in 0..l.child_bgn.len() {
                    w.write_u32::<BigEndian>(l.child_bgn.get(i))?;
                }
                for v in &l.child_num {
                    w.write_u32::<BigEndian>(*v)?;
                }
            }
        }
        Ok(())
    }

    pub fn read_binary(mut r: impl Read) -> Result<Self, ModelError> {
        let bad = |msg: &str| ModelError::Malformed {
            what: "binary N-gram",
            msg: msg.to_string(),
        };
        let map_io = |e: io::Error| ModelError::Malformed {
            what: "binary N-gram",
            msg: e.to_string(),
        };
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic).map_err(map_io)?;
        if magic[..] != *NGRAM_MAGIC {
            return Err(bad("bad magic"));
        }
        let dir = match r.read_u8().map_err(map_io)? {
            0 => Direction::Forward,
            1 => Direction::Reverse,
            _ => return Err(bad("bad direction tag")),
        };
        let n = r.read_u8().map_err(map_io)? as usize;
        let vocab = r.read_u32::<BigEndian>().map_err(map_io)? as usize;
        let mut names = Vec::with_capacity(vocab);
        let mut index = AHashMap::with_capacity(vocab);
        for i in 0..vocab {
            let len = r.read_u16::<BigEndian>().map_err(map_io)? as usize;
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf).map_err(map_io)?;
            let name = String::from_utf8(buf).map_err(|_| bad("non-utf8 entry name"))?;
            index.insert(name.clone(), i as LmId);
            names.push(name);
        }
        let mut levels = Vec::with_capacity(n);
        for k in 0..n {
            let count = r.read_u32::<BigEndian>().map_err(map_io)? as usize;
            let mut logp = Vec::with_capacity(count);
            for _ in 0..count {
                logp.push(r.read_f32::<BigEndian>().map_err(map_io)?);
            }
            let (mut word, mut parent) = (Vec::new(), Vec::new());
            if k > 0 {
                word.reserve(count);
                for _ in 0..count {
                    word.push(r.read_u32::<BigEndian>().map_err(map_io)?);
                }
                parent.reserve(count);
                for _ in 0..count {
                    parent.push(r.read_u32::<BigEndian>().map_err(map_io)?);
                }
            }
            let mut level = Level {
                logp,
                word,
                parent,
                ctid: IndexStore::Wide(Vec::new()),
                bo_wt: Vec::new(),
                child_bgn: IndexStore::Wide(Vec::new()),
                child_num: Vec::new(),
                compacted: false,
            };
            if k < n - 1 {
                level.compacted = r.read_u8().map_err(map_io)? != 0;
                let packed = r.read_u8().map_err(map_io)? != 0;
                if level.compacted {
                    let clen = r.read_u32::<BigEndian>().map_err(map_io)? as usize;
                    let mut ctid = IndexStore::with_capacity(packed, clen);
                    for _ in 0..clen {
                        ctid.push(r.read_u32::<BigEndian>().map_err(map_io)?);
                    }
                    level.ctid = ctid;
                }
                let blen = r.read_u32::<BigEndian>().map_err(map_io)? as usize;
                for _ in 0..blen {
                    level.bo_wt.push(r.read_f32::<BigEndian>().map_err(map_io)?);
                }
                let mut bgn = IndexStore::with_capacity(packed, blen);
                for _ in 0..blen {
                    bgn.push(r.read_u32::<BigEndian>().map_err(map_io)?);
                }
                level.child_bgn = bgn;
                for _ in 0..blen {
                    level.child_num.push(r.read_u32::<BigEndian>().map_err(map_io)?);
                }
            }
            levels.push(level);
        }
        let bos = index.get(DEFAULT_BOS).copied();
        let eos = index.get(DEFAULT_EOS).copied();
        let unk = index
            .get(DEFAULT_UNK)
            .or_else(|| index.get("<UNK>"))
            .copied();
        let ngram = NGram {
            n,
            dir,
            names,
            index,
            levels,
            bos,
            eos,
            unk,
        };
        ngram.log_summary();
        Ok(ngram)
    }
}

impl LangModel for NGram {
    fn entry_id(&self, name: &str) -> Option<LmId> {
        self.index.get(name).copied()
    }

    fn begin_id(&self) -> Option<LmId> {
        self.bos
    }

    fn end_id(&self) -> Option<LmId> {
        self.eos
    }

    fn unknown_id(&self) -> Option<LmId> {
        self.unk
    }

    fn logp(&self, word: LmId, context: &[LmId]) -> LogProb {
        let Some(word) = self.resolve(word) else {
            return LOG_ZERO;
        };
        match self.dir {
            // Reverse tuples condition on the following words natively: the context arrives
            // nearest-first and the tuple wants it outermost-first.
            Direction::Reverse => {
                let take = (self.n - 1).min(context.len());
                let mut ctx: Vec<LmId> = context[..take]
                    .iter()
                    .filter_map(|&c| self.resolve(c))
                    .collect();
                ctx.reverse();
                self.prob_backoff(&ctx, word)
            }
            // A forward model asked about following context gets the Bayes flip at the bigram
            // level: P(w | next) = P(next | w) P(w) / P(next). Exact for bigram models,
            // an approximation above that.
            Direction::Forward => match context.first().and_then(|&c| self.resolve(c)) {
                Some(next) => {
                    self.prob_backoff(&[word], next) + self.levels[0].logp[word as usize]
                        - self.levels[0].logp[next as usize]
                }
                None => self.levels[0].logp[word as usize],
            },
        }
    }

    fn logp_fast(&self, word: LmId, prev: LmId) -> LogProb {
        let (Some(word), Some(prev)) = (self.resolve(word), self.resolve(prev)) else {
            return LOG_ZERO;
        };
        match self.dir {
            Direction::Forward => self.prob_backoff(&[prev], word),
            // Flip the reverse bigram with Bayes: P(w|v) = P_rev(v|w) P(w) / P(v).
            Direction::Reverse => {
                self.prob_backoff(&[word], prev) + self.levels[0].logp[word as usize]
                    - self.levels[0].logp[prev as usize]
            }
        }
    }

    fn factor_bound(&self, word: LmId) -> LogProb {
        match self.resolve(word) {
            Some(w) => self.levels[0].logp[w as usize],
            None => LOG_ZERO,
        }
    }
}
