//! Input feature handling. The decoder itself never touches audio; it consumes sequences of
//! fixed-dimension feature vectors that some front end extracted (MFCC, filterbank, whatever the
//! acoustic model was trained on). This module holds those sequences, reads them from HTK
//! parameter files, and checks that what we were given actually matches what the model expects.
//!
//! HTK files are big-endian on disk regardless of host, so all the reads go through
//! [`byteorder::BigEndian`]. The header carries a 16-bit parameter kind code: a base type in the
//! low bits plus qualifier flags (`_E`, `_D`, `_Z`, ...) which we keep in the same packed form
//! because the acoustic model stores the code it was trained with and the two are compared
//! bit-for-bit.
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

use crate::error::ModelError;

/// Base parameter types from the HTK numbering. Only the cepstral/filterbank family is usable
/// for decoding but the other codes must still parse so we can name them in errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BaseKind {
    Waveform,
    Lpc,
    Lprefc,
    Lpcepstra,
    Lpdelcep,
    Irefc,
    Mfcc,
    Fbank,
    Melspec,
    User,
    Discrete,
}

impl BaseKind {
    fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0 => Self::Waveform,
            1 => Self::Lpc,
            2 => Self::Lprefc,
            3 => Self::Lpcepstra,
            4 => Self::Lpdelcep,
            5 => Self::Irefc,
            6 => Self::Mfcc,
            7 => Self::Fbank,
            8 => Self::Melspec,
            9 => Self::User,
            10 => Self::Discrete,
            _ => return None,
        })
    }

    fn code(self) -> u16 {
        match self {
            Self::Waveform => 0,
            Self::Lpc => 1,
            Self::Lprefc => 2,
            Self::Lpcepstra => 3,
            Self::Lpdelcep => 4,
            Self::Irefc => 5,
            Self::Mfcc => 6,
            Self::Fbank => 7,
            Self::Melspec => 8,
            Self::User => 9,
            Self::Discrete => 10,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Waveform => "WAVEFORM",
            Self::Lpc => "LPC",
            Self::Lprefc => "LPREFC",
            Self::Lpcepstra => "LPCEPSTRA",
            Self::Lpdelcep => "LPDELCEP",
            Self::Irefc => "IREFC",
            Self::Mfcc => "MFCC",
            Self::Fbank => "FBANK",
            Self::Melspec => "MELSPEC",
            Self::User => "USER",
            Self::Discrete => "DISCRETE",
        }
    }
}

/// Qualifier bits, same values as the HTK codes so the packed form round-trips through files.
pub mod qualifier {
    /// `_E` log energy appended.
    pub const ENERGY: u16 = 0x0040;
    /// `_N` absolute energy suppressed.
    pub const ENERGY_SUP: u16 = 0x0080;
    /// `_D` delta coefficients.
    pub const DELTA: u16 = 0x0100;
    /// `_A` acceleration coefficients.
    pub const ACCEL: u16 = 0x0200;
    /// `_C` compressed.
    pub const COMPRESS: u16 = 0x0400;
    /// `_Z` cepstral mean normalised.
    pub const CEPNORM: u16 = 0x0800;
    /// `_K` CRC checksum appended.
    pub const CHECKSUM: u16 = 0x1000;
    /// `_0` zeroth cepstral coefficient appended.
    pub const ZEROTH: u16 = 0x2000;
}

/// Mask extracting the base type from a packed kind code.
const BASEMASK: u16 = 0x003f;

const QUAL_TABLE: [(&str, u16); 8] = [
    ("_E", qualifier::ENERGY),
    ("_N", qualifier::ENERGY_SUP),
    ("_D", qualifier::DELTA),
    ("_A", qualifier::ACCEL),
    ("_C", qualifier::COMPRESS),
    ("_Z", qualifier::CEPNORM),
    ("_K", qualifier::CHECKSUM),
    ("_0", qualifier::ZEROTH),
];

/// A parameter kind: base type plus qualifier flag set, e.g. `MFCC_E_D_Z`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ParamKind {
    pub base: BaseKind,
    pub qualifiers: u16,
}

impl ParamKind {
    pub fn new(base: BaseKind, qualifiers: u16) -> Self {
        Self { base, qualifiers }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(Self {
            base: BaseKind::from_code(code & BASEMASK)?,
            qualifiers: code & !BASEMASK,
        })
    }

    pub fn code(self) -> u16 {
        self.base.code() | self.qualifiers
    }

    pub fn has(self, flag: u16) -> bool {
        self.qualifiers & flag != 0
    }

    /// Compatibility check between the model's trained kind and the input kind. Compression and
    /// checksum flags only describe on-disk encoding so they are ignored.
    pub fn matches(self, other: ParamKind) -> bool {
        let mask = !(qualifier::COMPRESS | qualifier::CHECKSUM);
        self.base == other.base && (self.qualifiers & mask) == (other.qualifiers & mask)
    }

    /// Guess the number of static base coefficients from a full vector length, by undoing the
    /// qualifier layout: `[base, c0?, E?] (+ deltas) (+ accels)`.
    pub fn guess_base_dim(self, veclen: usize) -> Option<usize> {
        let mut size = veclen;
        if self.has(qualifier::ENERGY_SUP) {
            size += 1;
        }
        let mut blocks = 1;
        if self.has(qualifier::DELTA) {
            blocks += 1;
        }
        if self.has(qualifier::ACCEL) {
            blocks += 1;
        }
        if size % blocks != 0 {
            return None;
        }
        size /= blocks;
        if self.has(qualifier::ENERGY) {
            size -= 1;
        }
        if self.has(qualifier::ZEROTH) {
            size -= 1;
        }
        Some(size)
    }

    /// Index of the absolute log-energy coefficient within a frame, if the kind carries one.
    pub fn energy_index(self, veclen: usize) -> Option<usize> {
        if !self.has(qualifier::ENERGY) {
            return None;
        }
        let base = self.guess_base_dim(veclen)?;
        Some(if self.has(qualifier::ZEROTH) {
            base + 1
        } else {
            base
        })
    }
}

impl FromStr for ParamKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let base_end = s.find('_').unwrap_or(s.len());
        let (base_str, mut rest) = s.split_at(base_end);
        let base = match base_str.to_ascii_uppercase().as_str() {
            "WAVEFORM" => BaseKind::Waveform,
            "LPC" => BaseKind::Lpc,
            "LPREFC" => BaseKind::Lprefc,
            "LPCEPSTRA" => BaseKind::Lpcepstra,
            "LPDELCEP" => BaseKind::Lpdelcep,
            "IREFC" => BaseKind::Irefc,
            "MFCC" => BaseKind::Mfcc,
            "FBANK" => BaseKind::Fbank,
            "MELSPEC" => BaseKind::Melspec,
            "USER" => BaseKind::User,
            "DISCRETE" => BaseKind::Discrete,
            other => {
                return Err(ModelError::Malformed {
                    what: "parameter kind",
                    msg: format!("unknown base type \"{}\"", other),
                })
            }
        };
        let mut qualifiers = 0u16;
        while !rest.is_empty() {
            let q = rest.get(..2).ok_or_else(|| ModelError::Malformed {
                what: "parameter kind",
                msg: format!("dangling qualifier in \"{}\"", s),
            })?;
            match QUAL_TABLE
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(q))
            {
                Some((_, flag)) => qualifiers |= flag,
                None => {
                    return Err(ModelError::Malformed {
                        what: "parameter kind",
                        msg: format!("unknown qualifier \"{}\" in \"{}\"", q, s),
                    })
                }
            }
            rest = &rest[2..];
        }
        Ok(Self { base, qualifiers })
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base.name())?;
        for (name, flag) in QUAL_TABLE {
            if self.qualifiers & flag != 0 {
                write!(f, "{}", name)?;
            }
        }
        Ok(())
    }
}

/// An utterance worth of feature vectors, stored as one contiguous block with a fixed stride.
#[derive(Clone, Debug)]
pub struct FeatureSet {
    kind: ParamKind,
    dim: usize,
    /// Frame shift in 100ns units, straight from the file header (0 when unknown).
    pub frame_shift: u32,
    data: Vec<f32>,
}

impl FeatureSet {
    pub fn new(kind: ParamKind, dim: usize) -> Self {
        Self {
            kind,
            dim,
            frame_shift: 0,
            data: Vec::new(),
        }
    }

    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn frame(&self, t: usize) -> Option<&[f32]> {
        let start = t.checked_mul(self.dim)?;
        self.data.get(start..start + self.dim)
    }

    pub fn push_frame(&mut self, frame: &[f32]) {
        debug_assert_eq!(frame.len(), self.dim);
        self.data.extend_from_slice(frame);
    }

    /// Reads an HTK parameter file.
    pub fn open_htk(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| ModelError::io(path, e))?;
        Self::from_htk_reader(BufReader::new(file))
    }

    /// Reads HTK parameter data from anything `Read`. Floats are byte-swapped from the file's
    /// big-endian convention.
    pub fn from_htk_reader(mut r: impl Read) -> Result<Self, ModelError> {
        let map_io = |e: io::Error| ModelError::Malformed {
            what: "HTK parameter file",
            msg: e.to_string(),
        };
        let sample_count = r.read_u32::<BigEndian>().map_err(map_io)?;
        let frame_shift = r.read_u32::<BigEndian>().map_err(map_io)?;
        let bytes_per_sample = r.read_u16::<BigEndian>().map_err(map_io)?;
        let kind_code = r.read_u16::<BigEndian>().map_err(map_io)?;

        let kind = ParamKind::from_code(kind_code).ok_or_else(|| ModelError::Malformed {
            what: "HTK parameter file",
            msg: format!("unrecognised parameter kind code {:#06x}", kind_code),
        })?;
        if kind.has(qualifier::COMPRESS) || kind.has(qualifier::CHECKSUM) {
            return Err(ModelError::Malformed {
                what: "HTK parameter file",
                msg: format!("compressed/checksummed data ({}) is not supported", kind),
            });
        }
        if matches!(kind.base, BaseKind::Waveform | BaseKind::Irefc | BaseKind::Discrete) {
            return Err(ModelError::Malformed {
                what: "HTK parameter file",
                msg: format!("{} data cannot be decoded against an HMM", kind),
            });
        }
        if bytes_per_sample == 0 || bytes_per_sample % 4 != 0 {
            return Err(ModelError::Malformed {
                what: "HTK parameter file",
                msg: format!("bad sample size {} bytes", bytes_per_sample),
            });
        }
        let dim = bytes_per_sample as usize / 4;

        let mut data = Vec::with_capacity(sample_count as usize * dim);
        for _ in 0..sample_count {
            for _ in 0..dim {
                data.push(r.read_f32::<BigEndian>().map_err(map_io)?);
            }
        }
        Ok(Self {
            kind,
            dim,
            frame_shift,
            data,
        })
    }

    /// Writes the set back out in HTK byte order. Mostly useful for tests and tooling.
    pub fn write_htk(&self, mut w: impl Write) -> io::Result<()> {
        w.write_u32::<BigEndian>(self.len() as u32)?;
        w.write_u32::<BigEndian>(self.frame_shift)?;
        w.write_u16::<BigEndian>((self.dim * 4) as u16)?;
        w.write_u16::<BigEndian>(self.kind.code())?;
        for v in &self.data {
            w.write_f32::<BigEndian>(*v)?;
        }
        Ok(())
    }
}

/// Pull iterator over input frames, the decoder's only view of the input. File-based decoding
/// wraps a [`FeatureSet`]; a streaming front end implements this directly and returns `None`
/// when the stream ends.
pub trait FrameSource {
    fn dim(&self) -> usize;
    fn kind(&self) -> ParamKind;
    fn next_frame(&mut self) -> Option<Vec<f32>>;
}

/// [`FrameSource`] over an already-loaded feature set.
pub struct FeatureStream {
    features: FeatureSet,
    cursor: usize,
}

impl FeatureStream {
    pub fn new(features: FeatureSet) -> Self {
        Self {
            features,
            cursor: 0,
        }
    }
}

impl FrameSource for FeatureStream {
    fn dim(&self) -> usize {
        self.features.dim()
    }

    fn kind(&self) -> ParamKind {
        self.features.kind()
    }

    fn next_frame(&mut self) -> Option<Vec<f32>> {
        let frame = self.features.frame(self.cursor)?.to_vec();
        self.cursor += 1;
        Some(frame)
    }
}

/// Drops frames whose absolute log-energy coefficient falls outside [-30, +30], the sign of a
/// zero-filled capture gap. Opt-in via config; with energy-normalised features the band check can
/// misfire, so it is never applied implicitly. Returns the number of frames removed, or `None`
/// when the kind carries no absolute energy term and nothing can be checked.
pub fn strip_zero_frames(features: &mut FeatureSet) -> Option<usize> {
    let eloc = features.kind.energy_index(features.dim)?;
    let dim = features.dim;
    let before = features.len();
    let mut kept = Vec::with_capacity(features.data.len());
    for t in 0..before {
        let frame = &features.data[t * dim..(t + 1) * dim];
        let e = frame[eloc];
        if !(-30.0..=30.0).contains(&e) {
            warn!("frame {} has invalid energy {}, stripped", t, e);
            continue;
        }
        kept.extend_from_slice(frame);
    }
    features.data = kept;
    let removed = before - features.len();
    if removed > 0 {
        info!("stripped {} zero-sample frames of {}", removed, before);
    }
    Some(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn kind_string_round_trip() {
        for s in ["MFCC_E_D_Z", "FBANK", "MFCC_D_A_0", "MELSPEC_E_N_D"] {
            let k = ParamKind::from_str(s).unwrap();
            assert_eq!(k.to_string(), s);
            assert_eq!(ParamKind::from_code(k.code()), Some(k));
        }
    }

    #[test]
    fn kind_rejects_garbage() {
        assert!(ParamKind::from_str("MFCC_Q").is_err());
        assert!(ParamKind::from_str("NOISE_E").is_err());
    }

    #[test]
    fn kind_compatibility_ignores_encoding_flags() {
        let a = ParamKind::from_str("MFCC_E_D").unwrap();
        let mut b = a;
        b.qualifiers |= qualifier::COMPRESS | qualifier::CHECKSUM;
        assert!(a.matches(b));
        let c = ParamKind::from_str("MFCC_E_D_Z").unwrap();
        assert!(!a.matches(c));
    }

    #[test]
    fn base_dim_guess() {
        // MFCC_E_D: (12 static + E) * 2 blocks = 26
        let k = ParamKind::from_str("MFCC_E_D").unwrap();
        assert_eq!(k.guess_base_dim(26), Some(12));
        assert_eq!(k.energy_index(26), Some(12));
        // MFCC_0_E_D_A: (12 + c0 + E) * 3 = 42
        let k = ParamKind::from_str("MFCC_E_D_A_0").unwrap();
        assert_eq!(k.guess_base_dim(42), Some(12));
        assert_eq!(k.energy_index(42), Some(13));
    }

    /// Big-endian bytes written on any host must come back as the exact float values.
    #[test]
    fn htk_byte_order_round_trip() {
        let kind = ParamKind::from_str("MFCC_E").unwrap();
        let mut set = FeatureSet::new(kind, 3);
        set.frame_shift = 100_000;
        set.push_frame(&[1.5, -2.25, 0.001]);
        set.push_frame(&[3.75e-3, 1e10, -0.0]);

        let mut bytes = Vec::new();
        set.write_htk(&mut bytes).unwrap();
        let back = FeatureSet::from_htk_reader(Cursor::new(bytes)).unwrap();

        assert_eq!(back.len(), 2);
        assert_eq!(back.dim(), 3);
        assert_eq!(back.kind(), kind);
        assert_eq!(back.frame_shift, 100_000);
        for t in 0..2 {
            assert_eq!(back.frame(t).unwrap(), set.frame(t).unwrap());
        }
    }

    #[test]
    fn htk_reader_rejects_compressed() {
        let kind = ParamKind::new(BaseKind::Mfcc, qualifier::COMPRESS);
        let mut bytes = Vec::new();
        bytes.write_u32::<BigEndian>(0).unwrap();
        bytes.write_u32::<BigEndian>(100_000).unwrap();
        bytes.write_u16::<BigEndian>(4).unwrap();
        bytes.write_u16::<BigEndian>(kind.code()).unwrap();
        assert!(FeatureSet::from_htk_reader(Cursor::new(bytes)).is_err());
    }

    #[test]
    fn zero_stripping_is_band_based() {
        let kind = ParamKind::from_str("MFCC_E").unwrap();
        // dim 3 = 2 static + energy
        let mut set = FeatureSet::new(kind, 3);
        set.push_frame(&[0.1, 0.2, 5.0]);
        set.push_frame(&[0.1, 0.2, -31.0]); // dead
        set.push_frame(&[0.1, 0.2, 42.0]); // dead
        set.push_frame(&[0.1, 0.2, 29.9]);
        assert_eq!(strip_zero_frames(&mut set), Some(2));
        assert_eq!(set.len(), 2);
        assert_eq!(set.frame(1).unwrap()[2], 29.9);

        // No energy term: nothing to check.
        let kind = ParamKind::from_str("MFCC").unwrap();
        let mut set = FeatureSet::new(kind, 3);
        set.push_frame(&[0.0, 0.0, 0.0]);
        assert_eq!(strip_zero_frames(&mut set), None);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn stream_pulls_in_order() {
        let kind = ParamKind::from_str("USER").unwrap();
        let mut set = FeatureSet::new(kind, 2);
        set.push_frame(&[1.0, 2.0]);
        set.push_frame(&[3.0, 4.0]);
        let mut src = FeatureStream::new(set);
        assert_eq!(src.next_frame(), Some(vec![1.0, 2.0]));
        assert_eq!(src.next_frame(), Some(vec![3.0, 4.0]));
        assert_eq!(src.next_frame(), None);
    }
}
