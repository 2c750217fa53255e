//! Feed-forward scoring network for hybrid DNN-HMM models. The network replaces the Gaussian
//! mixtures: the input is a symmetric window of feature frames spliced into one long vector, a
//! stack of fully-connected layers with ReLU (or sigmoid) squashing runs on top, and the softmax
//! output has one node per tied HMM state. Dividing the posterior by the state prior (a
//! subtraction in log domain, scaled by a tunable factor) turns it into the scaled likelihood the
//! search needs.
//!
//! The matrix-vector products dominate decoding time, so they get hand-written kernels: an
//! FMA path processing four output rows at a time, an AVX path, 4-wide SSE and NEON paths for
//! x86 and ARM hosts, and a scalar fallback. Which one runs is decided once at model
//! construction from CPU feature detection.
//! Output rows are independent, so the output layer can additionally be split across a bounded
//! set of threads; the join happens before any caller sees the result.
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use ndarray::{Array1, Array2};
use std::io::{self, Read, Write};
use tracing::info;

use crate::error::ModelError;
use crate::logprob::{add_log_array, LogProb};

const DNN_MAGIC: &[u8] = b"HRKDNN1\n";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Activation {
    Relu,
    Sigmoid,
}

/// Which matvec kernel this host can run, best first.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SimdLevel {
    Fma,
    Avx,
    Sse,
    Neon,
    Scalar,
}

impl SimdLevel {
    pub fn detect() -> Self {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            if is_x86_feature_detected!("fma") && is_x86_feature_detected!("avx") {
                return SimdLevel::Fma;
            }
            if is_x86_feature_detected!("avx") {
                return SimdLevel::Avx;
            }
            if is_x86_feature_detected!("sse3") {
                return SimdLevel::Sse;
            }
        }
        #[cfg(target_arch = "aarch64")]
        {
            if std::arch::is_aarch64_feature_detected!("neon") {
                return SimdLevel::Neon;
            }
        }
        SimdLevel::Scalar
    }
}

/// One fully-connected layer, weights row-major `[out, in]`.
#[derive(Clone, Debug)]
pub struct DnnLayer {
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
}

impl DnnLayer {
    pub fn in_dim(&self) -> usize {
        self.weights.ncols()
    }

    pub fn out_dim(&self) -> usize {
        self.weights.nrows()
    }

    /// `dst = W · src + b` over `rows`, dispatching on the chosen kernel.
    fn forward_rows(&self, src: &[f32], dst: &mut [f32], rows: std::ops::Range<usize>, simd: SimdLevel) {
        let in_dim = self.in_dim();
        let w = self
            .weights
            .as_slice()
            .expect("layer weights are standard layout");
        let b = self.bias.as_slice().expect("bias is contiguous");
        match simd {
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            SimdLevel::Fma => unsafe {
                x86::matvec_fma(w, src, b, dst, in_dim, rows);
            },
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            SimdLevel::Avx => unsafe {
                x86::matvec_avx(w, src, b, dst, in_dim, rows);
            },
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            SimdLevel::Sse => unsafe {
                x86::matvec_sse(w, src, b, dst, in_dim, rows);
            },
            #[cfg(target_arch = "aarch64")]
            SimdLevel::Neon => unsafe {
                arm::matvec_neon(w, src, b, dst, in_dim, rows);
            },
            _ => matvec_scalar(w, src, b, dst, in_dim, rows),
        }
    }

    fn forward(&self, src: &[f32], dst: &mut [f32], simd: SimdLevel, threads: usize) {
        let out = self.out_dim();
        debug_assert_eq!(src.len(), self.in_dim());
        debug_assert_eq!(dst.len(), out);
        if threads <= 1 || out < threads * 16 {
            self.forward_rows(src, dst, 0..out, simd);
            return;
        }
        // Row-parallel: each worker owns a disjoint slice of dst, joined before return.
        let chunk = out.div_ceil(threads);
        std::thread::scope(|scope| {
            for (i, piece) in dst.chunks_mut(chunk).enumerate() {
                let begin = i * chunk;
                let end = begin + piece.len();
                scope.spawn(move || {
                    self.forward_rows(src, piece, begin..end, simd);
                });
            }
        });
    }
}

fn matvec_scalar(
    w: &[f32],
    src: &[f32],
    b: &[f32],
    dst: &mut [f32],
    in_dim: usize,
    rows: std::ops::Range<usize>,
) {
    let base = rows.start;
    for row in rows {
        let wr = &w[row * in_dim..(row + 1) * in_dim];
        let mut acc = 0.0f32;
        for (wv, xv) in wr.iter().zip(src) {
            acc += wv * xv;
        }
        dst[row - base] = acc + b[row];
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod x86 {
    #[cfg(target_arch = "x86")]
    use std::arch::x86::*;
    #[cfg(target_arch = "x86_64")]
    use std::arch::x86_64::*;

    #[inline]
    unsafe fn hsum256(v: __m256) -> f32 {
        let hi = _mm256_extractf128_ps(v, 1);
        let lo = _mm256_castps256_ps128(v);
        let s = _mm_add_ps(lo, hi);
        let s = _mm_hadd_ps(s, s);
        let s = _mm_hadd_ps(s, s);
        _mm_cvtss_f32(s)
    }

    #[inline]
    unsafe fn row_tail(w: &[f32], src: &[f32], from: usize) -> f32 {
        let mut acc = 0.0f32;
        for i in from..src.len() {
            acc += w[i] * src[i];
        }
        acc
    }

    /// Four output rows per iteration, fused multiply-add over 8-wide lanes.
    #[target_feature(enable = "avx,fma")]
    pub(super) unsafe fn matvec_fma(
        w: &[f32],
        src: &[f32],
        b: &[f32],
        dst: &mut [f32],
        in_dim: usize,
        rows: std::ops::Range<usize>,
    ) {
        let n = in_dim / 8;
        let base = rows.start;
        let mut row = rows.start;
        while row + 3 < rows.end {
            let w1 = &w[row * in_dim..];
            let w2 = &w[(row + 1) * in_dim..];
            let w3 = &w[(row + 2) * in_dim..];
            let w4 = &w[(row + 3) * in_dim..];
            let mut x1 = _mm256_setzero_ps();
            let mut x2 = _mm256_setzero_ps();
            let mut x3 = _mm256_setzero_ps();
            let mut x4 = _mm256_setzero_ps();
            for j in 0..n {
                let vs = _mm256_loadu_ps(src.as_ptr().add(j * 8));
                x1 = _mm256_fmadd_ps(vs, _mm256_loadu_ps(w1.as_ptr().add(j * 8)), x1);
                x2 = _mm256_fmadd_ps(vs, _mm256_loadu_ps(w2.as_ptr().add(j * 8)), x2);
                x3 = _mm256_fmadd_ps(vs, _mm256_loadu_ps(w3.as_ptr().add(j * 8)), x3);
                x4 = _mm256_fmadd_ps(vs, _mm256_loadu_ps(w4.as_ptr().add(j * 8)), x4);
            }
            dst[row - base] = hsum256(x1) + row_tail(w1, src, n * 8) + b[row];
            dst[row + 1 - base] = hsum256(x2) + row_tail(w2, src, n * 8) + b[row + 1];
            dst[row + 2 - base] = hsum256(x3) + row_tail(w3, src, n * 8) + b[row + 2];
            dst[row + 3 - base] = hsum256(x4) + row_tail(w4, src, n * 8) + b[row + 3];
            row += 4;
        }
        while row < rows.end {
            let wr = &w[row * in_dim..];
            let mut x = _mm256_setzero_ps();
            for j in 0..n {
                let vs = _mm256_loadu_ps(src.as_ptr().add(j * 8));
                x = _mm256_fmadd_ps(vs, _mm256_loadu_ps(wr.as_ptr().add(j * 8)), x);
            }
            dst[row - base] = hsum256(x) + row_tail(wr, src, n * 8) + b[row];
            row += 1;
        }
    }

    /// 8-wide multiply-accumulate without fusion.
    #[target_feature(enable = "avx")]
    pub(super) unsafe fn matvec_avx(
        w: &[f32],
        src: &[f32],
        b: &[f32],
        dst: &mut [f32],
        in_dim: usize,
        rows: std::ops::Range<usize>,
    ) {
        let n = in_dim / 8;
        let base = rows.start;
        for row in rows {
            let wr = &w[row * in_dim..];
            let mut x = _mm256_setzero_ps();
            for j in 0..n {
                let vs = _mm256_loadu_ps(src.as_ptr().add(j * 8));
                let vw = _mm256_loadu_ps(wr.as_ptr().add(j * 8));
                x = _mm256_add_ps(x, _mm256_mul_ps(vs, vw));
            }
            dst[row - base] = hsum256(x) + row_tail(wr, src, n * 8) + b[row];
        }
    }

    /// 4-wide multiply-accumulate.
    #[target_feature(enable = "sse3")]
    pub(super) unsafe fn matvec_sse(
        w: &[f32],
        src: &[f32],
        b: &[f32],
        dst: &mut [f32],
        in_dim: usize,
        rows: std::ops::Range<usize>,
    ) {
        let n = in_dim / 4;
        let base = rows.start;
        for row in rows {
            let wr = &w[row * in_dim..];
            let mut x = _mm_setzero_ps();
            for j in 0..n {
                let vs = _mm_loadu_ps(src.as_ptr().add(j * 4));
                let vw = _mm_loadu_ps(wr.as_ptr().add(j * 4));
                x = _mm_add_ps(x, _mm_mul_ps(vs, vw));
            }
            let s = _mm_hadd_ps(x, x);
            let s = _mm_hadd_ps(s, s);
            dst[row - base] = _mm_cvtss_f32(s) + row_tail(wr, src, n * 4) + b[row];
        }
    }
}

#[cfg(target_arch = "aarch64")]
mod arm {
    use std::arch::aarch64::*;

    /// 4-wide fused multiply-accumulate over NEON lanes.
    #[target_feature(enable = "neon")]
    pub(super) unsafe fn matvec_neon(
        w: &[f32],
        src: &[f32],
        b: &[f32],
        dst: &mut [f32],
        in_dim: usize,
        rows: std::ops::Range<usize>,
    ) {
        let n = in_dim / 4;
        let base = rows.start;
        for row in rows {
            let wr = &w[row * in_dim..];
            let mut x = vdupq_n_f32(0.0);
            for j in 0..n {
                let vs = vld1q_f32(src.as_ptr().add(j * 4));
                let vw = vld1q_f32(wr.as_ptr().add(j * 4));
                x = vfmaq_f32(x, vs, vw);
            }
            let mut acc = vaddvq_f32(x);
            for i in n * 4..src.len() {
                acc += wr[i] * src[i];
            }
            dst[row - base] = acc + b[row];
        }
    }
}

/// The full network plus the prior table that converts posteriors to scaled likelihoods.
#[derive(Clone, Debug)]
pub struct DnnModel {
    pub hidden: Vec<DnnLayer>,
    pub output: DnnLayer,
    pub activation: Activation,
    /// Log state priors, one per output node.
    pub log_priors: Vec<f32>,
    pub prior_factor: f32,
    /// Context half-width C; the input window is `2C + 1` frames.
    pub context: usize,
    /// Per-frame feature dimension before splicing.
    pub frame_dim: usize,
    simd: SimdLevel,
    threads: usize,
}

impl DnnModel {
    pub fn new(
        hidden: Vec<DnnLayer>,
        output: DnnLayer,
        activation: Activation,
        log_priors: Vec<f32>,
        prior_factor: f32,
        context: usize,
        frame_dim: usize,
        threads: usize,
    ) -> Result<Self, ModelError> {
        let window = frame_dim * (2 * context + 1);
        let mut expect = window;
        for (i, layer) in hidden.iter().enumerate() {
            if layer.in_dim() != expect {
                return Err(ModelError::Malformed {
                    what: "DNN",
                    msg: format!(
                        "hidden layer {} expects {} inputs, previous layer provides {}",
                        i,
                        layer.in_dim(),
                        expect
                    ),
                });
            }
            expect = layer.out_dim();
        }
        if output.in_dim() != expect {
            return Err(ModelError::Malformed {
                what: "DNN",
                msg: format!(
                    "output layer expects {} inputs, last hidden provides {}",
                    output.in_dim(),
                    expect
                ),
            });
        }
        if log_priors.len() != output.out_dim() {
            return Err(ModelError::Malformed {
                what: "DNN",
                msg: format!(
                    "{} state priors for {} output nodes",
                    log_priors.len(),
                    output.out_dim()
                ),
            });
        }
        let simd = SimdLevel::detect();
        info!(
            "DNN: {} hidden layers, {} outputs, window {}x{}, kernel {:?}, {} threads",
            hidden.len(),
            output.out_dim(),
            2 * context + 1,
            frame_dim,
            simd,
            threads.max(1)
        );
        Ok(Self {
            hidden,
            output,
            activation,
            log_priors,
            prior_factor,
            context,
            frame_dim,
            simd,
            threads,
        })
    }

    pub fn output_dim(&self) -> usize {
        self.output.out_dim()
    }

    /// Splices the context window around frame `t`, clamping at the utterance edges.
    fn splice(&self, frames: &dyn Fn(isize) -> Option<Vec<f32>>, t: usize, len: usize) -> Vec<f32> {
        let mut input = Vec::with_capacity(self.frame_dim * (2 * self.context + 1));
        for off in -(self.context as isize)..=(self.context as isize) {
            let idx = (t as isize + off).clamp(0, len as isize - 1);
            let frame = frames(idx).expect("clamped index is in range");
            input.extend_from_slice(&frame);
        }
        input
    }

    /// Runs the network on frame `t` and returns per-senone scaled log likelihoods:
    /// `log softmax(o) - prior_factor · log P(s)`.
    pub fn score_frame(
        &self,
        frames: &dyn Fn(isize) -> Option<Vec<f32>>,
        t: usize,
        utterance_len: usize,
    ) -> Vec<LogProb> {
        let mut cur = self.splice(frames, t, utterance_len);
        let mut next = Vec::new();
        for layer in &self.hidden {
            next.resize(layer.out_dim(), 0.0);
            layer.forward(&cur, &mut next, self.simd, 1);
            for v in next.iter_mut() {
                *v = match self.activation {
                    Activation::Relu => v.max(0.0),
                    Activation::Sigmoid => sigmoid(*v),
                };
            }
            std::mem::swap(&mut cur, &mut next);
        }
        let mut out = vec![0.0f32; self.output.out_dim()];
        self.output.forward(&cur, &mut out, self.simd, self.threads);
        // log softmax, then prior division in log domain
        let norm = add_log_array(&out);
        for (i, v) in out.iter_mut().enumerate() {
            *v = *v - norm - self.prior_factor * self.log_priors[i];
        }
        out
    }

    /// Serialises the network in the same big-endian convention as the binary HMM dump.
    pub fn write(&self, mut w: impl Write) -> io::Result<()> {
        w.write_all(DNN_MAGIC)?;
        w.write_u8(match self.activation {
            Activation::Relu => 0,
            Activation::Sigmoid => 1,
        })?;
        w.write_u16::<BigEndian>(self.context as u16)?;
        w.write_u16::<BigEndian>(self.frame_dim as u16)?;
        w.write_f32::<BigEndian>(self.prior_factor)?;
        w.write_u16::<BigEndian>(self.hidden.len() as u16)?;
        for layer in self.hidden.iter().chain(std::iter::once(&self.output)) {
            w.write_u32::<BigEndian>(layer.out_dim() as u32)?;
            w.write_u32::<BigEndian>(layer.in_dim() as u32)?;
            for v in layer.weights.iter() {
                w.write_f32::<BigEndian>(*v)?;
            }
            for v in layer.bias.iter() {
                w.write_f32::<BigEndian>(*v)?;
            }
        }
        for v in &self.log_priors {
            w.write_f32::<BigEndian>(*v)?;
        }
        Ok(())
    }

    pub fn read(mut r: impl Read, threads: usize) -> Result<Self, ModelError> {
        let bad = |msg: String| ModelError::Malformed { what: "DNN", msg };
        let map_io = |e: io::Error| ModelError::Malformed {
            what: "DNN",
            msg: e.to_string(),
        };
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic).map_err(map_io)?;
        if magic[..] != *DNN_MAGIC {
            return Err(bad("bad magic".into()));
        }
        let activation = match r.read_u8().map_err(map_io)? {
            0 => Activation::Relu,
            1 => Activation::Sigmoid,
            t => return Err(bad(format!("unknown activation tag {}", t))),
        };
        let context = r.read_u16::<BigEndian>().map_err(map_io)? as usize;
        let frame_dim = r.read_u16::<BigEndian>().map_err(map_io)? as usize;
        let prior_factor = r.read_f32::<BigEndian>().map_err(map_io)?;
        let nhidden = r.read_u16::<BigEndian>().map_err(map_io)? as usize;
        let mut layers = Vec::with_capacity(nhidden + 1);
        for _ in 0..=nhidden {
            let out = r.read_u32::<BigEndian>().map_err(map_io)? as usize;
            let inp = r.read_u32::<BigEndian>().map_err(map_io)? as usize;
            let mut w = Vec::with_capacity(out * inp);
            for _ in 0..out * inp {
                w.push(r.read_f32::<BigEndian>().map_err(map_io)?);
            }
            let mut b = Vec::with_capacity(out);
            for _ in 0..out {
                b.push(r.read_f32::<BigEndian>().map_err(map_io)?);
            }
            layers.push(DnnLayer {
                weights: Array2::from_shape_vec((out, inp), w)
                    .map_err(|e| bad(e.to_string()))?,
                bias: Array1::from_vec(b),
            });
        }
        let output = layers.pop().expect("at least the output layer");
        let mut log_priors = Vec::with_capacity(output.out_dim());
        for _ in 0..output.out_dim() {
            log_priors.push(r.read_f32::<BigEndian>().map_err(map_io)?);
        }
        Self::new(
            layers,
            output,
            activation,
            log_priors,
            prior_factor,
            context,
            frame_dim,
            threads,
        )
    }
}

fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        x.exp() / (1.0 + x.exp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn tiny_model(threads: usize) -> DnnModel {
        // 1-D frames, context 1 → window of 3; one hidden layer of 2; 2 outputs.
        let hidden = DnnLayer {
            weights: array![[1.0, 0.0, -1.0], [0.5, 0.5, 0.5]],
            bias: array![0.0, -0.25],
        };
        let output = DnnLayer {
            weights: array![[1.0, 0.0], [0.0, 1.0]],
            bias: array![0.0, 0.0],
        };
        DnnModel::new(
            vec![hidden],
            output,
            Activation::Relu,
            vec![0.5f32.ln(), 0.5f32.ln()],
            1.0,
            1,
            1,
            threads,
        )
        .unwrap()
    }

    fn frames_of(data: &'static [f32]) -> impl Fn(isize) -> Option<Vec<f32>> {
        move |i: isize| data.get(i as usize).map(|v| vec![*v])
    }

    #[test]
    fn forward_matches_hand_computation() {
        let m = tiny_model(1);
        let data: &[f32] = &[1.0, 2.0, 3.0];
        let scores = m.score_frame(&frames_of(data), 1, 3);
        // window = [1, 2, 3]; hidden = relu([1-3, 0.5*6-0.25]) = [0, 2.75]
        // out = [0, 2.75]; log softmax = out - log(e^0 + e^2.75)
        let norm = (1.0 + 2.75f32.exp()).ln();
        let expect0 = 0.0 - norm - 0.5f32.ln();
        let expect1 = 2.75 - norm - 0.5f32.ln();
        assert!((scores[0] - expect0).abs() < 1e-3, "{} vs {}", scores[0], expect0);
        assert!((scores[1] - expect1).abs() < 1e-3, "{} vs {}", scores[1], expect1);
    }

    #[test]
    fn window_clamps_at_edges() {
        let m = tiny_model(1);
        let data: &[f32] = &[4.0, 5.0];
        // t = 0: window should be [4, 4, 5], not panic.
        let s0 = m.score_frame(&frames_of(data), 0, 2);
        assert_eq!(s0.len(), 2);
        // t = 1: window [4, 5, 5]
        let s1 = m.score_frame(&frames_of(data), 1, 2);
        assert!(s0 != s1);
    }

    #[test]
    fn kernels_agree_with_scalar() {
        // 19 inputs exercises the 8-wide body plus a tail; 9 rows exercises the 4-row unroll
        // plus remainder.
        let in_dim = 19;
        let out_dim = 9;
        let w: Vec<f32> = (0..in_dim * out_dim)
            .map(|i| ((i * 37 % 17) as f32 - 8.0) * 0.13)
            .collect();
        let x: Vec<f32> = (0..in_dim).map(|i| (i as f32 - 9.0) * 0.21).collect();
        let b: Vec<f32> = (0..out_dim).map(|i| i as f32 * 0.01).collect();
        let mut scalar = vec![0.0f32; out_dim];
        matvec_scalar(&w, &x, &b, &mut scalar, in_dim, 0..out_dim);

        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            if is_x86_feature_detected!("fma") && is_x86_feature_detected!("avx") {
                let mut out = vec![0.0f32; out_dim];
                unsafe { x86::matvec_fma(&w, &x, &b, &mut out, in_dim, 0..out_dim) };
                for (a, s) in out.iter().zip(&scalar) {
                    assert!((a - s).abs() < 1e-4, "fma {} vs scalar {}", a, s);
                }
            }
            if is_x86_feature_detected!("avx") {
                let mut out = vec![0.0f32; out_dim];
                unsafe { x86::matvec_avx(&w, &x, &b, &mut out, in_dim, 0..out_dim) };
                for (a, s) in out.iter().zip(&scalar) {
                    assert!((a - s).abs() < 1e-4, "avx {} vs scalar {}", a, s);
                }
            }
            if is_x86_feature_detected!("sse3") {
                let mut out = vec![0.0f32; out_dim];
                unsafe { x86::matvec_sse(&w, &x, &b, &mut out, in_dim, 0..out_dim) };
                for (a, s) in out.iter().zip(&scalar) {
                    assert!((a - s).abs() < 1e-4, "sse {} vs scalar {}", a, s);
                }
            }
        }

        #[cfg(target_arch = "aarch64")]
        {
            if std::arch::is_aarch64_feature_detected!("neon") {
                let mut out = vec![0.0f32; out_dim];
                unsafe { arm::matvec_neon(&w, &x, &b, &mut out, in_dim, 0..out_dim) };
                for (a, s) in out.iter().zip(&scalar) {
                    assert!((a - s).abs() < 1e-4, "neon {} vs scalar {}", a, s);
                }
            }
        }
    }

    #[test]
    fn threaded_output_equals_serial() {
        // Output layer big enough to trip the parallel path.
        let out_dim = 64;
        let hidden = DnnLayer {
            weights: Array2::from_shape_fn((4, 3), |(i, j)| (i + j) as f32 * 0.1),
            bias: Array1::zeros(4),
        };
        let output = DnnLayer {
            weights: Array2::from_shape_fn((out_dim, 4), |(i, j)| ((i * 7 + j) % 5) as f32 * 0.2 - 0.3),
            bias: Array1::from_shape_fn(out_dim, |i| i as f32 * 0.01),
        };
        let priors = vec![(1.0 / out_dim as f32).ln(); out_dim];
        let serial = DnnModel::new(
            vec![hidden.clone()],
            output.clone(),
            Activation::Sigmoid,
            priors.clone(),
            0.8,
            1,
            1,
            1,
        )
        .unwrap();
        let parallel =
            DnnModel::new(vec![hidden], output, Activation::Sigmoid, priors, 0.8, 1, 1, 4).unwrap();
        let data: &[f32] = &[0.3, -0.6, 0.9];
        let a = serial.score_frame(&frames_of(data), 1, 3);
        let b = parallel.score_frame(&frames_of(data), 1, 3);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn dump_round_trip() {
        let m = tiny_model(1);
        let mut bytes = Vec::new();
        m.write(&mut bytes).unwrap();
        let back = DnnModel::read(std::io::Cursor::new(bytes), 1).unwrap();
        assert_eq!(back.hidden.len(), 1);
        assert_eq!(back.activation, Activation::Relu);
        assert_eq!(back.context, 1);
        assert_eq!(back.output.weights, m.output.weights);
        assert_eq!(back.log_priors, m.log_priors);
    }

    #[test]
    fn layer_shape_mismatch_is_an_error() {
        let hidden = DnnLayer {
            weights: Array2::zeros((2, 3)),
            bias: Array1::zeros(2),
        };
        let output = DnnLayer {
            weights: Array2::zeros((2, 5)),
            bias: Array1::zeros(2),
        };
        assert!(DnnModel::new(
            vec![hidden],
            output,
            Activation::Relu,
            vec![0.0; 2],
            1.0,
            1,
            1,
            1
        )
        .is_err());
    }
}
