//! Log-domain arithmetic shared by the whole decoder. Everything in the engine that looks like a
//! probability is actually a natural-log probability stored as `f32`, because the products of
//! thousands of per-frame likelihoods underflow long before an utterance ends. Adding two
//! probabilities then needs `log(e^x + e^y)`, which we speed up with a precomputed table of
//! `log(1 + e^x)` so the hot mixture-summation loops never call `exp`/`ln` themselves.
use once_cell::sync::Lazy;

/// Log probability values used throughout the decoder.
pub type LogProb = f32;

/// Sentinel for "probability zero". Also returned by the acoustic scorer when asked about a frame
/// that does not exist yet, so streaming callers can poll without blocking.
pub const LOG_ZERO: LogProb = -1.0e6;

/// Difference threshold below which the smaller argument of a log-add is ignored. `log(1 + e^x)`
/// for x < -15 is below f32 precision of any realistic score anyway.
const ADD_RANGE: f32 = 15.0;

/// Resolution of the `log(1 + e^x)` table.
const TABLE_SIZE: usize = 500_000;

/// Scale factor mapping a difference in [-ADD_RANGE, 0] onto a table index.
const TABLE_MAG: f32 = TABLE_SIZE as f32 / ADD_RANGE;

static ADD_TABLE: Lazy<Vec<f32>> = Lazy::new(|| {
    let mut tbl = Vec::with_capacity(TABLE_SIZE);
    for i in 0..TABLE_SIZE {
        let x = -(ADD_RANGE * i as f32 / TABLE_SIZE as f32);
        tbl.push((1.0 + x.exp()).ln());
    }
    tbl
});

/// Force construction of the shared add table. The engine calls this once at load so the first
/// utterance doesn't pay the initialisation cost mid-decode.
pub fn prepare_add_table() {
    Lazy::force(&ADD_TABLE);
}

/// Computes `log(e^x + e^y)` via table lookup.
///
/// If the two values differ by more than the table range the larger one is returned unchanged.
#[inline]
pub fn add_log(x: LogProb, y: LogProb) -> LogProb {
    let (lo, hi) = if x < y { (x, y) } else { (y, x) };
    let diff = lo - hi;
    if diff < -ADD_RANGE {
        hi
    } else {
        let idx = (-diff * TABLE_MAG + 0.5) as usize;
        hi + ADD_TABLE[idx.min(TABLE_SIZE - 1)]
    }
}

/// Computes `log(sum_i e^{a_i})` over a slice, accumulating through the same table as [`add_log`].
pub fn add_log_array(a: &[LogProb]) -> LogProb {
    let mut acc = LOG_ZERO;
    for &v in a {
        let (lo, hi) = if v > acc { (acc, v) } else { (v, acc) };
        let diff = lo - hi;
        acc = hi;
        if diff >= -ADD_RANGE {
            let idx = (-diff * TABLE_MAG + 0.5) as usize;
            acc += ADD_TABLE[idx.min(TABLE_SIZE - 1)];
        }
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact_add(x: f32, y: f32) -> f32 {
        ((x as f64).exp() + (y as f64).exp()).ln() as f32
    }

    #[test]
    fn equal_arguments() {
        // log(e^0 + e^0) = ln 2
        let r = add_log(0.0, 0.0);
        assert!((r - 2.0f32.ln()).abs() < 1e-4, "got {}", r);
    }

    #[test]
    fn matches_exact_within_range() {
        for (x, y) in [(-1.0, -2.0), (-10.0, -3.5), (-7.25, -7.5), (0.0, -14.9)] {
            let r = add_log(x, y);
            let e = exact_add(x, y);
            assert!((r - e).abs() < 1e-4, "add_log({}, {}) = {} want {}", x, y, r, e);
        }
    }

    #[test]
    fn far_apart_returns_larger() {
        assert_eq!(add_log(-100.0, -3.0), -3.0);
        assert_eq!(add_log(-3.0, -100.0), -3.0);
        assert_eq!(add_log(LOG_ZERO, -0.5), -0.5);
    }

    #[test]
    fn array_sum() {
        let vals = [-2.0, -2.5, -3.0, -50.0];
        let exact = vals
            .iter()
            .fold(0.0f64, |acc, &v| acc + (v as f64).exp())
            .ln() as f32;
        let r = add_log_array(&vals);
        assert!((r - exact).abs() < 1e-4, "got {} want {}", r, exact);
    }

    #[test]
    fn empty_array_is_zero_probability() {
        assert_eq!(add_log_array(&[]), LOG_ZERO);
    }
}
