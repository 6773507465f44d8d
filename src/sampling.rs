//! Sampling primitives shared by the reverse-process steppers.
//!
//! Two distributions drive every stepper: exponential holding times (for the
//! event-driven scheme) and categorical draws over per-position weight rows
//! (for everything). Both are implemented by inverse-CDF / Gumbel-max
//! transforms of plain uniform draws with an additive `eps` floor, so they
//! stay finite for zero rates and zero weights.
//!
//! Determinism contract: each function draws exactly one uniform per element
//! of the shape it fills, in row-major order. Reusing a seeded RNG replays
//! the same draws bit-for-bit.

use ndarray::{Array2, ArrayView1, ArrayView2, ArrayView3};
use rand::Rng;

/// Stabilizing floor the steppers pass to these primitives.
pub const DEFAULT_SAMPLING_EPS: f32 = 1e-6;

/// Draw one exponential holding time per element of `rate`.
///
/// Inverse-CDF sampling with a floor: for `u ~ U[0,1)`,
///
/// \[
/// \tau = -\frac{1}{\lambda + \epsilon}\,\ln(\epsilon + (1-\epsilon) u).
/// \]
///
/// The output is strictly positive whenever `rate >= 0` and `eps > 0`; a zero
/// rate yields a holding time of order `1/eps` rather than infinity, which is
/// what lets the event-driven stepper rank idle positions last instead of
/// producing NaN. With `rate == 0` **and** `eps == 0` the draw diverges to
/// `+inf`; callers must keep one of the two positive.
pub fn sample_exponential<R: Rng + ?Sized>(
    rate: &ArrayView2<f32>,
    eps: f32,
    rng: &mut R,
) -> Array2<f32> {
    let (n, l) = rate.dim();
    let mut out = Array2::<f32>::zeros((n, l));
    for i in 0..n {
        for j in 0..l {
            let u: f32 = rng.random();
            out[[i, j]] = -1.0 / (rate[[i, j]] + eps) * (eps + (1.0 - eps) * u).ln();
        }
    }
    out
}

/// Sample one index from a nonnegative (possibly unnormalized) weight row.
///
/// Gumbel-max adapted to direct weights: for `u ~ U[0,1)` the divisor
/// `g = eps - ln(eps + (1-eps) u)` lies in `(eps, eps - ln eps]`, and
/// `argmax_i w_i / g_i` is distributed like the normalized categorical over
/// `w` (as `eps -> 0`, `g` is a unit exponential and the ratio trick is
/// exact). No normalization or `ln w` is ever taken, so zero weights are
/// fine: a zero-weight index cannot win against any positive-weight index,
/// and negative entries (first-order overshoot from the Euler update) lose
/// to any positive entry. Ties resolve to the lowest index.
///
/// # Panics
///
/// Panics if `weights` is empty.
pub fn sample_categorical_row<R: Rng + ?Sized>(
    weights: &ArrayView1<f32>,
    eps: f32,
    rng: &mut R,
) -> usize {
    assert!(
        !weights.is_empty(),
        "sample_categorical_row: weights must be non-empty"
    );

    let mut best_i = 0usize;
    let mut best = f32::NEG_INFINITY;
    for (i, &w) in weights.iter().enumerate() {
        let u: f32 = rng.random();
        let g = eps - (eps + (1.0 - eps) * u).ln();
        let score = w / g;
        if score > best {
            best = score;
            best_i = i;
        }
    }
    best_i
}

/// Sample one index per `[batch, position]` row along the last axis.
///
/// The last-axis length is the number of candidate states; it need not match
/// the scheduler's vocabulary (steppers trim the mask column on the final
/// step). Draws `batch * positions * candidates` uniforms in row-major order.
///
/// # Panics
///
/// Panics if the last axis is empty.
pub fn sample_categorical<R: Rng + ?Sized>(
    weights: &ArrayView3<f32>,
    eps: f32,
    rng: &mut R,
) -> Array2<usize> {
    let (n, l, _v) = weights.dim();
    let mut out = Array2::<usize>::zeros((n, l));
    for i in 0..n {
        for j in 0..l {
            let row = weights.slice(ndarray::s![i, j, ..]);
            out[[i, j]] = sample_categorical_row(&row, eps, rng);
        }
    }
    out
}
