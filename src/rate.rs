//! Token-level generator rows for the absorbing-state reverse process.
//!
//! The forward CTMC has one row per sequence position: a content token can
//! only jump to the mask, and the mask can only jump to content tokens. The
//! reverse process re-weights those rows by the model score
//! (arXiv:2310.16834, Sec. 3.2):
//!
//! \[
//! \tilde{Q}[y] = Q_{\mathrm{tok}}(x_t)[y] \cdot s_\theta(x_t, t)[y],
//! \qquad
//! \tilde{Q}[x_t] = -\sum_{y \ne x_t} \tilde{Q}[y].
//! \]
//!
//! Every stepper builds its jump rates from these rows, so the zero-row-sum
//! and nonnegative-off-diagonal invariants live here, along with the checker
//! the tests use to enforce them.

use crate::{Error, Result};
use ndarray::{Array3, ArrayView2, ArrayView3};

/// Unweighted generator row per position for the absorbing forward process.
///
/// For a content token `i` the row is `-1` at coordinate `i` and `0`
/// elsewhere. For the mask token the row is `+1` at every coordinate except
/// `0` at the mask coordinate itself. `vocab` includes the mask token; the
/// mask id is `vocab - 1`.
pub fn q_tok(xt: &ArrayView2<usize>, vocab: usize) -> Array3<f32> {
    let (n, l) = xt.dim();
    let mask = vocab - 1;
    let mut q = Array3::<f32>::zeros((n, l, vocab));
    for i in 0..n {
        for j in 0..l {
            let tok = xt[[i, j]];
            debug_assert!(tok < vocab, "token id out of range");
            if tok == mask {
                for v in 0..vocab {
                    q[[i, j, v]] = 1.0;
                }
            }
            q[[i, j, tok]] -= 1.0;
        }
    }
    q
}

/// Score-weighted generator rows with the current-token coordinate closed so
/// each row sums to zero.
///
/// Rows at content positions come out identically zero: their only nonzero
/// `q_tok` coordinate is the current token, and that coordinate is overwritten
/// by the negated row sum. Mask positions carry the score at every content
/// coordinate and the negated total at the mask coordinate.
pub fn q_tilde(xt: &ArrayView2<usize>, score: &ArrayView3<f32>) -> Result<Array3<f32>> {
    let (n, l) = xt.dim();
    let (sn, sl, v) = score.dim();
    if sn != n || sl != l {
        return Err(Error::Shape("score leading axes must match xt"));
    }
    if v < 2 {
        return Err(Error::Shape("score last axis needs content and mask coords"));
    }
    let mut q = q_tok(xt, v);
    for i in 0..n {
        for j in 0..l {
            let tok = xt[[i, j]];
            let mut row_sum = 0.0f32;
            for y in 0..v {
                if y == tok {
                    q[[i, j, y]] = 0.0;
                } else {
                    q[[i, j, y]] *= score[[i, j, y]];
                    row_sum += q[[i, j, y]];
                }
            }
            q[[i, j, tok]] = -row_sum;
        }
    }
    Ok(q)
}

/// Check generator-row invariants: every entry finite, off-current
/// coordinates at least `-tol`, and row sums within `tol` of zero.
///
/// `tol` is absolute; scale it with the magnitude of the rates being checked.
pub fn validate_rate_rows(
    rate: &ArrayView3<f32>,
    xt: &ArrayView2<usize>,
    tol: f32,
) -> Result<()> {
    let (n, l, v) = rate.dim();
    if xt.dim() != (n, l) {
        return Err(Error::Shape("rate leading axes must match xt"));
    }
    if !tol.is_finite() || tol < 0.0 {
        return Err(Error::Domain("tol must be finite and >= 0"));
    }
    for i in 0..n {
        for j in 0..l {
            let tok = xt[[i, j]];
            let mut row_sum = 0.0f64;
            for y in 0..v {
                let r = rate[[i, j, y]];
                if !r.is_finite() {
                    return Err(Error::Domain("rates must be finite"));
                }
                if y != tok && r < -tol {
                    return Err(Error::Domain("off-current rates must be nonnegative"));
                }
                row_sum += f64::from(r);
            }
            if row_sum.abs() > f64::from(tol) {
                return Err(Error::Domain("rate rows must sum to zero"));
            }
        }
    }
    Ok(())
}
