//! Denoising score-entropy training loss.
//!
//! Only absorbed positions contribute (arXiv:2310.16834, Thm. 3.6): with
//! \(r = 1/(e^{\bar\sigma} - 1)\), the per-position term is
//!
//! \[
//! \underbrace{\sum_{y \ne m} e^{s[y]}}_{\text{pos}}
//! - \underbrace{r\, s[x_0]}_{\text{neg}}
//! + \underbrace{r (\ln r - 1)}_{\text{const}},
//! \]
//!
//! where `s` is the predicted log-score and \(x_0\) the clean token. The
//! ratio uses `exp_m1` so small \(\bar\sigma\) does not lose precision to
//! cancellation. No \(\sigma\)-weighting is applied; the unscaled sum is
//! the training objective, and callers wanting a weighted variant scale
//! per-position terms themselves.

use crate::schedule::Scheduler;
use crate::{Error, Result};
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayView3};

/// How to collapse per-position loss terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reduction {
    /// Total over all batch items and positions.
    #[default]
    Sum,
    /// Average over all `batch * length` positions, absorbed or not.
    Mean,
}

/// Per-position score-entropy terms, `[batch, length]`.
///
/// Entries at non-absorbed positions are exactly zero. `sigma_bar` is the
/// cumulative noise of each batch item at its sampled time; it must be
/// positive for the ratio to be finite.
pub fn score_entropy_loss_per_position(
    scheduler: &Scheduler,
    log_score: &ArrayView3<f32>,
    sigma_bar: &ArrayView1<f32>,
    xt: &ArrayView2<usize>,
    x0: &ArrayView2<usize>,
) -> Result<Array2<f32>> {
    let (n, l, v) = log_score.dim();
    if v != scheduler.vocab_size() {
        return Err(Error::Shape("log_score last axis must match vocab_size"));
    }
    if xt.dim() != (n, l) || x0.dim() != (n, l) {
        return Err(Error::Shape("xt and x0 must match log_score leading axes"));
    }
    if sigma_bar.len() != n {
        return Err(Error::Shape("sigma_bar must have one entry per batch item"));
    }

    let mask = scheduler.mask_id();
    let mut loss = Array2::<f32>::zeros((n, l));
    for i in 0..n {
        let ratio = 1.0 / sigma_bar[i].exp_m1();
        let const_term = ratio * (ratio.ln() - 1.0);
        for j in 0..l {
            if xt[[i, j]] != mask {
                continue;
            }
            let y = x0[[i, j]];
            debug_assert!(y < mask, "clean token must be content");
            let neg = ratio * log_score[[i, j, y]];
            let mut pos = 0.0f32;
            for c in 0..mask {
                pos += log_score[[i, j, c]].exp();
            }
            loss[[i, j]] = pos - neg + const_term;
        }
    }
    Ok(loss)
}

/// Reduced score-entropy loss.
pub fn score_entropy_loss(
    scheduler: &Scheduler,
    log_score: &ArrayView3<f32>,
    sigma_bar: &ArrayView1<f32>,
    xt: &ArrayView2<usize>,
    x0: &ArrayView2<usize>,
    reduction: Reduction,
) -> Result<f32> {
    let per_position = score_entropy_loss_per_position(scheduler, log_score, sigma_bar, xt, x0)?;
    let total: f64 = per_position.iter().map(|&x| x as f64).sum();
    let value = match reduction {
        Reduction::Sum => total,
        Reduction::Mean => total / per_position.len() as f64,
    };
    Ok(value as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{ModelParam, ScheduleFamily, SchedulerConfig};
    use ndarray::{array, Array1, Array3};
    use proptest::prelude::*;

    fn scheduler(num_vocabs: usize, length: usize) -> Scheduler {
        Scheduler::new(SchedulerConfig {
            num_vocabs,
            length,
            eps: 1e-3,
            model: ModelParam::Sedd,
            schedule: ScheduleFamily::LogLinear,
        })
        .unwrap()
    }

    #[test]
    fn matches_a_hand_computed_single_position() {
        let sched = scheduler(2, 1);
        let log_score = array![[[-0.2f32, -1.0, 0.3]]];
        let sigma_bar = array![1.0f32];
        let xt = array![[2usize]];
        let x0 = array![[1usize]];

        let loss = score_entropy_loss(
            &sched,
            &log_score.view(),
            &sigma_bar.view(),
            &xt.view(),
            &x0.view(),
            Reduction::Sum,
        )
        .unwrap();
        // ratio = 1/(e - 1); pos = e^-0.2 + e^-1; neg = -ratio;
        // const = ratio (ln ratio - 1).
        assert!((loss - 0.8715737).abs() < 1e-4, "loss = {loss}");
    }

    #[test]
    fn non_absorbed_positions_contribute_exactly_zero() {
        let sched = scheduler(3, 4);
        let log_score = Array3::<f32>::from_shape_fn((2, 4, 4), |(i, j, v)| {
            (i as f32 - 0.5) * 2.0 + j as f32 * 0.3 - v as f32 * 0.7
        });
        let sigma_bar = array![0.8f32, 1.3];
        // Only (0, 2) and (1, 0) are absorbed.
        let xt = array![[0usize, 1, 3, 2], [3, 0, 1, 2]];
        let x0 = array![[0usize, 1, 2, 2], [1, 0, 1, 2]];

        let per = score_entropy_loss_per_position(
            &sched,
            &log_score.view(),
            &sigma_bar.view(),
            &xt.view(),
            &x0.view(),
        )
        .unwrap();
        for i in 0..2 {
            for j in 0..4 {
                if xt[[i, j]] != 3 {
                    assert_eq!(per[[i, j]], 0.0, "leak at [{i},{j}]");
                } else {
                    assert!(per[[i, j]] != 0.0);
                }
            }
        }
    }

    #[test]
    fn mean_is_sum_over_total_positions() {
        let sched = scheduler(3, 3);
        let log_score = Array3::<f32>::from_elem((2, 3, 4), -0.4);
        let sigma_bar = array![0.5f32, 2.0];
        let xt = array![[3usize, 0, 3], [1, 3, 2]];
        let x0 = array![[2usize, 0, 1], [1, 0, 2]];

        let sum = score_entropy_loss(
            &sched,
            &log_score.view(),
            &sigma_bar.view(),
            &xt.view(),
            &x0.view(),
            Reduction::Sum,
        )
        .unwrap();
        let mean = score_entropy_loss(
            &sched,
            &log_score.view(),
            &sigma_bar.view(),
            &xt.view(),
            &x0.view(),
            Reduction::Mean,
        )
        .unwrap();
        assert!((mean - sum / 6.0).abs() < 1e-6);
    }

    #[test]
    fn tiny_sigma_bar_stays_finite() {
        let sched = scheduler(2, 2);
        let log_score = Array3::<f32>::from_elem((1, 2, 3), -0.1);
        let sigma_bar = array![1e-6f32];
        let xt = array![[2usize, 0]];
        let x0 = array![[1usize, 0]];

        let loss = score_entropy_loss(
            &sched,
            &log_score.view(),
            &sigma_bar.view(),
            &xt.view(),
            &x0.view(),
            Reduction::Sum,
        )
        .unwrap();
        assert!(loss.is_finite());
        // The ratio blows up like 1/sigma_bar; the term should be large.
        assert!(loss > 1e5, "loss = {loss}");
    }

    #[test]
    fn rejects_inconsistent_shapes() {
        let sched = scheduler(3, 4);
        let sigma_bar = array![0.5f32];
        let xt = array![[3usize, 0, 3, 2]];
        let x0 = array![[1usize, 0, 2, 2]];

        let bad_vocab = Array3::<f32>::zeros((1, 4, 5));
        assert!(score_entropy_loss_per_position(
            &sched,
            &bad_vocab.view(),
            &sigma_bar.view(),
            &xt.view(),
            &x0.view(),
        )
        .is_err());

        let log_score = Array3::<f32>::zeros((1, 4, 4));
        let bad_t = array![0.5f32, 0.5];
        assert!(score_entropy_loss_per_position(
            &sched,
            &log_score.view(),
            &bad_t.view(),
            &xt.view(),
            &x0.view(),
        )
        .is_err());

        let bad_x0 = array![[1usize, 0, 2]];
        assert!(score_entropy_loss_per_position(
            &sched,
            &log_score.view(),
            &sigma_bar.view(),
            &xt.view(),
            &bad_x0.view(),
        )
        .is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_loss_is_zero_without_absorption(
            vals in prop::collection::vec(-2.0f32..2.0, 2 * 5 * 4),
            sb in prop::collection::vec(0.1f32..3.0, 2),
        ) {
            let sched = scheduler(3, 5);
            let log_score = Array3::from_shape_vec((2, 5, 4), vals).unwrap();
            let sigma_bar = Array1::from_vec(sb);
            // No mask anywhere.
            let xt = Array2::from_shape_fn((2, 5), |(i, j)| (i + j) % 3);
            let x0 = xt.clone();

            let loss = score_entropy_loss(
                &sched,
                &log_score.view(),
                &sigma_bar.view(),
                &xt.view(),
                &x0.view(),
                Reduction::Sum,
            ).unwrap();
            prop_assert_eq!(loss, 0.0);
        }
    }
}
