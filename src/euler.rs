//! Euler discretization of the reverse process.
//!
//! One step turns the reverse rate into a per-position transition
//! distribution by first-order expansion of the transition kernel
//! (arXiv:2310.16834, Sec. 4.1):
//!
//! \[
//! p(y \mid x_t) = \mathrm{onehot}(x_t)[y] + \Delta t\,\sigma(t)\,\tilde{Q}[y],
//! \]
//!
//! then samples each position independently. Rows sum to one by the
//! zero-row-sum rate invariant; for large \(\Delta t\,\sigma\) the
//! current-token entry can go negative, which the Gumbel argmax treats as
//! never winning against a positive entry. Content positions have zero rate
//! rows, so they are fixed points of the step.

use crate::sampling::{sample_categorical, DEFAULT_SAMPLING_EPS};
use crate::schedule::Scheduler;
use crate::stepper::{
    check_step_shapes, reverse_rate, ReverseStepper, StepAdvance, StepOptions, StepOutput,
};
use crate::{Error, Result};
use ndarray::{Array2, Array3, ArrayView1, ArrayView2, ArrayView3};
use rand::Rng;

/// Build the Euler transition distribution from a precomputed reverse rate
/// and sample the next state.
///
/// With `last_step` the mask column is dropped before sampling so nothing
/// can fall back into the mask state; the returned probabilities then have
/// `vocab - 1` coordinates.
pub(crate) fn advance_with_rate<R: Rng + ?Sized>(
    rev_rate: &ArrayView3<f32>,
    xt: &ArrayView2<usize>,
    dt: f32,
    last_step: bool,
    rng: &mut R,
) -> (Array2<usize>, Array3<f32>) {
    let (n, l, v) = rev_rate.dim();
    let keep = if last_step { v - 1 } else { v };
    let mut xt_prob = Array3::<f32>::zeros((n, l, keep));
    for i in 0..n {
        for j in 0..l {
            for y in 0..keep {
                xt_prob[[i, j, y]] = dt * rev_rate[[i, j, y]];
            }
            let tok = xt[[i, j]];
            if tok < keep {
                xt_prob[[i, j, tok]] += 1.0;
            }
        }
    }
    let new_xt = sample_categorical(&xt_prob.view(), DEFAULT_SAMPLING_EPS, rng);
    (new_xt, xt_prob)
}

pub(crate) fn time_increment(advance: StepAdvance) -> Result<f32> {
    match advance {
        StepAdvance::Time(dt) if dt.is_finite() && dt > 0.0 => Ok(dt),
        StepAdvance::Time(_) => Err(Error::Domain("dt must be positive and finite")),
        StepAdvance::Events(_) => Err(Error::Domain(
            "this stepper advances in time; use the event-driven stepper for event counts",
        )),
    }
}

/// Plain Euler stepper.
#[derive(Debug, Clone)]
pub struct EulerStepper {
    scheduler: Scheduler,
}

impl EulerStepper {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }
}

impl ReverseStepper for EulerStepper {
    fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// One Euler step of size `dt`.
    ///
    /// Honors a precomputed `opts.rev_rate` (checked against the input
    /// shapes); otherwise builds the rate from `output`. Rejects
    /// `opts.corrector`; corrector sweeps belong to the predictor-corrector
    /// stepper.
    fn step<R: Rng + ?Sized>(
        &self,
        output: &ArrayView3<f32>,
        xt: &ArrayView2<usize>,
        t: &ArrayView1<f32>,
        advance: StepAdvance,
        opts: &StepOptions,
        rng: &mut R,
    ) -> Result<StepOutput> {
        let (n, l) = check_step_shapes(&self.scheduler, output, xt, t)?;
        let dt = time_increment(advance)?;
        if opts.corrector {
            return Err(Error::Domain(
                "euler stepper has no corrector; use the predictor-corrector stepper",
            ));
        }

        let computed;
        let rev_rate = match &opts.rev_rate {
            Some(rate) => {
                if rate.dim() != (n, l, self.scheduler.vocab_size()) {
                    return Err(Error::Shape("rev_rate must match output shape"));
                }
                rate.view()
            }
            None => {
                computed = reverse_rate(&self.scheduler, output, xt, t)?;
                computed.view()
            }
        };

        let (new_xt, xt_prob) = advance_with_rate(&rev_rate, xt, dt, opts.last_step, rng);
        let mut out = StepOutput::new(new_xt);
        out.xt_prob = Some(xt_prob);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{ModelParam, ScheduleFamily, SchedulerConfig};
    use ndarray::{array, Array1};
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn stepper(num_vocabs: usize, length: usize) -> EulerStepper {
        let scheduler = Scheduler::new(SchedulerConfig {
            num_vocabs,
            length,
            eps: 1e-3,
            model: ModelParam::D3pm,
            schedule: ScheduleFamily::LogLinear,
        })
        .unwrap();
        EulerStepper::new(scheduler)
    }

    fn uniform_score_output(n: usize, l: usize, v: usize) -> Array3<f32> {
        Array3::<f32>::from_elem((n, l, v), 1.0)
    }

    #[test]
    fn transition_rows_sum_to_one_off_the_last_step() {
        let stepper = stepper(3, 4);
        let xt = array![[3usize, 1, 3, 0]];
        let t = array![0.5f32];
        let output = Array3::<f32>::from_shape_fn((1, 4, 4), |(_, j, v)| {
            0.2 + j as f32 * 0.1 + v as f32 * 0.3
        });
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        let out = stepper
            .step(
                &output.view(),
                &xt.view(),
                &t.view(),
                StepAdvance::Time(0.01),
                &StepOptions::default(),
                &mut rng,
            )
            .unwrap();
        let prob = out.xt_prob.unwrap();
        assert_eq!(prob.dim(), (1, 4, 4));
        for j in 0..4 {
            let row_sum: f32 = (0..4).map(|v| prob[[0, j, v]]).sum();
            assert!((row_sum - 1.0).abs() < 1e-4, "row {j} sums to {row_sum}");
        }
    }

    #[test]
    fn content_positions_are_fixed_points() {
        let stepper = stepper(5, 6);
        let xt = array![[0usize, 1, 2, 3, 4, 5], [5, 4, 3, 2, 1, 0]];
        let t = array![0.7f32, 0.3];
        let output = uniform_score_output(2, 6, 6);
        let mut rng = ChaCha8Rng::seed_from_u64(19);

        let out = stepper
            .step(
                &output.view(),
                &xt.view(),
                &t.view(),
                StepAdvance::Time(0.05),
                &StepOptions::default(),
                &mut rng,
            )
            .unwrap();
        for i in 0..2 {
            for j in 0..6 {
                if xt[[i, j]] != 5 {
                    assert_eq!(out.xt[[i, j]], xt[[i, j]], "content token moved");
                }
            }
        }
    }

    #[test]
    fn last_step_never_emits_the_mask() {
        let stepper = stepper(3, 8);
        let xt = array![[3usize, 0, 3, 1, 3, 2, 3, 0]];
        let t = array![0.05f32];
        let output = uniform_score_output(1, 8, 4);
        let mut rng = ChaCha8Rng::seed_from_u64(23);

        let opts = StepOptions {
            last_step: true,
            ..StepOptions::default()
        };
        let out = stepper
            .step(
                &output.view(),
                &xt.view(),
                &t.view(),
                StepAdvance::Time(0.05),
                &opts,
                &mut rng,
            )
            .unwrap();
        assert!(out.xt.iter().all(|&id| id < 3), "mask survived the last step");
        let prob = out.xt_prob.unwrap();
        assert_eq!(prob.dim(), (1, 8, 3));
        // Content positions still hold their token.
        assert_eq!(out.xt[[0, 1]], 0);
        assert_eq!(out.xt[[0, 3]], 1);
        assert_eq!(out.xt[[0, 5]], 2);
        assert_eq!(out.xt[[0, 7]], 0);
    }

    #[test]
    fn large_rate_mass_forces_unmasking() {
        // Near t = 1 the log-linear sigma is ~1/eps; with dt = 0.5 the mask
        // coordinate goes strongly negative and can never win the argmax.
        let stepper = stepper(3, 16);
        let xt = Array2::<usize>::from_elem((2, 16), 3);
        let t = array![1.0f32, 1.0];
        let output = uniform_score_output(2, 16, 4);
        let mut rng = ChaCha8Rng::seed_from_u64(29);

        let out = stepper
            .step(
                &output.view(),
                &xt.view(),
                &t.view(),
                StepAdvance::Time(0.5),
                &StepOptions::default(),
                &mut rng,
            )
            .unwrap();
        assert!(out.xt.iter().all(|&id| id < 3));
    }

    #[test]
    fn precomputed_rate_matches_internal_path() {
        let stepper = stepper(4, 5);
        let xt = array![[4usize, 0, 4, 2, 4]];
        let t = array![0.4f32];
        let output = Array3::<f32>::from_shape_fn((1, 5, 5), |(_, j, v)| {
            0.5 + ((j * 5 + v) % 3) as f32 * 0.25
        });

        let rate = reverse_rate(stepper.scheduler(), &output.view(), &xt.view(), &t.view())
            .unwrap();

        let mut r1 = ChaCha8Rng::seed_from_u64(31);
        let internal = stepper
            .step(
                &output.view(),
                &xt.view(),
                &t.view(),
                StepAdvance::Time(0.02),
                &StepOptions::default(),
                &mut r1,
            )
            .unwrap();

        let mut r2 = ChaCha8Rng::seed_from_u64(31);
        let opts = StepOptions {
            rev_rate: Some(rate),
            ..StepOptions::default()
        };
        let precomputed = stepper
            .step(
                &output.view(),
                &xt.view(),
                &t.view(),
                StepAdvance::Time(0.02),
                &opts,
                &mut r2,
            )
            .unwrap();

        assert_eq!(internal.xt, precomputed.xt);
    }

    #[test]
    fn rejects_corrector_and_event_advances() {
        let stepper = stepper(3, 4);
        let xt = array![[3usize, 1, 3, 0]];
        let t = array![0.5f32];
        let output = uniform_score_output(1, 4, 4);
        let mut rng = ChaCha8Rng::seed_from_u64(5);

        let opts = StepOptions {
            corrector: true,
            ..StepOptions::default()
        };
        assert!(stepper
            .step(
                &output.view(),
                &xt.view(),
                &t.view(),
                StepAdvance::Time(0.1),
                &opts,
                &mut rng,
            )
            .is_err());

        assert!(stepper
            .step(
                &output.view(),
                &xt.view(),
                &t.view(),
                StepAdvance::Events(1),
                &StepOptions::default(),
                &mut rng,
            )
            .is_err());

        assert!(stepper
            .step(
                &output.view(),
                &xt.view(),
                &t.view(),
                StepAdvance::Time(-0.1),
                &StepOptions::default(),
                &mut rng,
            )
            .is_err());
    }

    #[test]
    fn steps_are_deterministic_under_a_fixed_seed() {
        let stepper = stepper(6, 10);
        let xt = Array2::<usize>::from_elem((3, 10), 6);
        let t = Array1::<f32>::from_elem(3, 0.8);
        let output = Array3::<f32>::from_shape_fn((3, 10, 7), |(i, j, v)| {
            ((i + 2 * j + 3 * v) % 5) as f32 * 0.4 + 0.1
        });

        let mut r1 = ChaCha8Rng::seed_from_u64(101);
        let mut r2 = ChaCha8Rng::seed_from_u64(101);
        let a = stepper
            .step(
                &output.view(),
                &xt.view(),
                &t.view(),
                StepAdvance::Time(0.1),
                &StepOptions::default(),
                &mut r1,
            )
            .unwrap();
        let b = stepper
            .step(
                &output.view(),
                &xt.view(),
                &t.view(),
                StepAdvance::Time(0.1),
                &StepOptions::default(),
                &mut r2,
            )
            .unwrap();
        assert_eq!(a.xt, b.xt);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_transition_rows_sum_to_one(
            outputs in prop::collection::vec(0.0f32..8.0, 2 * 3 * 5),
            toks in prop::collection::vec(0usize..5, 2 * 3),
            t0 in 0.1f32..0.9,
            t1 in 0.1f32..0.9,
            dt in 1e-3f32..0.2,
        ) {
            let stepper = stepper(4, 3);
            let xt = Array2::from_shape_vec((2, 3), toks).unwrap();
            let t = array![t0, t1];
            let output = Array3::from_shape_vec((2, 3, 5), outputs).unwrap();
            let mut rng = ChaCha8Rng::seed_from_u64(77);

            let out = stepper
                .step(
                    &output.view(),
                    &xt.view(),
                    &t.view(),
                    StepAdvance::Time(dt),
                    &StepOptions::default(),
                    &mut rng,
                )
                .unwrap();
            // Identity rows plus dt times a zero-sum rate row.
            let prob = out.xt_prob.unwrap();
            for i in 0..2 {
                for j in 0..3 {
                    let row_sum: f32 = (0..5).map(|v| prob[[i, j, v]]).sum();
                    prop_assert!(
                        (row_sum - 1.0).abs() < 1e-3,
                        "row ({}, {}) sums to {}",
                        i,
                        j,
                        row_sum
                    );
                }
            }
        }
    }
}
