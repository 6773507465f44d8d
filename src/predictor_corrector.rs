//! Predictor-corrector stepping.
//!
//! The predictor is the plain Euler step. A corrector step re-diffuses the
//! current state instead of advancing time (arXiv:2407.21243): it adds the
//! forward rate \(\sigma(t)\,Q_{\mathrm{tok}}(x_t)\) to the reverse rate
//! before forming transition probabilities. At mask positions this boosts
//! every content coordinate uniformly, at content positions it shrinks the
//! holding mass by \(\Delta t\,\sigma\); with \(\Delta t\,\sigma < 1\)
//! content stays put and only mask positions are redistributed. The caller
//! keeps `t` unchanged after a corrector step.
//!
//! Steps report the rate they used so a predictor's rate can be fed back
//! into following corrector sweeps at the same `t` without rebuilding it.

use crate::rate::q_tok;
use crate::schedule::Scheduler;
use crate::stepper::{
    check_step_shapes, reverse_rate, ReverseStepper, StepAdvance, StepOptions, StepOutput,
};
use crate::{euler, Error, Result};
use ndarray::{ArrayView1, ArrayView2, ArrayView3};
use rand::Rng;

/// Euler predictor with an optional re-diffusing corrector.
#[derive(Debug, Clone)]
pub struct PredictorCorrectorStepper {
    scheduler: Scheduler,
}

impl PredictorCorrectorStepper {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }
}

impl ReverseStepper for PredictorCorrectorStepper {
    fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// One predictor step, or with `opts.corrector` one in-place corrector
    /// step of the same size.
    ///
    /// `opts.rev_rate` skips rebuilding the plain reverse rate; the
    /// corrector augmentation is always applied on top, with \(\sigma\)
    /// taken from `t`. The returned `rev_rate` is the rate actually used
    /// (augmented on corrector steps).
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
        let dt = euler::time_increment(advance)?;

        let v = self.scheduler.vocab_size();
        let mut rev_rate = match &opts.rev_rate {
            Some(rate) => {
                if rate.dim() != (n, l, v) {
                    return Err(Error::Shape("rev_rate must match output shape"));
                }
                rate.clone()
            }
            None => reverse_rate(&self.scheduler, output, xt, t)?,
        };

        if opts.corrector {
            let forward = q_tok(xt, v);
            for i in 0..n {
                let sigma = self.scheduler.sigma(t[i]);
                for j in 0..l {
                    for y in 0..v {
                        rev_rate[[i, j, y]] += sigma * forward[[i, j, y]];
                    }
                }
            }
        }

        let (new_xt, _xt_prob) =
            euler::advance_with_rate(&rev_rate.view(), xt, dt, opts.last_step, rng);
        let mut out = StepOutput::new(new_xt);
        out.rev_rate = Some(rev_rate);
        Ok(out)
    }
}
