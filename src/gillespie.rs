//! Event-driven (tau-leaping) stepping.
//!
//! Instead of a fixed time increment, each call resolves a fixed number of
//! unmasking events (arXiv:2407.21243, Alg. 1): one exponential holding time
//! per position from its total outgoing rate, the `dk` soonest events fire,
//! and the elapsed time is the largest holding time among them. Content
//! positions have zero outgoing rate, so their holding times are effectively
//! infinite and masked positions always fire first.
//!
//! The matching forward corruption masks a prescribed number of positions by
//! random priority and reports the time consistent with that count, so a
//! reverse trajectory can be started from any intermediate corruption level.
//!
//! Draw order per call: the full `[batch, length]` exponential block first,
//! then one Gumbel draw per fired event in (batch, ascending holding time)
//! order. [`GillespieStepper::add_noise`] always draws `length` uniforms per
//! sequence, whether or not any position is masked.

use crate::sampling::{sample_categorical_row, sample_exponential, DEFAULT_SAMPLING_EPS};
use crate::schedule::Scheduler;
use crate::stepper::{
    check_step_shapes, reverse_rate, ReverseStepper, StepAdvance, StepOptions, StepOutput,
};
use crate::{Error, Result};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, ArrayView3};
use rand::Rng;

/// Time reported when a sequence has no masked positions at all.
const FULLY_REVEALED_T: f32 = 1e-5;

/// Gillespie stepper over masked sequences.
#[derive(Debug, Clone)]
pub struct GillespieStepper {
    scheduler: Scheduler,
}

impl GillespieStepper {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    /// Corrupt `x0` to a state with exactly `k` revealed positions per
    /// sequence.
    ///
    /// Each position draws a uniform priority; the `length - k` smallest
    /// priorities are absorbed. The returned per-sequence time is the absorb
    /// time of the largest absorbed priority, clamped to `[0, 1]`: the
    /// earliest time at which the forward process is consistent with exactly
    /// that set of masked positions. With `k == length` nothing is masked
    /// and the time is a small positive floor.
    pub fn add_noise<R: Rng + ?Sized>(
        &self,
        x0: &ArrayView2<usize>,
        k: usize,
        rng: &mut R,
    ) -> Result<(Array2<usize>, Array1<f32>)> {
        let (n, l) = x0.dim();
        if k > l {
            return Err(Error::Domain("k must not exceed the sequence length"));
        }

        let mut priority = Array2::<f32>::zeros((n, l));
        for i in 0..n {
            for j in 0..l {
                priority[[i, j]] = rng.random();
            }
        }

        if k == l {
            return Ok((x0.to_owned(), Array1::from_elem(n, FULLY_REVEALED_T)));
        }

        let mask = self.scheduler.mask_id();
        let eps = self.scheduler.eps();
        let mut xt = x0.to_owned();
        let mut t = Array1::<f32>::zeros(n);
        for i in 0..n {
            let mut order: Vec<(f32, usize)> = (0..l).map(|j| (priority[[i, j]], j)).collect();
            order.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            let absorbed = &order[..l - k];
            for &(_, j) in absorbed {
                xt[[i, j]] = mask;
            }
            let largest = absorbed[absorbed.len() - 1].0;
            t[i] = self
                .scheduler
                .family()
                .t_of_absorb_prob(eps, largest)
                .clamp(0.0, 1.0);
        }
        Ok((xt, t))
    }
}

impl ReverseStepper for GillespieStepper {
    fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Fire `dk` unmasking events per sequence.
    ///
    /// Requires [`StepAdvance::Events`]; `dk` must stay within the masked
    /// position count of every sequence, otherwise already-revealed
    /// positions get redrawn from their zero rate rows. `opts.last_step` is
    /// accepted but has no effect; destinations never include the mask.
    /// The caller advances its clock by the returned `tau`.
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
        let dk = match advance {
            StepAdvance::Events(dk) if dk >= 1 && dk <= l => dk,
            StepAdvance::Events(_) => {
                return Err(Error::Domain("dk must be in 1..=length"));
            }
            StepAdvance::Time(_) => {
                return Err(Error::Domain(
                    "the event-driven stepper advances in events, not time",
                ));
            }
        };
        if opts.corrector {
            return Err(Error::Domain("the event-driven stepper has no corrector"));
        }

        let v = self.scheduler.vocab_size();
        let rev_rate = match &opts.rev_rate {
            Some(rate) => {
                if rate.dim() != (n, l, v) {
                    return Err(Error::Shape("rev_rate must match output shape"));
                }
                rate.clone()
            }
            None => reverse_rate(&self.scheduler, output, xt, t)?,
        };

        // Total unmasking rate per position: content destinations only.
        let mut total = Array2::<f32>::zeros((n, l));
        for i in 0..n {
            for j in 0..l {
                let mut acc = 0.0f32;
                for y in 0..v - 1 {
                    acc += rev_rate[[i, j, y]];
                }
                total[[i, j]] = acc;
            }
        }
        let holding = sample_exponential(&total.view(), DEFAULT_SAMPLING_EPS, rng);

        let mut new_xt = xt.to_owned();
        let mut tau = Array1::<f32>::zeros(n);
        for i in 0..n {
            let mut order: Vec<(f32, usize)> = (0..l).map(|j| (holding[[i, j]], j)).collect();
            order.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            let fired = &order[..dk];
            for &(_, j) in fired {
                let weights = rev_rate.slice(s![i, j, ..v - 1]);
                new_xt[[i, j]] = sample_categorical_row(&weights, DEFAULT_SAMPLING_EPS, rng);
            }
            tau[i] = fired[fired.len() - 1].0;
        }

        let mut out = StepOutput::new(new_xt);
        out.rev_rate = Some(rev_rate);
        out.tau = Some(tau);
        Ok(out)
    }
}
