//! Shared surface for reverse-process steppers.
//!
//! A stepper advances a batch of partially masked sequences backwards in
//! time, from the all-mask latent at `t = 1` towards clean data near
//! `t = 0`. All steppers consume the same inputs (predictor output, current
//! state, per-item time) and report through [`StepOutput`]; they differ in
//! how a step advances: a fixed time increment for the discretized
//! integrators, or a fixed number of unmasking events for the event-driven
//! one.
//!
//! [`sample_reverse`] is the plain fixed-grid driver: uniform steps from
//! `t = 1` down to `t_end`, flagging the final step so the stepper can
//! exclude the mask from its last draw.

use crate::rate::q_tilde;
use crate::schedule::Scheduler;
use crate::{Error, Result};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
use rand::Rng;

/// What a single reverse step produced.
///
/// `xt` is always present. The remaining fields depend on the stepper:
/// the discretized integrators report the transition distribution they
/// sampled from (`xt_prob`) or the rate they used (`rev_rate`), the
/// event-driven stepper reports the elapsed holding time (`tau`).
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Updated state, `[batch, length]`.
    pub xt: Array2<usize>,
    /// Per-position transition probabilities the new state was drawn from.
    pub xt_prob: Option<Array3<f32>>,
    /// Reverse rate used for the update (useful for corrector re-use).
    pub rev_rate: Option<Array3<f32>>,
    /// Per-item time advanced by an event-driven step.
    pub tau: Option<Array1<f32>>,
}

impl StepOutput {
    pub(crate) fn new(xt: Array2<usize>) -> Self {
        Self {
            xt,
            xt_prob: None,
            rev_rate: None,
            tau: None,
        }
    }
}

/// How far a step advances.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepAdvance {
    /// Advance time by `dt > 0` (discretized integrators).
    Time(f32),
    /// Unmask `dk >= 1` positions per sequence (event-driven stepper).
    Events(usize),
}

/// Per-step options. `Default` gives an ordinary interior predictor step.
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    /// Final step of a sweep: the stepper must not move any position into
    /// the mask state.
    pub last_step: bool,
    /// Corrector step: re-diffuse in place instead of advancing time. Only
    /// the predictor-corrector stepper accepts this.
    pub corrector: bool,
    /// Precomputed reverse rate to use instead of rebuilding it from the
    /// predictor output. Steppers that never form the rate ignore it.
    pub rev_rate: Option<Array3<f32>>,
}

/// A reverse-process stepper over masked sequences.
///
/// Implementations are pure given the RNG: identical inputs and RNG state
/// give identical outputs, and all draws happen in row-major position order.
pub trait ReverseStepper {
    /// The schedule this stepper integrates against.
    fn scheduler(&self) -> &Scheduler;

    /// Advance `xt` one step backwards from per-item times `t`.
    ///
    /// `output` is the raw predictor output, `[batch, length, vocab]`; the
    /// stepper converts it via the scheduler's parameterization. Returns
    /// [`Error::Shape`] on inconsistent inputs and [`Error::Domain`] when
    /// `advance` or `opts` asks for something the stepper cannot do.
    fn step<R: Rng + ?Sized>(
        &self,
        output: &ArrayView3<f32>,
        xt: &ArrayView2<usize>,
        t: &ArrayView1<f32>,
        advance: StepAdvance,
        opts: &StepOptions,
        rng: &mut R,
    ) -> Result<StepOutput>;
}

/// Check the common `(output, xt, t)` shape contract against a scheduler.
///
/// Returns `(batch, length)` on success.
pub(crate) fn check_step_shapes(
    scheduler: &Scheduler,
    output: &ArrayView3<f32>,
    xt: &ArrayView2<usize>,
    t: &ArrayView1<f32>,
) -> Result<(usize, usize)> {
    let (n, l, v) = output.dim();
    if v != scheduler.vocab_size() {
        return Err(Error::Shape("output last axis must match vocab_size"));
    }
    if xt.dim() != (n, l) {
        return Err(Error::Shape("xt must match output leading axes"));
    }
    if t.len() != n {
        return Err(Error::Shape("t must have one entry per batch item"));
    }
    Ok((n, l))
}

/// Reverse rate \(\sigma(t)\,\tilde{Q}\) from raw predictor output.
///
/// This is the quantity the discretized steppers integrate: score-weighted
/// generator rows scaled by the instantaneous noise rate of each batch item.
pub fn reverse_rate(
    scheduler: &Scheduler,
    output: &ArrayView3<f32>,
    xt: &ArrayView2<usize>,
    t: &ArrayView1<f32>,
) -> Result<Array3<f32>> {
    let (n, _l) = check_step_shapes(scheduler, output, xt, t)?;
    let score = scheduler.output_to_score(output, t)?;
    let mut rate = q_tilde(xt, &score.view())?;
    for i in 0..n {
        let sigma = scheduler.sigma(t[i]);
        let mut batch = rate.index_axis_mut(Axis(0), i);
        batch.mapv_inplace(|r| r * sigma);
    }
    Ok(rate)
}

/// Run a full reverse sweep on a uniform time grid.
///
/// Starts from the all-mask latent, takes `steps` equal steps of
/// `dt = (1 - t_end) / steps` from `t = 1` down to `t_end`, and flags the
/// final step so the result contains no mask tokens. The predictor closure
/// is called once per step with the current state and times.
///
/// Only time-advancing steppers fit this driver; the event-driven stepper
/// rejects [`StepAdvance::Time`] and needs its own loop.
pub fn sample_reverse<S, R, F>(
    stepper: &S,
    num_samples: usize,
    steps: usize,
    t_end: f32,
    mut predictor: F,
    rng: &mut R,
) -> Result<Array2<usize>>
where
    S: ReverseStepper,
    R: Rng + ?Sized,
    F: FnMut(&ArrayView2<usize>, &ArrayView1<f32>) -> Array3<f32>,
{
    if num_samples == 0 {
        return Err(Error::Domain("num_samples must be >= 1"));
    }
    if steps == 0 {
        return Err(Error::Domain("steps must be >= 1"));
    }
    if !t_end.is_finite() || t_end <= 0.0 || t_end >= 1.0 {
        return Err(Error::Domain("t_end must be finite and in (0, 1)"));
    }

    let scheduler = stepper.scheduler();
    let dt = (1.0 - t_end) / steps as f32;
    let mut xt = scheduler.sample_latent(num_samples);

    for k in 0..steps {
        let t = Array1::<f32>::from_elem(num_samples, 1.0 - k as f32 * dt);
        let output = predictor(&xt.view(), &t.view());
        let opts = StepOptions {
            last_step: k == steps - 1,
            ..StepOptions::default()
        };
        let out = stepper.step(
            &output.view(),
            &xt.view(),
            &t.view(),
            StepAdvance::Time(dt),
            &opts,
            rng,
        )?;
        xt = out.xt;
    }
    Ok(xt)
}
