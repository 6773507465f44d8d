//! Noise schedule, forward corruption, and score adaptation.
//!
//! The forward process absorbs each position independently: by time `t` a
//! position has been replaced by the mask token with probability
//! \(1 - e^{-\bar\sigma(t)}\). The schedule family fixes the pair
//! \((\bar\sigma, \sigma)\) and must keep \(\sigma = d\bar\sigma/dt\)
//! **exact**: every reverse-process stepper scales its rate matrix by
//! \(\sigma(t)\) and silently assumes this identity.
//!
//! Model parameterizations differ in what the predictor emits (log-scores,
//! scores, confidences); [`Scheduler::output_to_score`] is the single place
//! that difference is resolved.

use crate::{Error, Result};
use ndarray::{Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
use rand::Rng;
use std::str::FromStr;

/// Schedule family: the concrete \((\bar\sigma, \sigma)\) pair.
///
/// Families are enumerated (not string-dispatched) so an unknown family is
/// unrepresentable after configuration parsing. Each variant carries its own
/// formula pair; a new family must satisfy \(\sigma = d\bar\sigma/dt\) and
/// provide the absorb-probability inverse used by the event-driven stepper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleFamily {
    /// Log-linear schedule:
    /// \(\bar\sigma(t) = -\ln(1 - (1-\epsilon) t)\),
    /// \(\sigma(t) = (1-\epsilon) / (1 - (1-\epsilon) t)\).
    ///
    /// The absorb probability is exactly \((1-\epsilon)\,t\), which makes the
    /// schedule invertible in closed form. Valid time domain is `(0, 1)`;
    /// `t >= 1/(1-eps)` hits the log singularity and propagates as a
    /// non-finite float rather than an error.
    LogLinear,
}

impl ScheduleFamily {
    /// Cumulative corruption strength \(\bar\sigma(t)\).
    pub fn sigma_bar(self, eps: f32, t: f32) -> f32 {
        match self {
            ScheduleFamily::LogLinear => -(-(1.0 - eps) * t).ln_1p(),
        }
    }

    /// Instantaneous corruption rate \(\sigma(t) = d\bar\sigma/dt\).
    pub fn sigma(self, eps: f32, t: f32) -> f32 {
        match self {
            ScheduleFamily::LogLinear => (1.0 - eps) / (1.0 - (1.0 - eps) * t),
        }
    }

    /// Per-position probability of having been absorbed by time `t`,
    /// \(1 - e^{-\bar\sigma(t)}\).
    pub fn absorb_prob(self, eps: f32, t: f32) -> f32 {
        1.0 - (-self.sigma_bar(eps, t)).exp()
    }

    /// Inverse of [`Self::absorb_prob`]: the time at which the absorb
    /// probability reaches `p`.
    pub fn t_of_absorb_prob(self, eps: f32, p: f32) -> f32 {
        match self {
            ScheduleFamily::LogLinear => p / (1.0 - eps),
        }
    }
}

impl FromStr for ScheduleFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "log-linear" | "loglinear" => Ok(ScheduleFamily::LogLinear),
            other => Err(Error::Config(format!("unknown noise schedule: {other}"))),
        }
    }
}

/// What the predictor's raw output means, i.e. how to turn it into a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelParam {
    /// Predictor emits log-scores; score = `exp(output)`.
    Sedd,
    /// Predictor emits scores directly; passed through unchanged.
    D3pm,
    /// Predictor emits per-token confidences; score =
    /// `output * (1 - p_absorb)/p_absorb` at the current time
    /// (arXiv:2407.21243, Eq. 3).
    MaskGit,
    /// Predictor emits CTMC rates-as-scores; passed through unchanged.
    Ctmc,
}

impl FromStr for ModelParam {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sedd" => Ok(ModelParam::Sedd),
            "d3pm" => Ok(ModelParam::D3pm),
            "maskgit" => Ok(ModelParam::MaskGit),
            "ctmc" => Ok(ModelParam::Ctmc),
            other => Err(Error::Config(format!(
                "unknown model parameterization: {other}"
            ))),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of **content** tokens; the mask token is added on top, at index
    /// `num_vocabs`.
    pub num_vocabs: usize,
    /// Sequence length used by [`Scheduler::sample_latent`].
    pub length: usize,
    /// Schedule floor, typically `1e-3`. Keeps \(\sigma(t)\) finite at `t = 1`.
    pub eps: f32,
    /// Predictor output semantics.
    pub model: ModelParam,
    /// Schedule family.
    pub schedule: ScheduleFamily,
}

/// The noise schedule plus everything derived from it: forward corruption,
/// score adaptation, and the maximally-corrupted latent distribution.
///
/// All methods are pure; randomized ones take an explicit RNG and draw one
/// uniform per sequence position in row-major order.
#[derive(Debug, Clone)]
pub struct Scheduler {
    vocab_size: usize,
    length: usize,
    eps: f32,
    model: ModelParam,
    schedule: ScheduleFamily,
}

impl Scheduler {
    /// Validate a configuration and build the scheduler.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        if config.num_vocabs == 0 {
            return Err(Error::Domain("num_vocabs must be >= 1"));
        }
        if config.length == 0 {
            return Err(Error::Domain("length must be >= 1"));
        }
        if !config.eps.is_finite() || config.eps <= 0.0 || config.eps >= 1.0 {
            return Err(Error::Domain("eps must be finite and in (0, 1)"));
        }
        Ok(Self {
            vocab_size: config.num_vocabs + 1,
            length: config.length,
            eps: config.eps,
            model: config.model,
            schedule: config.schedule,
        })
    }

    /// Total vocabulary size, mask token included.
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// The absorbing token id (always the last index).
    pub fn mask_id(&self) -> usize {
        self.vocab_size - 1
    }

    /// Configured sequence length.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Schedule floor.
    pub fn eps(&self) -> f32 {
        self.eps
    }

    /// Model parameterization.
    pub fn model(&self) -> ModelParam {
        self.model
    }

    /// Schedule family.
    pub fn family(&self) -> ScheduleFamily {
        self.schedule
    }

    /// \(\bar\sigma(t)\) for this scheduler's family and floor.
    pub fn sigma_bar(&self, t: f32) -> f32 {
        self.schedule.sigma_bar(self.eps, t)
    }

    /// \(\sigma(t)\) for this scheduler's family and floor.
    pub fn sigma(&self, t: f32) -> f32 {
        self.schedule.sigma(self.eps, t)
    }

    /// Absorb probability at time `t`.
    pub fn absorb_prob(&self, t: f32) -> f32 {
        self.schedule.absorb_prob(self.eps, t)
    }

    /// Forward corruption `x0 -> xt`: independently replace each position by
    /// the mask id with probability `absorb_prob(t)` of its batch item.
    ///
    /// `x0` is `[batch, length]` of content-token ids (the mask id must not
    /// appear in clean input); `t` is one time per batch item. Draws one
    /// uniform per position in row-major order.
    pub fn add_noise<R: Rng + ?Sized>(
        &self,
        x0: &ArrayView2<usize>,
        t: &ArrayView1<f32>,
        rng: &mut R,
    ) -> Result<Array2<usize>> {
        let (n, l) = x0.dim();
        if t.len() != n {
            return Err(Error::Shape("t must have one entry per batch item"));
        }
        let mask = self.mask_id();
        let mut xt = Array2::<usize>::zeros((n, l));
        for i in 0..n {
            let p = self.absorb_prob(t[i]);
            for j in 0..l {
                debug_assert!(x0[[i, j]] < mask, "clean input contains the mask id");
                let u: f32 = rng.random();
                xt[[i, j]] = if u < p { mask } else { x0[[i, j]] };
            }
        }
        Ok(xt)
    }

    /// Forward corruption that also returns a soft (expected) one-hot of `xt`.
    ///
    /// The hard sample is drawn exactly as [`Self::add_noise`] (same draws,
    /// same order, so the two agree given the same RNG state). The soft
    /// representation blends the endpoints by absorb probability `p`:
    ///
    /// \[
    /// \tilde{x}_t = (1 - p)\,\mathrm{onehot}(x_0) + p\,\mathrm{onehot}(x_t),
    /// \]
    ///
    /// which keeps each row on the simplex and reduces to a hard one-hot at
    /// unperturbed positions. Useful when a continuous relaxation of `xt` is
    /// needed instead of a hard sample.
    pub fn add_noise_soft<R: Rng + ?Sized>(
        &self,
        x0: &ArrayView2<usize>,
        t: &ArrayView1<f32>,
        rng: &mut R,
    ) -> Result<(Array2<usize>, Array3<f32>)> {
        let xt = self.add_noise(x0, t, rng)?;
        let (n, l) = x0.dim();
        let v = self.vocab_size;
        let mut soft = Array3::<f32>::zeros((n, l, v));
        for i in 0..n {
            let p = self.absorb_prob(t[i]);
            for j in 0..l {
                soft[[i, j, x0[[i, j]]]] += 1.0 - p;
                soft[[i, j, xt[[i, j]]]] += p;
            }
        }
        Ok((xt, soft))
    }

    /// Convert raw predictor output into a score tensor.
    ///
    /// Dispatches on the configured [`ModelParam`]; see the variant docs for
    /// the exact transforms. `t` is always required; the MaskGit conversion
    /// is time-dependent and every stepper has the time at hand.
    pub fn output_to_score(
        &self,
        output: &ArrayView3<f32>,
        t: &ArrayView1<f32>,
    ) -> Result<Array3<f32>> {
        let (n, _l, v) = output.dim();
        if v != self.vocab_size {
            return Err(Error::Shape("output last axis must match vocab_size"));
        }
        if t.len() != n {
            return Err(Error::Shape("t must have one entry per batch item"));
        }
        match self.model {
            ModelParam::Sedd => Ok(output.mapv(f32::exp)),
            ModelParam::D3pm | ModelParam::Ctmc => Ok(output.to_owned()),
            ModelParam::MaskGit => {
                let mut score = output.to_owned();
                for i in 0..n {
                    let p = self.absorb_prob(t[i]);
                    let scale = (1.0 - p) / p;
                    let mut batch = score.index_axis_mut(Axis(0), i);
                    batch.mapv_inplace(|x| x * scale);
                }
                Ok(score)
            }
        }
    }

    /// `n` sequences of the configured length, every position masked: the
    /// stationary distribution of the forward process and the starting point
    /// of reverse sampling.
    pub fn sample_latent(&self, n: usize) -> Array2<usize> {
        Array2::<usize>::from_elem((n, self.length), self.mask_id())
    }
}

/// Dense one-hot encoding of a token-id array.
pub fn one_hot(ids: &ArrayView2<usize>, vocab: usize) -> Array3<f32> {
    let (n, l) = ids.dim();
    let mut out = Array3::<f32>::zeros((n, l, vocab));
    for i in 0..n {
        for j in 0..l {
            debug_assert!(ids[[i, j]] < vocab, "token id out of range");
            out[[i, j, ids[[i, j]]]] = 1.0;
        }
    }
    out
}
