//! # maskdiff
//!
//! Noise schedules and reverse-process samplers for **masked (absorbing-state)
//! discrete diffusion** over categorical sequences.
//!
//! This crate is intentionally small:
//!
//! - it implements the **forward corruption** process (clean tokens → mask
//!   tokens), the **score adapter** for several model parameterizations, four
//!   **reverse-process steppers**, and the **denoising score-entropy loss**,
//! - it treats the learned predictor as an opaque function
//!   `(sequence, time) -> [batch, length, vocab]` output,
//! - it does not provide a training loop, an optimizer, or a CLI (those belong
//!   in the application layer).
//!
//! ## Public invariants (must not change)
//!
//! - **Determinism knobs are explicit**: every randomized operation takes
//!   `rng: &mut R` and consumes uniform draws in row-major element order over
//!   the shape it fills, so a whole trajectory is reproducible from a seed.
//! - **Generator rows sum to zero**: rate rows built by [`rate::q_tilde`] sum
//!   to zero within float tolerance for arbitrary nonnegative scores; every
//!   stepper relies on this.
//! - **The mask token is the last vocabulary index**: a scheduler over `n`
//!   content tokens works on `n + 1` ids, with `mask_id == n`. Clean inputs
//!   never contain the mask id.
//! - **No hidden normalization**: the categorical sampler accepts unnormalized
//!   weights by construction; functions that normalize say so.
//!
//! ## How this maps to the literature
//!
//! The forward process is the absorbing ("masked") continuous-time Markov
//! chain: each position independently jumps to a designated mask state with
//! cumulative intensity \(\bar\sigma(t)\). The reverse process reweights the
//! forward generator by a learned score (a ratio of conditional
//! probabilities), and the steppers are competing discretizations of the
//! resulting CTMC.
//!
//! - Lou et al., *Discrete Diffusion Modeling by Estimating the Ratios of the
//!   Data Distribution* (SEDD, arXiv:2310.16834): score parameterization, the
//!   absorbing generator rows (Eq. 16), and the analytic (denoising)
//!   transition used by [`analytic`].
//! - Austin et al., *Structured Denoising Diffusion Models in Discrete
//!   State-Spaces* (D3PM, arXiv:2107.03006): the discrete-state framing.
//! - Zhao et al., *Informed Correctors for Discrete Diffusion Models*
//!   (arXiv:2407.21243): the Gillespie-style event scheme ([`gillespie`]) and
//!   the MaskGIT-style score conversion.
//! - Chang et al., *MaskGIT: Masked Generative Image Transformer*
//!   (arXiv:2202.04200): the confidence-parameterized predictor family.
//!
//! ## Module map
//!
//! - `sampling`: exponential and Gumbel-max categorical primitives
//! - `schedule`: schedule family, model-parameterization tag, forward
//!   corruption, score adapter, latent initialization
//! - `rate`: shared absorbing-generator construction (`q_tok` / `q_tilde`)
//! - `stepper`: the [`stepper::ReverseStepper`] seam and the trajectory driver
//! - `euler`, `predictor_corrector`, `gillespie`, `analytic`: the four
//!   reverse-process discretizations
//! - `loss`: denoising score-entropy training objective
//!
//! ## What can change later
//!
//! - Additional schedule families (geometric, cosine) behind
//!   [`schedule::ScheduleFamily`]; each must keep \(\sigma = d\bar\sigma/dt\)
//!   exact; the steppers rely on that identity.
//! - Uniform-state (non-absorbing) generators; the current `rate` helpers are
//!   deliberately specialized to the absorbing chain.

pub mod analytic;
pub mod euler;
pub mod gillespie;
pub mod loss;
pub mod predictor_corrector;
pub mod rate;
pub mod sampling;
pub mod schedule;
pub mod stepper;

/// maskdiff error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    Shape(&'static str),
    #[error("domain error: {0}")]
    Domain(&'static str),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
