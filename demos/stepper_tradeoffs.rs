//! The four reverse steppers on the same denoiser: accuracy vs model calls.
//!
//! The denoiser is a soft oracle that puts probability q on the true token of
//! every masked position and spreads the rest uniformly, scaled by the exact
//! score magnitude `1 / expm1(sigma_bar(t))`. Since the oracle itself caps
//! accuracy near q, the interesting column is `calls`: how many denoiser
//! evaluations each stepper needs to reach that ceiling.
//!
//! - euler / analytic: one call per grid step
//! - predictor-corrector: one extra call per interleaved corrector pass
//! - gillespie: one call per event batch, so `length / dk` calls total
//!
//! Run:
//! ```bash
//! cargo run --example stepper_tradeoffs
//! ```

use maskdiff::analytic::AnalyticStepper;
use maskdiff::euler::EulerStepper;
use maskdiff::gillespie::GillespieStepper;
use maskdiff::predictor_corrector::PredictorCorrectorStepper;
use maskdiff::schedule::{ModelParam, ScheduleFamily, Scheduler, SchedulerConfig};
use maskdiff::stepper::{ReverseStepper, StepAdvance, StepOptions};
use maskdiff::{Error, Result};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const NUM_VOCABS: usize = 12;
const LENGTH: usize = 32;
const BATCH: usize = 16;
const ORACLE_CONFIDENCE: f32 = 0.9;
const T_END: f32 = 0.05;

fn soft_oracle(
    sched: &Scheduler,
    x0: &Array2<usize>,
    xt: &ArrayView2<usize>,
    t: &ArrayView1<f32>,
) -> Array3<f32> {
    let (n, l) = xt.dim();
    let spread = (1.0 - ORACLE_CONFIDENCE) / (NUM_VOCABS as f32 - 1.0);
    let mut out = Array3::<f32>::zeros((n, l, sched.vocab_size()));
    for i in 0..n {
        let ratio = 1.0 / sched.sigma_bar(t[i]).exp_m1();
        for j in 0..l {
            if xt[[i, j]] != sched.mask_id() {
                continue;
            }
            for c in 0..sched.mask_id() {
                let p = if c == x0[[i, j]] { ORACLE_CONFIDENCE } else { spread };
                out[[i, j, c]] = (ratio * p).ln();
            }
        }
    }
    out
}

fn accuracy(xt: &Array2<usize>, x0: &Array2<usize>) -> f32 {
    let hits = xt.iter().zip(x0.iter()).filter(|(a, b)| a == b).count();
    hits as f32 / x0.len() as f32
}

/// Grid sweep from the all-mask latent down to `T_END`, one call per step.
fn grid_sweep<S: ReverseStepper>(
    stepper: &S,
    x0: &Array2<usize>,
    steps: usize,
    seed: u64,
) -> Result<(usize, f32)> {
    let sched = stepper.scheduler();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut xt = sched.sample_latent(BATCH);
    let dt = (1.0 - T_END) / steps as f32;
    let mut calls = 0usize;
    for k in 0..steps {
        let t = Array1::<f32>::from_elem(BATCH, 1.0 - k as f32 * dt);
        let output = soft_oracle(sched, x0, &xt.view(), &t.view());
        calls += 1;
        let opts = StepOptions {
            last_step: k + 1 == steps,
            ..StepOptions::default()
        };
        xt = stepper
            .step(
                &output.view(),
                &xt.view(),
                &t.view(),
                StepAdvance::Time(dt),
                &opts,
                &mut rng,
            )?
            .xt;
    }
    Ok((calls, accuracy(&xt, x0)))
}

/// Like [`grid_sweep`] with a corrector pass after every step but the last,
/// each pass spending one extra denoiser call at the advanced time.
fn pc_sweep(
    stepper: &PredictorCorrectorStepper,
    x0: &Array2<usize>,
    steps: usize,
    seed: u64,
) -> Result<(usize, f32)> {
    let sched = stepper.scheduler();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut xt = sched.sample_latent(BATCH);
    let dt = (1.0 - T_END) / steps as f32;
    let mut calls = 0usize;
    for k in 0..steps {
        let t_now = 1.0 - k as f32 * dt;
        let t = Array1::<f32>::from_elem(BATCH, t_now);
        let output = soft_oracle(sched, x0, &xt.view(), &t.view());
        calls += 1;
        let opts = StepOptions {
            last_step: k + 1 == steps,
            ..StepOptions::default()
        };
        xt = stepper
            .step(
                &output.view(),
                &xt.view(),
                &t.view(),
                StepAdvance::Time(dt),
                &opts,
                &mut rng,
            )?
            .xt;

        if k < steps - 1 {
            let t_next = Array1::<f32>::from_elem(BATCH, t_now - dt);
            let output = soft_oracle(sched, x0, &xt.view(), &t_next.view());
            calls += 1;
            let opts = StepOptions {
                corrector: true,
                ..StepOptions::default()
            };
            xt = stepper
                .step(
                    &output.view(),
                    &xt.view(),
                    &t_next.view(),
                    StepAdvance::Time(dt),
                    &opts,
                    &mut rng,
                )?
                .xt;
        }
    }
    Ok((calls, accuracy(&xt, x0)))
}

/// Event sweep: fire `dk` unmasking events per call until nothing is masked,
/// rolling the clock back by the reported holding times.
fn event_sweep(
    stepper: &GillespieStepper,
    x0: &Array2<usize>,
    dk: usize,
    seed: u64,
) -> Result<(usize, f32)> {
    let sched = stepper.scheduler();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut xt = sched.sample_latent(BATCH);
    let mut t = Array1::<f32>::from_elem(BATCH, 1.0);
    let mut calls = 0usize;
    for _ in 0..LENGTH / dk {
        let output = soft_oracle(sched, x0, &xt.view(), &t.view());
        calls += 1;
        let out = stepper.step(
            &output.view(),
            &xt.view(),
            &t.view(),
            StepAdvance::Events(dk),
            &StepOptions::default(),
            &mut rng,
        )?;
        xt = out.xt;
        let tau = out
            .tau
            .ok_or(Error::Domain("event stepper must report holding times"))?;
        for i in 0..BATCH {
            t[i] = (t[i] - tau[i]).max(1e-3);
        }
    }
    Ok((calls, accuracy(&xt, x0)))
}

fn main() -> Result<()> {
    let sched = Scheduler::new(SchedulerConfig {
        num_vocabs: NUM_VOCABS,
        length: LENGTH,
        eps: 1e-3,
        model: ModelParam::Sedd,
        schedule: ScheduleFamily::LogLinear,
    })?;
    let x0 = Array2::<usize>::from_shape_fn((BATCH, LENGTH), |(i, j)| (i * 5 + j * 3) % NUM_VOCABS);

    println!(
        "stepper tradeoffs: batch={BATCH} length={LENGTH} vocab={} oracle q={ORACLE_CONFIDENCE}",
        NUM_VOCABS + 1
    );
    println!("accuracy ceiling is the oracle confidence; calls count denoiser evaluations");
    println!();

    let euler = EulerStepper::new(sched.clone());
    for steps in [4usize, 8, 16, 32] {
        let (calls, acc) = grid_sweep(&euler, &x0, steps, 11)?;
        println!("euler       steps={steps:>2}  calls={calls:>3}  accuracy={acc:.3}");
    }
    println!();

    let pc = PredictorCorrectorStepper::new(sched.clone());
    for steps in [4usize, 8, 16] {
        let (calls, acc) = pc_sweep(&pc, &x0, steps, 23)?;
        println!("pc          steps={steps:>2}  calls={calls:>3}  accuracy={acc:.3}");
    }
    println!();

    let analytic = AnalyticStepper::new(sched.clone());
    for steps in [2usize, 4, 8, 16] {
        let (calls, acc) = grid_sweep(&analytic, &x0, steps, 37)?;
        println!("analytic    steps={steps:>2}  calls={calls:>3}  accuracy={acc:.3}");
    }
    println!();

    let gillespie = GillespieStepper::new(sched.clone());
    for dk in [8usize, 4, 2, 1] {
        let (calls, acc) = event_sweep(&gillespie, &x0, dk, 53)?;
        println!("gillespie   dk={dk:>2}     calls={calls:>3}  accuracy={acc:.3}");
    }

    Ok(())
}
