// mimo-uq unified binary
//
// Commands:
//   mimo-uq train [--config TIER] [--seed N] [--loss NAME]   Train on synthetic fields
//   mimo-uq eval  [--config TIER] [--seed N] [--loss NAME]   Evaluate + export result tensors
//
// Config tiers: test (default, tiny/CPU-fast), default (wider model, more steps)
// GPU: auto-detected when compiled with --features cuda and tier is not "test"

use mimo_uq::buffer::LossBuffer;
use mimo_uq::data::{SyntheticConfig, SyntheticField};
use mimo_uq::eval::{evaluate, export_results, predict_mc_dropout};
use mimo_uq::losses::UncertaintyLoss;
use mimo_uq::model::{MimoConfig, MimoNet};
use mimo_uq::trainer::{
    load_checkpoint, save_checkpoint, train_step, EarlyStopAction, EarlyStopping, Trainer,
    TrainerConfig,
};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;

const CHECKPOINT_PATH: &str = "mimo_checkpoint.safetensors";
const BEST_PATH: &str = "mimo_best.safetensors";
const BUFFER_PATH: &str = "mimo_loss_buffer.json";
const RESULTS_PATH: &str = "mimo_results.safetensors";

// ---------------------------------------------------------------------------
// Config Tier Selection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
enum ConfigTier {
    Test,
    Default,
}

impl ConfigTier {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "test" => Some(Self::Test),
            "default" => Some(Self::Default),
            _ => None,
        }
    }

    fn model_config(&self) -> MimoConfig {
        match self {
            Self::Test => MimoConfig::test(),
            Self::Default => MimoConfig::default_config(),
        }
    }

    fn trainer_config(&self) -> TrainerConfig {
        match self {
            Self::Test => TrainerConfig::test(),
            Self::Default => TrainerConfig::default_config(),
        }
    }

    fn data_config(&self) -> SyntheticConfig {
        match self {
            Self::Test => SyntheticConfig::test(),
            Self::Default => SyntheticConfig::default_config(),
        }
    }
}

/// Select device: CUDA if available and not test tier, else CPU.
fn select_device(tier: ConfigTier) -> Device {
    if tier == ConfigTier::Test {
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    {
        if candle_core::utils::cuda_is_available() {
            match Device::new_cuda(0) {
                Ok(dev) => {
                    eprintln!("[MIMO] Using CUDA device 0");
                    return dev;
                }
                Err(e) => {
                    eprintln!("[MIMO] CUDA init failed, falling back to CPU: {}", e);
                }
            }
        } else {
            eprintln!("[MIMO] CUDA not available, using CPU");
        }
    }

    #[cfg(not(feature = "cuda"))]
    {
        eprintln!("[MIMO] Built without CUDA feature, using CPU (rebuild with --features cuda for GPU)");
    }

    Device::Cpu
}

struct CliArgs {
    tier: ConfigTier,
    seed: u64,
    loss: Option<String>,
}

/// Parse `--config TIER`, `--seed N` and `--loss NAME` from args.
fn parse_args(args: &[String]) -> CliArgs {
    let mut parsed = CliArgs { tier: ConfigTier::Test, seed: 42, loss: None };
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                if let Some(next) = args.get(i + 1) {
                    match ConfigTier::from_str(next) {
                        Some(t) => parsed.tier = t,
                        None => eprintln!("[MIMO] Unknown config tier '{}', using test", next),
                    }
                    i += 1;
                }
            }
            "--seed" => {
                if let Some(next) = args.get(i + 1) {
                    match next.parse() {
                        Ok(s) => parsed.seed = s,
                        Err(_) => eprintln!("[MIMO] Invalid seed '{}', using 42", next),
                    }
                    i += 1;
                }
            }
            "--loss" => {
                if let Some(next) = args.get(i + 1) {
                    parsed.loss = Some(next.clone());
                    i += 1;
                }
            }
            other => eprintln!("[MIMO] Ignoring unknown argument '{}'", other),
        }
        i += 1;
    }
    parsed
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let command = args[1].as_str();
    let cli = parse_args(&args[2..]);

    let result = match command {
        "train" => cmd_train(&cli),
        "eval" => cmd_eval(&cli),
        _ => {
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("[MIMO] Error: {:#}", e);
        std::process::exit(1);
    }
}

fn print_usage() {
    eprintln!("Usage: mimo-uq <command> [--config test|default] [--seed N] [--loss NAME]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  train   Train the MIMO network on synthetic heteroscedastic fields");
    eprintln!("  eval    Evaluate a checkpoint and export result tensors");
    eprintln!();
    eprintln!("Losses: gaussian_nll, laplace_nll, cov_gaussian_nll (default laplace_nll)");
}

fn build_model(cli: &CliArgs, device: &Device) -> anyhow::Result<(MimoNet, VarMap)> {
    let mut config = cli.tier.model_config();
    if let Some(ref name) = cli.loss {
        config.loss = UncertaintyLoss::from_name(name)?;
    }
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = MimoNet::new(config, vb)?;
    Ok((model, varmap))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_train(cli: &CliArgs) -> anyhow::Result<()> {
    let device = select_device(cli.tier);
    let (model, varmap) = build_model(cli, &device)?;
    let trainer_cfg = cli.tier.trainer_config();
    let model_cfg = model.config();

    eprintln!(
        "[MIMO] Config: {:?} | M={} | p={} | loss={} | {} steps",
        cli.tier,
        model_cfg.num_subnetworks,
        model_cfg.input_repetition,
        model_cfg.loss.name(),
        trainer_cfg.total_steps
    );

    let mut buffer = LossBuffer::new(
        model_cfg.num_subnetworks,
        trainer_cfg.loss_buffer_size,
        trainer_cfg.loss_buffer_temperature,
    )?;
    let mut trainer = Trainer::new(&varmap, &trainer_cfg)?;
    let mut data = SyntheticField::new(cli.tier.data_config(), cli.seed)?;
    let mut rng = StdRng::seed_from_u64(cli.seed);
    let mut stopping = EarlyStopping::new(10, Some(BEST_PATH.to_string()));

    let total_steps = trainer_cfg.total_steps;
    let mut window = Vec::new();
    for step in 0..total_steps {
        let (inputs, targets) = data.next_batch(&device)?;
        let stats = train_step(&model, &inputs, &targets, &mut buffer, &mut trainer, &mut rng)?;
        window.push(stats.total_loss);

        if step % 10 == 0 {
            eprintln!(
                "[MIMO] step {:>5}/{} loss={:.4} members={:?} weights={:?} lr={:.2e}",
                stats.step, total_steps, stats.total_loss, stats.member_losses, stats.weights,
                stats.lr
            );
        }

        if window.len() == 25 {
            let avg = window.iter().sum::<f32>() / window.len() as f32;
            window.clear();
            if stopping.check(avg, stats.step, &varmap) == EarlyStopAction::Stop {
                break;
            }
        }
    }

    save_checkpoint(&varmap, CHECKPOINT_PATH)?;
    std::fs::write(BUFFER_PATH, serde_json::to_string_pretty(&buffer)?)?;
    eprintln!(
        "[MIMO] Training complete. Best loss {:.4} at step {}.",
        stopping.best_loss(),
        stopping.best_step()
    );
    Ok(())
}

fn cmd_eval(cli: &CliArgs) -> anyhow::Result<()> {
    let device = select_device(cli.tier);
    let (model, varmap) = build_model(cli, &device)?;

    if std::path::Path::new(CHECKPOINT_PATH).exists() {
        load_checkpoint(&varmap, CHECKPOINT_PATH, &device)?;
    } else {
        eprintln!("[MIMO] No checkpoint found, evaluating untrained model");
    }

    // Held-out generator: different seed stream than training.
    let mut data = SyntheticField::new(cli.tier.data_config(), cli.seed.wrapping_add(1))?;
    let mut batches = Vec::new();
    for _ in 0..8 {
        batches.push(data.next_batch(&device)?);
    }

    let summary = evaluate(&model, &batches)?;
    println!(
        "rmse={:.4} nll={:.4} aleatoric={:.4} epistemic={:.4} ({} batches)",
        summary.rmse, summary.mean_nll, summary.mean_aleatoric, summary.mean_epistemic,
        summary.num_batches
    );

    // Export one batch with MC-dropout ensembling for the downstream scripts.
    let (inputs, targets) = data.next_batch(&device)?;
    let pred = predict_mc_dropout(&model, &inputs, 4)?;
    export_results(RESULTS_PATH, &inputs, &targets, &pred)?;
    Ok(())
}
