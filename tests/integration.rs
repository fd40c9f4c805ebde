// End-to-end integration tests
//
// Exercises the full training and inference paths on the test-sized config:
// route → forward → weighted NLL → backward → buffer update, then
// replicate → forward → decompose → export. CPU only.

use mimo_uq::buffer::LossBuffer;
use mimo_uq::data::{SyntheticConfig, SyntheticField};
use mimo_uq::eval::predict;
use mimo_uq::losses::UncertaintyLoss;
use mimo_uq::model::{MimoConfig, MimoNet};
use mimo_uq::trainer::{load_checkpoint, save_checkpoint, train_step, Trainer, TrainerConfig};

use anyhow::Result;
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn build(config: MimoConfig) -> Result<(MimoNet, VarMap)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = MimoNet::new(config, vb)?;
    Ok((model, varmap))
}

fn run_training(
    model: &MimoNet,
    varmap: &VarMap,
    steps: usize,
    seed: u64,
) -> Result<(Vec<f32>, LossBuffer)> {
    let tcfg = TrainerConfig::test();
    let mut trainer = Trainer::new(varmap, &tcfg)?;
    let mut buffer = LossBuffer::new(
        model.config().num_subnetworks,
        tcfg.loss_buffer_size,
        tcfg.loss_buffer_temperature,
    )?;
    let mut data = SyntheticField::new(SyntheticConfig::test(), seed)?;
    let mut rng = StdRng::seed_from_u64(seed);

    let mut losses = Vec::with_capacity(steps);
    for _ in 0..steps {
        let (x, y) = data.next_batch(&Device::Cpu)?;
        let stats = train_step(model, &x, &y, &mut buffer, &mut trainer, &mut rng)?;
        losses.push(stats.total_loss);
    }
    Ok((losses, buffer))
}

#[test]
fn test_training_reduces_loss_laplace() -> Result<()> {
    let (model, varmap) = build(MimoConfig::test())?;
    let (losses, buffer) = run_training(&model, &varmap, 60, 11)?;

    let early: f32 = losses[..10].iter().sum::<f32>() / 10.0;
    let late: f32 = losses[losses.len() - 10..].iter().sum::<f32>() / 10.0;
    assert!(
        late < early,
        "loss should decrease over training: {early:.4} -> {late:.4}"
    );

    // Buffer saw one entry per step, bounded at capacity.
    assert_eq!(buffer.history_len(0), 10);
    let w = buffer.weights();
    assert!((w.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    Ok(())
}

#[test]
fn test_training_step_covariance_loss() -> Result<()> {
    let cfg = MimoConfig {
        loss: UncertaintyLoss::CovGaussianNll { block: 2 },
        ..MimoConfig::test()
    };
    let (model, varmap) = build(cfg)?;
    let (losses, _) = run_training(&model, &varmap, 10, 5)?;
    for l in &losses {
        assert!(l.is_finite(), "covariance training produced non-finite loss");
    }
    Ok(())
}

#[test]
fn test_inference_decomposition_is_additive() -> Result<()> {
    let (model, varmap) = build(MimoConfig::test())?;
    run_training(&model, &varmap, 20, 3)?;

    let mut data = SyntheticField::new(SyntheticConfig::test(), 99)?;
    let (x, _) = data.next_batch(&Device::Cpu)?;
    let pred = predict(&model, &x)?;

    let total = pred.total()?.flatten_all()?.to_vec1::<f32>()?;
    let alea = pred.aleatoric.flatten_all()?.to_vec1::<f32>()?;
    let epi = pred.epistemic.flatten_all()?.to_vec1::<f32>()?;
    for ((t, a), e) in total.iter().zip(&alea).zip(&epi) {
        assert!((t - (a + e)).abs() < 1e-5);
        assert!(*a >= 0.0 && *e >= 0.0);
    }
    Ok(())
}

#[test]
fn test_checkpoint_round_trip_preserves_predictions() -> Result<()> {
    let (model, varmap) = build(MimoConfig::test())?;
    run_training(&model, &varmap, 15, 7)?;

    let mut data = SyntheticField::new(SyntheticConfig::test(), 1)?;
    let (x, _) = data.next_batch(&Device::Cpu)?;
    let before = predict(&model, &x)?.mean.flatten_all()?.to_vec1::<f32>()?;

    let path = std::env::temp_dir().join(format!("mimo_ckpt_{}.safetensors", std::process::id()));
    let path_str = path.to_string_lossy().into_owned();
    save_checkpoint(&varmap, &path_str)?;

    let (restored, restored_varmap) = build(MimoConfig::test())?;
    load_checkpoint(&restored_varmap, &path_str, &Device::Cpu)?;
    let after = predict(&restored, &x)?.mean.flatten_all()?.to_vec1::<f32>()?;

    assert_eq!(before, after, "restored model should predict identically");
    std::fs::remove_file(&path)?;
    Ok(())
}

#[test]
fn test_gaussian_loss_end_to_end() -> Result<()> {
    let cfg = MimoConfig { loss: UncertaintyLoss::GaussianNll, ..MimoConfig::test() };
    let (model, varmap) = build(cfg)?;
    let (losses, _) = run_training(&model, &varmap, 30, 13)?;
    assert!(losses.iter().all(|l| l.is_finite()));

    let mut data = SyntheticField::new(SyntheticConfig::test(), 50)?;
    let (x, _) = data.next_batch(&Device::Cpu)?;
    let pred = predict(&model, &x)?;
    for v in pred.aleatoric.flatten_all()?.to_vec1::<f32>()? {
        assert!(v > 0.0, "Gaussian aleatoric variance should be strictly positive");
    }
    Ok(())
}
