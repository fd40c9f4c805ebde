// Subnetwork input routing — turns one physical batch into the M-way stacked
// input consumed by the MIMO network.
//
// Default assignment is identity: member m's slot for sample i holds sample i.
// With probability `input_repetition` a slot is instead filled with a
// uniformly resampled sample from the same batch (with replacement). The
// substitution is what decorrelates the virtual ensemble members despite full
// weight sharing; p=0 degenerates to plain replication.

use anyhow::Result;
use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::Rng;

/// Build the `[B, M, C, H, W]` routed input for one forward pass.
///
/// The random source is threaded explicitly so a fixed seed reproduces the
/// exact slot assignment. With `input_repetition == 0.0` no draws are made at
/// all and the output is the batch replicated across every member slot.
pub fn route_batch(
    batch: &Tensor,
    num_subnetworks: usize,
    input_repetition: f64,
    rng: &mut StdRng,
) -> Result<Tensor> {
    let (b, _c, _h, _w) = batch.dims4()?;

    let mut slots = Vec::with_capacity(num_subnetworks);
    for _ in 0..num_subnetworks {
        if input_repetition <= 0.0 {
            slots.push(batch.clone());
            continue;
        }

        let mut take: Vec<u32> = Vec::with_capacity(b);
        let mut identity = true;
        for i in 0..b {
            if rng.gen::<f64>() < input_repetition {
                take.push(rng.gen_range(0..b) as u32);
                identity = false;
            } else {
                take.push(i as u32);
            }
        }

        if identity {
            slots.push(batch.clone());
        } else {
            let idx = Tensor::from_vec(take, b, batch.device())?;
            slots.push(batch.index_select(&idx, 0)?);
        }
    }

    Tensor::stack(&slots, 1).map_err(Into::into)
}

/// Deterministic replication for the inference path: every member slot sees
/// the unmodified batch. Equivalent to `route_batch` with p=0 but without a
/// random source in the signature.
pub fn replicate_batch(batch: &Tensor, num_subnetworks: usize) -> Result<Tensor> {
    batch.dims4()?;
    let slots: Vec<Tensor> = (0..num_subnetworks).map(|_| batch.clone()).collect();
    Tensor::stack(&slots, 1).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::SeedableRng;

    fn batch(b: usize) -> Tensor {
        Tensor::rand(0f32, 1.0, (b, 3, 4, 4), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_routed_shape() -> Result<()> {
        let x = batch(5);
        let mut rng = StdRng::seed_from_u64(7);
        let routed = route_batch(&x, 4, 0.5, &mut rng)?;
        assert_eq!(routed.dims5()?, (5, 4, 3, 4, 4));
        Ok(())
    }

    #[test]
    fn test_zero_repetition_is_plain_replication() -> Result<()> {
        let x = batch(3);
        let mut rng = StdRng::seed_from_u64(0);
        let routed = route_batch(&x, 3, 0.0, &mut rng)?;
        let expected = x.flatten_all()?.to_vec1::<f32>()?;
        for m in 0..3 {
            let slot = routed.narrow(1, m, 1)?.squeeze(1)?;
            let got = slot.flatten_all()?.to_vec1::<f32>()?;
            assert_eq!(got, expected, "member {m} should see the raw batch");
        }
        Ok(())
    }

    #[test]
    fn test_fixed_seed_reproduces_routing() -> Result<()> {
        let x = batch(6);
        let a = route_batch(&x, 3, 0.7, &mut StdRng::seed_from_u64(42))?;
        let b = route_batch(&x, 3, 0.7, &mut StdRng::seed_from_u64(42))?;
        assert_eq!(
            a.flatten_all()?.to_vec1::<f32>()?,
            b.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn test_full_repetition_draws_from_batch() -> Result<()> {
        // With p=1 every slot is resampled, but each slot must still hold some
        // sample of the original batch.
        let x = batch(4);
        let mut rng = StdRng::seed_from_u64(9);
        let routed = route_batch(&x, 2, 1.0, &mut rng)?;

        let originals: Vec<Vec<f32>> = (0..4)
            .map(|i| x.narrow(0, i, 1)?.flatten_all()?.to_vec1::<f32>())
            .collect::<candle_core::Result<_>>()?;

        for m in 0..2 {
            for i in 0..4 {
                let slot = routed
                    .narrow(0, i, 1)?
                    .narrow(1, m, 1)?
                    .flatten_all()?
                    .to_vec1::<f32>()?;
                assert!(
                    originals.iter().any(|o| *o == slot),
                    "slot ({i},{m}) does not match any batch sample"
                );
            }
        }
        Ok(())
    }

    #[test]
    fn test_single_member_replicate() -> Result<()> {
        let x = batch(2);
        let routed = replicate_batch(&x, 1)?;
        assert_eq!(routed.dims5()?, (2, 1, 3, 4, 4));
        Ok(())
    }
}
