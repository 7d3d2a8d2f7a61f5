use candle_core::{DType, Result, Tensor};
use special::Gamma;

/// `log Gamma(x + 1)` evaluated off-graph; the factorial terms of the
/// padded multinomials depend only on the observed data, never on model
/// parameters, so no gradient needs to flow through them.
fn lgamma1p_host(x: &Tensor) -> Result<Tensor> {
    let dims = x.dims().to_vec();
    let vals = x.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    let out: Vec<f32> = vals
        .iter()
        .map(|&v| Gamma::ln_gamma(v as f64 + 1.0).0 as f32)
        .collect();
    Tensor::from_vec(out, dims, x.device())
}

/// Prefix the per-peak log-probability table with a zero column so the
/// padding index 0 gathers exactly 0 log-probability mass.
fn pad_log_prob_table(log_prob_nd: &Tensor) -> Result<Tensor> {
    let (n, _d) = log_prob_nd.dims2()?;
    let zeros_n1 = Tensor::zeros((n, 1), log_prob_nd.dtype(), log_prob_nd.device())?;
    Tensor::cat(&[&zeros_n1, log_prob_nd], 1)
}

/// Zero-padded binary multinomial log-likelihood.
///
/// `idx_nw` holds 1-based peak indices (0 = padding) and every real hit has
/// count exactly 1, so the multinomial coefficient collapses to `log N!`
/// with N the number of real hits per row:
///
/// llik(i) = log N_i! + sum_j log p(i, idx(i,j))
///
/// * `log_prob_nd` - per-cell log peak probabilities (n x d)
/// * `idx_nw` - padded index matrix (n x w), integer dtype
///
/// No sample validation is performed; the padded layout is deliberately
/// not a dense count vector.
pub fn zero_padded_binary_multinomial_llik(
    log_prob_nd: &Tensor,
    idx_nw: &Tensor,
) -> Result<Tensor> {
    let padded_nd1 = pad_log_prob_table(log_prob_nd)?;
    let log_powers_n = padded_nd1.gather(&idx_nw.contiguous()?, 1)?.sum(1)?;

    let nnz_n = idx_nw.to_dtype(DType::F32)?.gt(0.0)?.to_dtype(DType::F32)?.sum(1)?;
    let log_factorial_n = lgamma1p_host(&nnz_n)?;

    log_factorial_n + log_powers_n
}

/// Zero-padded multinomial log-likelihood for integer counts.
///
/// llik(i) = log N_i! - sum_j log count(i,j)! + sum_j count-weighted gather
///
/// where N_i = sum_j count(i,j) and slot j of `count_nw` pairs with slot j
/// of `idx_nw` (both 0 beyond a row's true number of peaks).
pub fn zero_padded_multinomial_llik(
    log_prob_nd: &Tensor,
    idx_nw: &Tensor,
    count_nw: &Tensor,
) -> Result<Tensor> {
    let padded_nd1 = pad_log_prob_table(log_prob_nd)?;
    let gathered_nw = padded_nd1.gather(&idx_nw.contiguous()?, 1)?;
    let log_powers_n = gathered_nw.mul(&count_nw.to_dtype(gathered_nw.dtype())?)?.sum(1)?;

    let total_n = count_nw.sum(1)?;
    let log_factorial_n = lgamma1p_host(&total_n)?;
    let log_factorial_xs_n = lgamma1p_host(count_nw)?.sum(1)?;

    (log_factorial_n - log_factorial_xs_n)? + log_powers_n
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn single_hit_equals_plain_log_prob() -> Result<()> {
        let dev = Device::Cpu;
        let probs = vec![0.1_f32, 0.2, 0.3, 0.4];
        let log_prob = Tensor::from_vec(probs.clone(), (1, 4), &dev)?.log()?;

        // one hit at peak 2 (1-based index 3), rest padding
        let idx = Tensor::from_vec(vec![3_i64, 0, 0], (1, 3), &dev)?;
        let llik = zero_padded_binary_multinomial_llik(&log_prob, &idx)?.to_vec1::<f32>()?;

        assert!((llik[0] - probs[2].ln()).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn padding_contributes_no_mass() -> Result<()> {
        let dev = Device::Cpu;
        let log_prob =
            Tensor::from_vec(vec![0.25_f32, 0.25, 0.25, 0.25], (1, 4), &dev)?.log()?;

        let narrow = Tensor::from_vec(vec![1_i64, 2], (1, 2), &dev)?;
        let wide = Tensor::from_vec(vec![1_i64, 2, 0, 0, 0], (1, 5), &dev)?;

        let a = zero_padded_binary_multinomial_llik(&log_prob, &narrow)?.to_vec1::<f32>()?;
        let b = zero_padded_binary_multinomial_llik(&log_prob, &wide)?.to_vec1::<f32>()?;
        assert!((a[0] - b[0]).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn binary_llik_includes_permutation_count() -> Result<()> {
        let dev = Device::Cpu;
        let log_prob =
            Tensor::from_vec(vec![0.5_f32, 0.25, 0.25], (1, 3), &dev)?.log()?;

        let idx = Tensor::from_vec(vec![1_i64, 2], (1, 2), &dev)?;
        let llik = zero_padded_binary_multinomial_llik(&log_prob, &idx)?.to_vec1::<f32>()?;

        // log 2! + log 0.5 + log 0.25
        let want = (2.0_f32).ln() + 0.5_f32.ln() + 0.25_f32.ln();
        assert!((llik[0] - want).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn count_variant_matches_dense_multinomial() -> Result<()> {
        let dev = Device::Cpu;
        let probs = vec![0.5_f32, 0.3, 0.2];
        let log_prob = Tensor::from_vec(probs.clone(), (1, 3), &dev)?.log()?;

        // counts x = (2, 0, 1): hits at peaks 0 and 2
        let idx = Tensor::from_vec(vec![1_i64, 3], (1, 2), &dev)?;
        let count = Tensor::from_vec(vec![2.0_f32, 1.0], (1, 2), &dev)?;

        let llik = zero_padded_multinomial_llik(&log_prob, &idx, &count)?.to_vec1::<f32>()?;

        // log 3! - log 2! - log 1! + 2 log 0.5 + log 0.2
        let want = (6.0_f32).ln() - (2.0_f32).ln() + 2.0 * 0.5_f32.ln() + 0.2_f32.ln();
        assert!((llik[0] - want).abs() < 1e-5);
        Ok(())
    }
}
