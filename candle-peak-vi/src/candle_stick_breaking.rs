use candle_core::{Result, Tensor};

/// Stick-breaking construction over a batch of stick fractions.
///
/// Given `beta_nm` with entries in (0,1), returns (n x m+1) mixture
/// weights:
///
/// w(k) = beta(k) * prod_{j<k} (1 - beta(j))
///
/// with the last weight absorbing the remaining stick. Implemented as
/// `pad(beta, trailing 1) * pad(cumprod(1 - beta), leading 1)`; the
/// cumulative product runs through `exp(cumsum(log(1 - beta)))` since the
/// fractions are strictly inside the unit interval.
pub fn mix_weights(beta_nm: &Tensor) -> Result<Tensor> {
    let (n, _m) = beta_nm.dims2()?;
    let ones_n1 = Tensor::ones((n, 1), beta_nm.dtype(), beta_nm.device())?;

    let beta1m_cumprod = beta_nm.affine(-1.0, 1.0)?.log()?.cumsum(1)?.exp()?;

    let padded_beta = Tensor::cat(&[beta_nm, &ones_n1], 1)?;
    let padded_cumprod = Tensor::cat(&[&ones_n1, &beta1m_cumprod], 1)?;

    padded_beta.mul(&padded_cumprod)
}

/// Host-side twin of `mix_weights` for a single stick-fraction vector.
pub fn mix_weights_vec(beta: &[f64]) -> Vec<f64> {
    let mut weights = Vec::with_capacity(beta.len() + 1);
    let mut remaining = 1.0;
    for &b in beta {
        weights.push(b * remaining);
        remaining *= 1.0 - b;
    }
    weights.push(remaining);
    weights
}

/// Expected per-topic contribution under the geometric stick decay:
/// stick_len^i for topic i.
pub fn expected_stick_composition(stick_len: f64, num_topics: usize) -> Vec<f64> {
    (0..num_topics).map(|i| stick_len.powi(i as i32)).collect()
}
