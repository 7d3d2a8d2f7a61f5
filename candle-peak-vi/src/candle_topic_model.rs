#![allow(dead_code)]

use crate::candle_aux_layers::{approx_digamma, approx_lgamma, softplus};
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;
use special::Gamma;

const LN_2PI: f64 = 1.8378770664093453;

/// KL divergence between `N(loc, scale^2)` and the standard normal,
/// summed within each row
///
/// 0.5 * sum_k (scale^2 + loc^2 - 1 - 2 * log(scale))
///
pub fn gaussian_kl_loss(loc_nk: &Tensor, scale_nk: &Tensor) -> Result<Tensor> {
    let var_nk = scale_nk.powf(2.)?;
    (var_nk - 1. + loc_nk.powf(2.)?)?.sub(&(scale_nk.log()? * 2.)?)?.sum(1)? * 0.5
}

/// One-sample reparameterized draw from `N(loc, scale^2)`. At evaluation
/// time the posterior mean is returned instead.
pub fn reparameterize(loc_nk: &Tensor, scale_nk: &Tensor, train: bool) -> Result<Tensor> {
    if train {
        let eps_nk = loc_nk.randn_like(0., 1.)?;
        loc_nk.add(&scale_nk.mul(&eps_nk)?)
    } else {
        Ok(loc_nk.clone())
    }
}

/// log N(z | loc, scale^2), summed within each row
pub fn normal_log_prob(z_nk: &Tensor, loc_nk: &Tensor, scale_nk: &Tensor) -> Result<Tensor> {
    let standardized_nk = z_nk.sub(loc_nk)?.div(scale_nk)?;
    (scale_nk.log()?.neg()? - 0.5 * LN_2PI)?
        .sub(&(standardized_nk.powf(2.)? * 0.5)?)?
        .sum(1)
}

///////////////////////////////////////
// Dirichlet process stick breaking  //
///////////////////////////////////////

/// Variational posterior over the Dirichlet-process concentration:
/// `alpha ~ Gamma(shape, rate)` with unconstrained parameters kept
/// positive through softplus.
pub struct DpConcentration {
    shape_raw: Tensor,
    rate_raw: Tensor,
    prior_shape: f64,
    prior_rate: f64,
}

impl DpConcentration {
    pub fn new(prior_shape: f64, prior_rate: f64, vs: VarBuilder) -> Result<Self> {
        // start the guide at the prior; softplus_inv maps through the
        // positivity constraint
        let softplus_inv = |v: f64| (v.exp() - 1.0).ln();
        let shape_raw = vs.get_with_hints(
            (1,),
            "alpha_shape",
            candle_nn::Init::Const(softplus_inv(prior_shape)),
        )?;
        let rate_raw = vs.get_with_hints(
            (1,),
            "alpha_rate",
            candle_nn::Init::Const(softplus_inv(prior_rate)),
        )?;
        Ok(Self {
            shape_raw,
            rate_raw,
            prior_shape,
            prior_rate,
        })
    }

    /// positive (shape, rate) of the Gamma guide
    pub fn shape_rate(&self) -> Result<(Tensor, Tensor)> {
        Ok((softplus(&self.shape_raw)?, softplus(&self.rate_raw)?))
    }

    /// E_q[alpha] = shape / rate
    pub fn expected_alpha(&self) -> Result<Tensor> {
        let (a, b) = self.shape_rate()?;
        a.div(&b)
    }

    /// E_q[log alpha] = digamma(shape) - log(rate)
    pub fn expected_log_alpha(&self) -> Result<Tensor> {
        let (a, b) = self.shape_rate()?;
        approx_digamma(&a)?.sub(&b.log()?)
    }

    /// posterior mean concentration as a host scalar
    pub fn posterior_mean(&self) -> Result<f64> {
        Ok(self.expected_alpha()?.to_vec1::<f32>()?[0] as f64)
    }

    /// KL(Gamma(a, b) || Gamma(a0, b0)), analytic
    ///
    /// (a - a0) * digamma(a) - lgamma(a) + lgamma(a0)
    ///   + a0 * (log(b) - log(b0)) + a * (b0 - b) / b
    ///
    pub fn kl_to_prior(&self) -> Result<Tensor> {
        let (a, b) = self.shape_rate()?;
        let (a0, b0) = (self.prior_shape, self.prior_rate);
        let lgamma_a0 = a0.ln_gamma().0;

        let term1 = (a.clone() - a0)?.mul(&approx_digamma(&a)?)?;
        let term2 = approx_lgamma(&a)?.affine(-1.0, lgamma_a0)?;
        let term3 = b.log()?.affine(a0, -a0 * b0.ln())?;
        let term4 = a.mul(&b.recip()?.affine(b0, -1.0)?)?;
        term1.add(&term2)?.add(&term3)?.add(&term4)
    }
}

/// Prior over the per-cell topic composition. `LogisticNormal` keeps a
/// fixed number of topics; `DirichletProcess` lets the stick-breaking
/// weights switch off unused ones.
pub enum TopicPrior {
    LogisticNormal,
    DirichletProcess(DpConcentration),
}

/// Per-cell KL contribution of the stick-breaking posterior against the
/// `Beta(1, alpha)` prior, with the concentration integrated under its
/// Gamma guide. The guide places a normal on the logit scale, so the
/// sigmoid Jacobian `beta * (1 - beta)` enters the prior side.
///
/// E_q[log p(beta)] + log|d beta / d z|
///   = E[log alpha] + E[alpha] * log(1 - beta) + log(beta)
///
/// * `z_nm` - sampled stick logits
/// * `loc_nm`, `scale_nm` - posterior parameters that produced `z_nm`
pub fn stick_breaking_kl(
    z_nm: &Tensor,
    loc_nm: &Tensor,
    scale_nm: &Tensor,
    concentration: &DpConcentration,
) -> Result<Tensor> {
    let n_sticks = z_nm.dims2()?.1;

    // log(beta) = -softplus(-z), log(1 - beta) = -softplus(z)
    let log_beta_nm = softplus(&z_nm.neg()?)?.neg()?;
    let log_one_minus_beta_nm = softplus(z_nm)?.neg()?;

    let e_alpha = concentration.expected_alpha()?;
    let e_log_alpha = concentration.expected_log_alpha()?;

    let log_prior_n = log_one_minus_beta_nm
        .broadcast_mul(&e_alpha)?
        .add(&log_beta_nm)?
        .sum(1)?
        .broadcast_add(&(e_log_alpha * n_sticks as f64)?)?;

    normal_log_prob(z_nm, loc_nm, scale_nm)?.sub(&log_prior_n)
}

//////////////////////////////////
// Expression observation model //
//////////////////////////////////

/// Negative-Binomial log-likelihood with per-feature dispersion,
/// summed within each row
///
/// llik(i) = sum_g lgamma(x + phi) - lgamma(phi) - lgamma(x + 1)
///           + phi * (log(phi) - log(phi + mu))
///           + x * (log(mu) - log(phi + mu))
///
/// * `x_nd` - observed counts
/// * `log_mu_nd` - log mean rates
/// * `phi_1d` - positive dispersion, broadcast across rows
///
pub fn negative_binomial_llik(
    x_nd: &Tensor,
    log_mu_nd: &Tensor,
    phi_1d: &Tensor,
) -> Result<Tensor> {
    let mu_nd = log_mu_nd.exp()?;
    let log_denom_nd = mu_nd.broadcast_add(phi_1d)?.log()?;

    let term1 = approx_lgamma(&x_nd.broadcast_add(phi_1d)?)?
        .broadcast_sub(&approx_lgamma(phi_1d)?)?
        .sub(&approx_lgamma(&(x_nd + 1.0)?)?)?;

    let term2 = phi_1d
        .log()?
        .broadcast_sub(&log_denom_nd)?
        .broadcast_mul(phi_1d)?;

    let term3 = x_nd.mul(&log_mu_nd.sub(&log_denom_nd)?)?;

    term1.add(&term2)?.add(&term3)?.sum(1)
}
