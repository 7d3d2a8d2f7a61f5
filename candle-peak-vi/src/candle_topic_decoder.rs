#![allow(dead_code)]

use crate::candle_aux_layers::softplus;
use crate::candle_aux_linear::*;
use crate::candle_model_traits::*;
use candle_core::{Result, Tensor};
use candle_nn::{ops, Dropout, Linear, Module, ModuleT, VarBuilder};

/////////////////////////
// Topic Model Decoder //
/////////////////////////

/// Accessibility decoder: a softmax dictionary over peaks with an additive
/// covariate effect on the logits. Output feeds the zero-padded multinomial
/// likelihoods.
pub struct PeakTopicDecoder {
    n_peaks: usize,
    n_topics: usize,
    dictionary: SoftmaxLinear,
    covar_effect: Option<Linear>,
    dropout: Dropout,
}

impl PeakTopicDecoder {
    /// Will create a new topic model decoder with the following parameters:
    /// * `dictionary.weight`
    /// * `covar.weight` when covariates are present
    pub fn new(
        n_peaks: usize,
        n_topics: usize,
        n_covariates: usize,
        dropout: f32,
        vs: VarBuilder,
    ) -> Result<Self> {
        let dictionary = softmax_linear(n_topics, n_peaks, vs.pp("dictionary"))?;
        let covar_effect = if n_covariates > 0 {
            Some(candle_nn::linear_no_bias(
                n_covariates,
                n_peaks,
                vs.pp("covar"),
            )?)
        } else {
            None
        };

        Ok(Self {
            n_peaks,
            n_topics,
            dictionary,
            covar_effect,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn dictionary(&self) -> &SoftmaxLinear {
        &self.dictionary
    }
}

impl PeakDecoderModuleT for PeakTopicDecoder {
    fn forward_t(
        &self,
        theta_nk: &Tensor,
        covariates_nc: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let theta_nk = self.dropout.forward_t(theta_nk, train)?;
        let log_mix_nd = self.dictionary.forward_log(&theta_nk)?;

        match (covariates_nc, &self.covar_effect) {
            (Some(covar_nc), Some(effect)) => {
                let logits_nd = log_mix_nd.add(&effect.forward(covar_nc)?)?;
                ops::log_softmax(&logits_nd, 1)
            }
            _ => Ok(log_mix_nd),
        }
    }

    fn get_dictionary(&self) -> Result<Tensor> {
        self.dictionary.weight_dk()
    }

    fn dim_obs(&self) -> usize {
        self.n_peaks
    }

    fn dim_latent(&self) -> usize {
        self.n_topics
    }
}

////////////////////////////////
// Expression Model Decoder   //
////////////////////////////////

/// Expression decoder: softmax dictionary over genes giving a relative
/// expression rate, plus a global per-gene dispersion for the
/// Negative-Binomial observation model.
pub struct ExpressionTopicDecoder {
    n_genes: usize,
    n_topics: usize,
    dictionary: SoftmaxLinear,
    covar_effect: Option<Linear>,
    dropout: Dropout,
    // unconstrained; softplus keeps the dispersion strictly positive
    dispersion_logit_1d: Tensor,
}

impl ExpressionTopicDecoder {
    pub fn new(
        n_genes: usize,
        n_topics: usize,
        n_covariates: usize,
        dropout: f32,
        vs: VarBuilder,
    ) -> Result<Self> {
        let dictionary = softmax_linear(n_topics, n_genes, vs.pp("dictionary"))?;
        let covar_effect = if n_covariates > 0 {
            Some(candle_nn::linear_no_bias(
                n_covariates,
                n_genes,
                vs.pp("covar"),
            )?)
        } else {
            None
        };

        let init_val = candle_nn::Init::Const(5.0);
        let dispersion_logit_1d = vs.get_with_hints((1, n_genes), "dispersion_logit", init_val)?;

        Ok(Self {
            n_genes,
            n_topics,
            dictionary,
            covar_effect,
            dropout: Dropout::new(dropout),
            dispersion_logit_1d,
        })
    }

    /// strictly positive per-gene dispersion (1 x d)
    pub fn dispersion_1d(&self) -> Result<Tensor> {
        softplus(&self.dispersion_logit_1d)
    }
}

impl PeakDecoderModuleT for ExpressionTopicDecoder {
    fn forward_t(
        &self,
        theta_nk: &Tensor,
        covariates_nc: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let theta_nk = self.dropout.forward_t(theta_nk, train)?;
        let log_rate_nd = self.dictionary.forward_log(&theta_nk)?;

        match (covariates_nc, &self.covar_effect) {
            (Some(covar_nc), Some(effect)) => {
                let logits_nd = log_rate_nd.add(&effect.forward(covar_nc)?)?;
                ops::log_softmax(&logits_nd, 1)
            }
            _ => Ok(log_rate_nd),
        }
    }

    fn get_dictionary(&self) -> Result<Tensor> {
        self.dictionary.weight_dk()
    }

    fn dim_obs(&self) -> usize {
        self.n_genes
    }

    fn dim_latent(&self) -> usize {
        self.n_topics
    }
}
