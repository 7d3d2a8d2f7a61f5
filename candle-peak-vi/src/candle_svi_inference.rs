#![allow(dead_code)]

use crate::candle_model_traits::*;
use crate::candle_padded_data_loader::*;
use crate::candle_stick_breaking::mix_weights;
use crate::candle_topic_model::*;

use candle_core::{Result, Tensor};
use candle_nn::ops;
use candle_nn::AdamW;
use candle_nn::Optimizer;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub num_epochs: usize,
    /// epochs over which the KL weight ramps from 0 toward 1
    pub kl_warmup_epochs: usize,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            batch_size: 128,
            num_epochs: 24,
            kl_warmup_epochs: 8,
            device: candle_core::Device::Cpu,
            verbose: false,
            show_progress: false,
        }
    }
}

/// KL weight at a given epoch, `1 - exp(-(epoch + 1) / warmup)`
pub fn kl_anneal_factor(epoch: usize, warmup: usize) -> f64 {
    if warmup == 0 {
        1.0
    } else {
        1.0 - (-((epoch + 1) as f64) / warmup as f64).exp()
    }
}

pub struct TopicSvi<'a, Enc, Dec>
where
    Enc: PaddedEncoderModuleT,
    Dec: PeakDecoderModuleT,
{
    pub encoder: &'a Enc,
    pub decoder: &'a Dec,
    pub prior: &'a TopicPrior,
    pub variable_map: &'a candle_nn::VarMap,
}

pub trait TopicSviT<'a, Enc, Dec>
where
    Enc: PaddedEncoderModuleT,
    Dec: PeakDecoderModuleT,
{
    /// Run stochastic variational inference
    /// * `data` - data loader should have `minibatch_data`
    /// * `llik` - log likelihood of a minibatch given log reconstruction probabilities
    /// * `train_config` - training configuration
    fn train_topic_model<DataL, LlikFn>(
        &mut self,
        data: &mut DataL,
        llik: &LlikFn,
        train_config: &TrainConfig,
    ) -> anyhow::Result<Vec<f32>>
    where
        DataL: PaddedDataLoader,
        LlikFn: Fn(&Dec, &Tensor, &PaddedMinibatch, bool) -> Result<Tensor>;

    /// Build an SVI engine over borrowed modules
    fn build(
        encoder: &'a Enc,
        decoder: &'a Dec,
        prior: &'a TopicPrior,
        variable_map: &'a candle_nn::VarMap,
    ) -> Self;
}

impl<'a, Enc, Dec> TopicSvi<'a, Enc, Dec>
where
    Enc: PaddedEncoderModuleT,
    Dec: PeakDecoderModuleT,
{
    /// Sample the topic composition and the per-cell KL term for one
    /// minibatch. The dirichlet-process prior also reports its global
    /// concentration KL.
    fn sample_topics(
        &self,
        loc_nk: &Tensor,
        scale_nk: &Tensor,
    ) -> Result<(Tensor, Tensor, Option<Tensor>)> {
        match self.prior {
            TopicPrior::LogisticNormal => {
                let z_nk = reparameterize(loc_nk, scale_nk, true)?;
                let theta_nk = ops::softmax(&z_nk, 1)?;
                let kl_n = gaussian_kl_loss(loc_nk, scale_nk)?;
                Ok((theta_nk, kl_n, None))
            }
            TopicPrior::DirichletProcess(concentration) => {
                let kk = loc_nk.dims2()?.1;
                let loc_nm = loc_nk.narrow(1, 0, kk - 1)?;
                let scale_nm = scale_nk.narrow(1, 0, kk - 1)?;

                let z_nm = reparameterize(&loc_nm, &scale_nm, true)?;
                let beta_nm = ops::sigmoid(&z_nm)?;
                let theta_nk = mix_weights(&beta_nm)?;

                let kl_n = stick_breaking_kl(&z_nm, &loc_nm, &scale_nm, concentration)?;
                let kl_global = concentration.kl_to_prior()?;
                Ok((theta_nk, kl_n, Some(kl_global)))
            }
        }
    }
}

impl<'a, Enc, Dec> TopicSviT<'a, Enc, Dec> for TopicSvi<'a, Enc, Dec>
where
    Enc: PaddedEncoderModuleT,
    Dec: PeakDecoderModuleT,
{
    fn train_topic_model<DataL, LlikFn>(
        &mut self,
        data: &mut DataL,
        llik_func: &LlikFn,
        train_config: &TrainConfig,
    ) -> anyhow::Result<Vec<f32>>
    where
        DataL: PaddedDataLoader,
        LlikFn: Fn(&Dec, &Tensor, &PaddedMinibatch, bool) -> Result<Tensor>,
    {
        let device = &train_config.device;
        let n_total = data.num_cells();
        let mut adam = AdamW::new_lr(
            self.variable_map.all_vars(),
            train_config.learning_rate.into(),
        )?;

        let pb = ProgressBar::new(train_config.num_epochs as u64);

        if !train_config.show_progress || train_config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut llik_trace = vec![];

        data.shuffle_minibatch(train_config.batch_size);

        let minibatch_vec = (0..data.num_minibatch())
            .map(|b| data.minibatch_data(b, device))
            .collect::<anyhow::Result<Vec<_>>>()?;

        for epoch in 0..train_config.num_epochs {
            let anneal = kl_anneal_factor(epoch, train_config.kl_warmup_epochs);
            let mut llik_tot = 0f32;

            for mb in minibatch_vec.iter() {
                let side = EncoderSideData {
                    read_depth_n1: &mb.read_depth_n1,
                    covariates_nc: mb.covariates_nc.as_ref(),
                    extra_ne: mb.extra_ne.as_ref(),
                };

                let (loc_nk, scale_nk) = self.encoder.forward_t(&mb.endog_nw, side, true)?;
                let (theta_nk, kl_n, kl_global) = self.sample_topics(&loc_nk, &scale_nk)?;

                let llik = llik_func(self.decoder, &theta_nk, mb, true)?;

                let mut loss = ((kl_n * anneal)? - &llik)?.mean_all()?;
                if let Some(kl_global) = kl_global {
                    // one global term amortized over the data set
                    loss = loss.broadcast_add(
                        &(kl_global.sum_all()? / n_total.max(1) as f64)?,
                    )?;
                }

                let loss_val = loss.to_scalar::<f32>()?;
                anyhow::ensure!(
                    loss_val.is_finite(),
                    "loss diverged at epoch {}; lower the learning rate or \
                     increase KL warm-up",
                    epoch + 1
                );

                adam.backward_step(&loss)?;
                llik_tot += llik.sum_all()?.to_scalar::<f32>()?;
            }
            llik_trace.push(llik_tot / n_total.max(1) as f32);
            pb.inc(1);

            if train_config.verbose {
                info!(
                    "[{}] log-likelihood: {}",
                    epoch + 1,
                    llik_trace.last().ok_or(anyhow::anyhow!("llik"))?
                );
            }
        }
        pb.finish_and_clear();
        Ok(llik_trace)
    }

    fn build(
        encoder: &'a Enc,
        decoder: &'a Dec,
        prior: &'a TopicPrior,
        variable_map: &'a candle_nn::VarMap,
    ) -> Self {
        Self {
            encoder,
            decoder,
            prior,
            variable_map,
        }
    }
}
