#![allow(dead_code)]

use candle_core::{Result, Tensor};

/// Side information fed to the encoder together with the observed features.
pub struct EncoderSideData<'a> {
    /// per-cell read depth (n x 1); recomputed from the index matrix unless
    /// the encoder is configured for the back-compat supplied-depth path
    pub read_depth_n1: &'a Tensor,
    /// per-cell covariates (n x c)
    pub covariates_nc: Option<&'a Tensor>,
    /// per-cell extra features (n x e)
    pub extra_ne: Option<&'a Tensor>,
}

/// Amortized inference network over padded index data.
pub trait PaddedEncoderModuleT {
    /// Variational posterior parameters over the topic logits.
    ///
    /// # Arguments
    /// * `idx_nw` - padded 1-based index matrix (n x w), 0 = padding
    /// * `side` - read depth, covariates, extra features
    /// * `train` - whether to apply word dropout / parameter dropout
    ///
    /// # Returns `(theta_loc_nk, theta_scale_nk)`
    /// * `theta_loc_nk` - posterior location (n x k)
    /// * `theta_scale_nk` - posterior scale, strictly positive (n x k)
    fn forward_t(
        &self,
        idx_nw: &Tensor,
        side: EncoderSideData,
        train: bool,
    ) -> Result<(Tensor, Tensor)>;

    fn dim_latent(&self) -> usize;

    /// Point estimate of topic proportions: softmax over the posterior
    /// location, detached from the graph.
    fn topic_comps(&self, idx_nw: &Tensor, side: EncoderSideData) -> Result<Tensor> {
        let (theta_loc_nk, _) = self.forward_t(idx_nw, side, false)?;
        let theta_nk = candle_nn::ops::softmax(&theta_loc_nk, 1)?;
        theta_nk.detach().contiguous()
    }

    /// Point estimate under the stick-breaking posterior: sigmoid of the
    /// location gives stick fractions, the first k-1 of which are folded
    /// into mixture weights.
    fn stick_comps(&self, idx_nw: &Tensor, side: EncoderSideData) -> Result<Tensor> {
        let (theta_loc_nk, _) = self.forward_t(idx_nw, side, false)?;
        let v_nk = candle_nn::ops::sigmoid(&theta_loc_nk)?;
        let k = self.dim_latent();
        let theta_nk = crate::candle_stick_breaking::mix_weights(&v_nk.narrow(1, 0, k - 1)?)?;
        theta_nk.detach().contiguous()
    }
}

/// Generative network mapping topic proportions (+ covariates) to the
/// parameters of the per-feature observation likelihood.
pub trait PeakDecoderModuleT {
    /// log per-feature probabilities (n x d) given simplex points `theta_nk`
    fn forward_t(
        &self,
        theta_nk: &Tensor,
        covariates_nc: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor>;

    /// log-normalized dictionary matrix (d x k)
    fn get_dictionary(&self) -> Result<Tensor>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}
