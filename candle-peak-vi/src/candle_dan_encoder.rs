use crate::candle_aux_layers::*;
use crate::candle_model_traits::*;
use candle_core::{DType, Result, Tensor};
use candle_nn::{Embedding, Linear, ModuleT, VarBuilder};

/// Deep Averaging Network encoder over padded peak indices.
///
/// The embedding table carries one extra row for the padding index 0; the
/// padding row is masked out of the pooled average (and receives no
/// gradient), so its contents never reach the posterior.
pub struct DanEncoder {
    n_peaks: usize,
    n_topics: usize,
    word_dropout_rate: f32,
    calc_read_depth: bool,
    embedding: Embedding,
    fc: StackLayers<Linear>,
}

pub struct DanEncoderArgs<'a> {
    pub n_peaks: usize,
    pub n_topics: usize,
    pub embedding_dim: usize,
    /// hidden widths of the feed-forward stack
    pub layers: &'a [usize],
    pub dropout: f32,
    /// input-level denoising rate on the index tensor
    pub word_dropout: f32,
    pub n_covariates: usize,
    pub n_extra_features: usize,
}

impl DanEncoder {
    /// Will create a new DAN encoder with these variables:
    ///
    /// * `nn.enc.embedding` (n_peaks + 1, embedding_dim)
    /// * `nn.enc.fc.{}.weight` where {} is the layer index
    pub fn new(args: DanEncoderArgs, vs: VarBuilder) -> Result<Self> {
        debug_assert!(!args.layers.is_empty());

        let embedding = candle_nn::embedding(
            args.n_peaks + 1,
            args.embedding_dim,
            vs.pp("nn.enc.embedding"),
        )?;

        let in_dim = args.embedding_dim + 1 + args.n_covariates + args.n_extra_features;
        let fc = stack_ffn(
            in_dim,
            args.layers,
            2 * args.n_topics,
            args.dropout,
            vs.pp("nn.enc"),
        )?;

        Ok(Self {
            n_peaks: args.n_peaks,
            n_topics: args.n_topics,
            word_dropout_rate: args.word_dropout,
            calc_read_depth: true,
            embedding,
            fc,
        })
    }

    pub fn n_peaks(&self) -> usize {
        self.n_peaks
    }

    /// Older fitted models stored read depth as a separate feature; turning
    /// this off makes the forward pass trust the supplied depth instead of
    /// recounting after corruption.
    pub fn set_calc_read_depth(&mut self, calc: bool) {
        self.calc_read_depth = calc;
    }

    /// Elementwise Bernoulli corruption: dropped entries become padding.
    fn corrupt_idx(&self, idx_nw: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.word_dropout_rate <= 0.0 {
            return Ok(idx_nw.clone());
        }
        let keep_nw = Tensor::rand(0_f32, 1_f32, idx_nw.dims(), idx_nw.device())?
            .ge(self.word_dropout_rate)?
            .to_dtype(idx_nw.dtype())?;
        idx_nw.mul(&keep_nw)
    }

    /// Average the token embeddings by read depth, not by padded width, so
    /// the pooled vector is invariant to library size.
    fn pooled_embedding(
        &self,
        idx_nw: &Tensor,
        read_depth_n1: &Tensor,
    ) -> Result<Tensor> {
        let emb_nwd = self.embedding.forward_t(idx_nw, false)?;
        let real_nw1 = idx_nw
            .to_dtype(DType::F32)?
            .gt(0.0)?
            .to_dtype(DType::F32)?
            .unsqueeze(2)?;
        let sum_nd = emb_nwd.broadcast_mul(&real_nw1)?.sum(1)?;
        sum_nd.broadcast_div(read_depth_n1)
    }
}

impl PaddedEncoderModuleT for DanEncoder {
    fn forward_t(
        &self,
        idx_nw: &Tensor,
        side: EncoderSideData,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let corrupted_nw = self.corrupt_idx(idx_nw, train)?;

        let read_depth_n1 = if self.calc_read_depth {
            corrupted_nw
                .to_dtype(DType::F32)?
                .gt(0.0)?
                .to_dtype(DType::F32)?
                .sum_keepdim(1)?
                .clamp(1.0, f64::INFINITY)?
        } else {
            side.read_depth_n1.clone()
        };

        let ave_nd = self.pooled_embedding(&corrupted_nw, &read_depth_n1)?;

        let mut blocks = vec![ave_nd, read_depth_n1.log()?];
        if let Some(covar_nc) = side.covariates_nc {
            blocks.push(covar_nc.clone());
        }
        if let Some(extra_ne) = side.extra_ne {
            blocks.push(extra_ne.clone());
        }
        let x_nf = Tensor::cat(&blocks, 1)?;

        let out_n2k = self.fc.forward_t(&x_nf, train)?;

        let theta_loc_nk = out_n2k.narrow(1, 0, self.n_topics)?;
        let theta_scale_nk = softplus(&out_n2k.narrow(1, self.n_topics, self.n_topics)?)?;

        Ok((theta_loc_nk, theta_scale_nk))
    }

    fn dim_latent(&self) -> usize {
        self.n_topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn toy_encoder(dev: &Device) -> Result<(candle_nn::VarMap, DanEncoder)> {
        let varmap = candle_nn::VarMap::new();
        let vs = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, dev);
        let enc = DanEncoder::new(
            DanEncoderArgs {
                n_peaks: 6,
                n_topics: 3,
                embedding_dim: 4,
                layers: &[8],
                dropout: 0.0,
                word_dropout: 0.0,
                n_covariates: 0,
                n_extra_features: 0,
            },
            vs,
        )?;
        Ok((varmap, enc))
    }

    #[test]
    fn forward_shapes_and_positive_scale() -> Result<()> {
        let dev = Device::Cpu;
        let (_vm, enc) = toy_encoder(&dev)?;

        let idx = Tensor::from_vec(vec![1_u32, 3, 0, 2, 0, 0], (2, 3), &dev)?;
        let rd = Tensor::from_vec(vec![2.0_f32, 1.0], (2, 1), &dev)?;

        let (loc, scale) = enc.forward_t(
            &idx,
            EncoderSideData {
                read_depth_n1: &rd,
                covariates_nc: None,
                extra_ne: None,
            },
            false,
        )?;

        assert_eq!(loc.dims(), &[2, 3]);
        assert_eq!(scale.dims(), &[2, 3]);
        assert!(scale.to_vec2::<f32>()?.iter().flatten().all(|&v| v > 0.0));
        Ok(())
    }

    #[test]
    fn pooling_ignores_padding_slots() -> Result<()> {
        let dev = Device::Cpu;
        let (_vm, enc) = toy_encoder(&dev)?;

        // the same two hits, with and without extra padding columns
        let narrow = Tensor::from_vec(vec![2_u32, 5], (1, 2), &dev)?;
        let wide = Tensor::from_vec(vec![2_u32, 5, 0, 0], (1, 4), &dev)?;
        let rd = Tensor::from_vec(vec![2.0_f32], (1, 1), &dev)?;

        let a = enc.pooled_embedding(&narrow, &rd)?.to_vec2::<f32>()?;
        let b = enc.pooled_embedding(&wide, &rd)?.to_vec2::<f32>()?;
        for (x, y) in a[0].iter().zip(b[0].iter()) {
            assert!((x - y).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn topic_comps_lie_on_simplex() -> Result<()> {
        let dev = Device::Cpu;
        let (_vm, enc) = toy_encoder(&dev)?;

        let idx = Tensor::from_vec(vec![1_u32, 3, 4, 2, 6, 0], (2, 3), &dev)?;
        let rd = Tensor::from_vec(vec![3.0_f32, 2.0], (2, 1), &dev)?;

        let theta = enc.topic_comps(
            &idx,
            EncoderSideData {
                read_depth_n1: &rd,
                covariates_nc: None,
                extra_ne: None,
            },
        )?;

        for row in theta.to_vec2::<f32>()? {
            let s: f32 = row.iter().sum();
            assert!((s - 1.0).abs() < 1e-4);
        }
        Ok(())
    }
}
