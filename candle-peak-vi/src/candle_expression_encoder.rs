use crate::candle_aux_layers::*;
use candle_core::{Result, Tensor};
use candle_nn::{Linear, ModuleT, VarBuilder};

/// Variational posterior parameters produced by the expression encoder.
pub struct ExpressionPosterior {
    pub theta_loc_nk: Tensor,
    pub theta_scale_nk: Tensor,
    /// LogNormal location of the read-depth scale (n x 1)
    pub rd_loc_n1: Tensor,
    /// LogNormal scale of the read-depth scale, strictly positive (n x 1)
    pub rd_scale_n1: Tensor,
}

/// Dense encoder for the expression modality: log1p counts plus side
/// features feed a feed-forward stack with separate heads for the topic
/// posterior and the read-depth scale posterior.
pub struct ExpressionEncoder {
    n_genes: usize,
    n_topics: usize,
    fc: StackLayers<Linear>,
}

pub struct ExpressionEncoderArgs<'a> {
    pub n_genes: usize,
    pub n_topics: usize,
    pub layers: &'a [usize],
    pub dropout: f32,
    pub n_covariates: usize,
    pub n_extra_features: usize,
}

impl ExpressionEncoder {
    pub fn new(args: ExpressionEncoderArgs, vs: VarBuilder) -> Result<Self> {
        debug_assert!(!args.layers.is_empty());

        let in_dim = args.n_genes + 1 + args.n_covariates + args.n_extra_features;
        let fc = stack_ffn(
            in_dim,
            args.layers,
            2 * args.n_topics + 2,
            args.dropout,
            vs.pp("nn.enc"),
        )?;

        Ok(Self {
            n_genes: args.n_genes,
            n_topics: args.n_topics,
            fc,
        })
    }

    pub fn dim_obs(&self) -> usize {
        self.n_genes
    }

    pub fn dim_latent(&self) -> usize {
        self.n_topics
    }

    pub fn forward_t(
        &self,
        x_nd: &Tensor,
        read_depth_n1: &Tensor,
        covariates_nc: Option<&Tensor>,
        extra_ne: Option<&Tensor>,
        train: bool,
    ) -> Result<ExpressionPosterior> {
        let k = self.n_topics;

        let mut blocks = vec![(x_nd + 1.0)?.log()?, read_depth_n1.log()?];
        if let Some(covar_nc) = covariates_nc {
            blocks.push(covar_nc.clone());
        }
        if let Some(extra_ne) = extra_ne {
            blocks.push(extra_ne.clone());
        }
        let h_nf = Tensor::cat(&blocks, 1)?;

        let out = self.fc.forward_t(&h_nf, train)?;

        Ok(ExpressionPosterior {
            theta_loc_nk: out.narrow(1, 0, k)?,
            theta_scale_nk: softplus(&out.narrow(1, k, k)?)?,
            rd_loc_n1: out.narrow(1, 2 * k, 1)?,
            rd_scale_n1: softplus(&out.narrow(1, 2 * k + 1, 1)?)?,
        })
    }
}
