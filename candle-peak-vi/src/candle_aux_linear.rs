#![allow(dead_code)]

use candle_core::{Result, Tensor};
use candle_nn::{ops, Module};

////////////////////////////////
// Linear module with Softmax //
////////////////////////////////

/// Dictionary layer whose weight columns live on the probability simplex:
/// each topic's peak distribution is `softmax` over the feature axis.
#[derive(Clone, Debug)]
pub struct SoftmaxLinear {
    weight_dk: Tensor,
    bias_d: Option<Tensor>,
}

impl SoftmaxLinear {
    pub fn new(weight_dk: Tensor, bias_d: Option<Tensor>) -> Self {
        Self { weight_dk, bias_d }
    }

    /// log-normalized dictionary (d x k): log softmax over features
    pub fn weight_dk(&self) -> Result<Tensor> {
        let logits = match &self.bias_d {
            Some(bias) => self.weight_dk.broadcast_add(bias)?,
            None => self.weight_dk.clone(),
        };
        ops::log_softmax(&logits, 0)
    }

    /// log p(feature | mixture) for mixtures `theta_nk` on the simplex
    pub fn forward_log(&self, theta_nk: &Tensor) -> Result<Tensor> {
        let eps = 1e-10;
        let w_kd = self.weight_dk()?.exp()?.t()?;
        (theta_nk.matmul(&w_kd)? + eps)?.log()
    }
}

impl Module for SoftmaxLinear {
    fn forward(&self, theta_nk: &Tensor) -> Result<Tensor> {
        let w_kd = self.weight_dk()?.exp()?.t()?;
        theta_nk.matmul(&w_kd)
    }
}

pub fn softmax_linear(
    in_dim: usize,
    out_dim: usize,
    vb: candle_nn::VarBuilder,
) -> Result<SoftmaxLinear> {
    let init_ws = candle_nn::init::DEFAULT_KAIMING_NORMAL;
    let ws = vb.get_with_hints((out_dim, in_dim), "weight", init_ws)?;
    let bs = vb.get_with_hints((out_dim, 1), "bias", candle_nn::init::ZERO)?;

    Ok(SoftmaxLinear::new(ws, Some(bs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn dictionary_columns_normalize() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vs = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let layer = softmax_linear(3, 7, vs)?;

        let col_sums = layer.weight_dk()?.exp()?.sum(0)?.to_vec1::<f32>()?;
        for s in col_sums {
            assert!((s - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn forward_rows_stay_on_simplex() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vs = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let layer = softmax_linear(2, 5, vs)?;

        let theta = Tensor::from_vec(vec![0.3_f32, 0.7, 0.5, 0.5], (2, 2), &dev)?;
        let row_sums = layer.forward(&theta)?.sum(1)?.to_vec1::<f32>()?;
        for s in row_sums {
            assert!((s - 1.0).abs() < 1e-4);
        }
        Ok(())
    }
}
