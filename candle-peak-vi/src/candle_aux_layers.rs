#![allow(dead_code)]

use candle_core::{Result, Tensor};
use candle_nn::{Activation, Dropout, Linear, Module, ModuleT, VarBuilder};

/// build a stack of alternating `M` and `A` layers with optional dropout
/// after each activation
pub struct StackLayers<M>
where
    M: ModuleT,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<Activation>>,
    dropout: Option<Dropout>,
}

impl<M> ModuleT for StackLayers<M>
where
    M: ModuleT,
{
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward_t(&x, train)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
                if let Some(dropout) = &self.dropout {
                    x = dropout.forward_t(&x, train)?;
                }
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: ModuleT,
{
    pub fn new(dropout_rate: f32) -> Self {
        let dropout = if dropout_rate > 0.0 {
            Some(Dropout::new(dropout_rate))
        } else {
            None
        };
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
            dropout,
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }
}

/// Feed-forward stack `in_dim -> hidden.. -> out_dim`, ReLU and dropout on
/// every hidden layer, linear output head.
pub fn stack_ffn(
    in_dim: usize,
    hidden_dims: &[usize],
    out_dim: usize,
    dropout_rate: f32,
    vs: VarBuilder,
) -> Result<StackLayers<Linear>> {
    let mut fc = StackLayers::<Linear>::new(dropout_rate);
    let mut prev_dim = in_dim;
    for (j, &next_dim) in hidden_dims.iter().enumerate() {
        let name = format!("fc.{}", j);
        fc.push_with_act(
            candle_nn::linear(prev_dim, next_dim, vs.pp(name))?,
            candle_nn::Activation::Relu,
        );
        prev_dim = next_dim;
    }
    fc.push(candle_nn::linear(
        prev_dim,
        out_dim,
        vs.pp(format!("fc.{}", hidden_dims.len())),
    )?);
    Ok(fc)
}

/// Numerically stable softplus: `max(x, 0) + ln(1 + exp(-|x|))`
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    x.relu()? + (x.abs()?.neg()?.exp()? + 1.0)?.log()?
}

const HALF_LN_2PI: f64 = 0.9189385332046727;

/// lgamma(x) = lgamma(x + 2) - log(x) - log(x + 1), with the Stirling
/// series (y - 0.5) log(y) - y + 0.5 log(2 pi) + 1/(12 y) at y = x + 2
pub fn approx_lgamma(x: &Tensor) -> Result<Tensor> {
    let y = (x + 2.0)?;
    let stirling = ((y.clone() - 0.5)?.mul(&y.log()?)? - &y)?
        .add(&y.recip()?.affine(1.0 / 12.0, HALF_LN_2PI)?)?;
    stirling.sub(&x.log()?)?.sub(&(x + 1.0)?.log()?)
}

/// psi(x) = psi(x + 2) - 1/x - 1/(x + 1), with the asymptotic expansion
/// psi(y) ~ ln(y) - 1/(2y) - 1/(12 y^2) applied at y = x + 2
pub fn approx_digamma(x: &Tensor) -> Result<Tensor> {
    let y = (x + 2.0)?;
    let asymptotic = (y.log()? - y.recip()?.affine(0.5, 0.0)?)?
        .sub(&y.powf(2.0)?.recip()?.affine(1.0 / 12.0, 0.0)?)?;
    asymptotic.sub(&x.recip()?)?.sub(&(x + 1.0)?.recip()?)
}
