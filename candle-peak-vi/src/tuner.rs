#![allow(dead_code)]

use rand::Rng;

/// Search-space controls for hyperparameter tuning. Higher `rigor`
/// widens the search from topic count alone to the full optimizer
/// surface.
pub struct TunerSettings {
    pub min_topics: usize,
    pub max_topics: usize,
    pub rigor: usize,
}

impl Default for TunerSettings {
    fn default() -> Self {
        Self {
            min_topics: 5,
            max_topics: 55,
            rigor: 1,
        }
    }
}

/// One proposed trial. Fields beyond the active rigor level stay `None`
/// so the caller keeps its configured defaults.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct SuggestedParameters {
    pub num_topics: usize,
    pub decoder_dropout: Option<f64>,
    pub encoder_dropout: Option<f64>,
    pub num_layers: Option<usize>,
    pub max_momentum: Option<f64>,
    pub min_momentum: Option<f64>,
    pub weight_decay: Option<f64>,
}

/// Source of trial values, typically backed by an external optimizer or
/// a random search.
pub trait ParameterSampler {
    fn suggest_int(&mut self, name: &str, low: usize, high: usize, log: bool) -> usize;
    fn suggest_float(&mut self, name: &str, low: f64, high: f64, log: bool) -> f64;
    fn suggest_categorical(&mut self, name: &str, choices: &[usize]) -> usize;
}

/// Propose one trial given the tuner settings.
///
/// * rigor 0 searches the topic count only
/// * rigor 1 adds the decoder dropout
/// * rigor 2 searches everything (kitchen sink)
pub fn suggest_parameters(
    settings: &TunerSettings,
    sampler: &mut dyn ParameterSampler,
) -> SuggestedParameters {
    let mut params = SuggestedParameters {
        num_topics: sampler.suggest_int(
            "num_topics",
            settings.min_topics,
            settings.max_topics,
            true,
        ),
        ..Default::default()
    };

    if settings.rigor >= 1 {
        params.decoder_dropout = Some(sampler.suggest_float("decoder_dropout", 0.05, 0.2, true));
    }

    if settings.rigor >= 2 {
        params.encoder_dropout =
            Some(sampler.suggest_float("encoder_dropout", 0.0001, 0.1, true));
        params.num_layers = Some(sampler.suggest_categorical("num_layers", &[2, 3]));
        params.max_momentum = Some(sampler.suggest_float("max_momentum", 0.90, 0.98, true));
        params.min_momentum = Some(sampler.suggest_float("min_momentum", 0.8, 0.89, true));
        params.weight_decay = Some(sampler.suggest_float("weight_decay", 0.00001, 0.1, true));
    }

    params
}

/// Log-uniform random search over the same space.
pub struct RandomSampler<R: Rng> {
    rng: R,
}

impl<R: Rng> RandomSampler<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }
}

impl<R: Rng> ParameterSampler for RandomSampler<R> {
    fn suggest_int(&mut self, name: &str, low: usize, high: usize, log: bool) -> usize {
        (self.suggest_float(name, low as f64, high as f64, log).round() as usize)
            .clamp(low, high)
    }

    fn suggest_float(&mut self, _name: &str, low: f64, high: f64, log: bool) -> f64 {
        let u: f64 = self.rng.random();
        if log {
            (low.ln() + u * (high.ln() - low.ln())).exp()
        } else {
            low + u * (high - low)
        }
    }

    fn suggest_categorical(&mut self, _name: &str, choices: &[usize]) -> usize {
        choices[self.rng.random_range(0..choices.len())]
    }
}
