pub mod candle_aux_layers;
pub mod candle_aux_linear;
pub mod candle_dan_encoder;
pub mod candle_dp_topics;
pub mod candle_expression_encoder;
pub mod candle_model_traits;
pub mod candle_padded_data_loader;
pub mod candle_padded_multinomial;
pub mod candle_stick_breaking;
pub mod candle_svi_inference;
pub mod candle_topic_decoder;
pub mod candle_topic_model;
pub mod enrichment;
pub mod tuner;

pub use candle_core;
pub use candle_nn;
