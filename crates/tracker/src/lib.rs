//! Spatio-temporal tracker pipeline around the encoder-decoder transformer.
//!
//! The tracker is composed from three collaborators: a [`Backbone`] that
//! turns a padded image into a flattened feature sequence, the
//! [`model::Transformer`], and the prediction heads. Classification is an
//! optional capability; box regression consumes the decoder output together
//! with two tapped encoder memory layers. The box head family is chosen by
//! `model.head_type`.

pub mod backbone;
pub mod config;
pub mod errors;
pub mod heads;
pub mod preprocess;
pub mod tracker;

use candle_core::Device;
use model::Transformer;

pub use backbone::{Backbone, NestedTensor, SeqDict};
pub use config::{HeadType, Precision, TrackerConfig};
pub use errors::{ConfigError, TrackerError};
pub use heads::{BoxHead, ClassificationHead, HeadOutputs, SimilarityBoxHead};
pub use preprocess::Preprocessor;
pub use tracker::{HeadOptions, SpatioTemporalTracker, TrackerMode, TrackerOutput, TransformerPass};

/// Builds the transformer described by `config` on `device`.
pub fn build_transformer(config: &TrackerConfig, device: &Device) -> Result<Transformer, TrackerError> {
    Ok(Transformer::new(config.transformer_config(device)?)?)
}

/// Builds the box head selected by `model.head_type`, an MLP of
/// `model.nlayer_head` layers over `model.hidden_dim` features.
pub fn build_box_head(
    config: &TrackerConfig,
    device: &Device,
) -> Result<Box<dyn BoxHead>, TrackerError> {
    let model = &config.model;
    let dtype = model.precision.dtype();
    match model.head_type {
        HeadType::Similarity => Ok(Box::new(SimilarityBoxHead::new(
            model.hidden_dim,
            model.nlayer_head,
            device,
            dtype,
        )?)),
    }
}

/// Assembles the full tracker from `config`; only the backbone is supplied
/// by the caller.
pub fn build_tracker(
    config: &TrackerConfig,
    backbone: Box<dyn Backbone>,
    device: &Device,
) -> Result<SpatioTemporalTracker, TrackerError> {
    let transformer = build_transformer(config, device)?;
    let box_head = build_box_head(config, device)?;
    let dtype = config.model.precision.dtype();
    let cls_head = ClassificationHead::new(
        config.model.hidden_dim,
        config.model.nlayer_head,
        device,
        dtype,
    )?;
    SpatioTemporalTracker::new(
        backbone,
        transformer,
        box_head,
        config.model.num_object_queries,
        config.train.deep_supervision,
        Some(cls_head),
    )
}
