//! # Pipelines
//!
//! Full sampling trajectories of a single model, and cascades of models.

pub mod cascade;
pub mod diffusion;

pub use cascade::{Cascade, CascadeOutput, CascadeStage};
pub use diffusion::{DiffusionModel, SampleOptions, SampleOutput};
