//! # Models
//!
//! The interface between the sampling loop and the denoising network.

pub mod context;
pub mod denoiser;

pub use context::{Context, ContextValue};
pub use denoiser::Denoiser;
