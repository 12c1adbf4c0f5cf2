//! # Cascaded diffusion sampling
//!
//! Noise schedules, reverse process samplers and sampling pipelines for
//! diffusion models, written with [Burn](https://github.com/burn-rs/burn).
//!
//! The denoising network is supplied by the caller through the
//! [`Denoiser`](models::Denoiser) trait.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod models;
pub mod pipelines;
pub mod samplers;
pub mod schedulers;
pub mod utils;

pub use error::{DiffusionError, Result};

#[cfg(all(test, feature = "ndarray"))]
use burn::backend::ndarray;

#[cfg(all(test, not(feature = "ndarray"), feature = "torch"))]
use burn::backend::libtorch;

#[cfg(all(test, feature = "ndarray"))]
pub type TestBackend = ndarray::NdArray<f32>;

#[cfg(all(test, not(feature = "ndarray"), feature = "torch"))]
pub type TestBackend = libtorch::LibTorch<f32>;

#[cfg(all(test, not(feature = "ndarray"), not(feature = "torch"), feature = "wgpu"))]
pub type TestBackend = burn::backend::Wgpu;
