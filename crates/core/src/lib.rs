//! Core crate for vidfill: windowed video inpainting on top of an opaque ONNX model.

pub mod backend;
pub mod compositor;
pub mod config;
pub mod error;
pub mod logging;
pub mod media;
pub mod model;
pub mod padding;
pub mod pipeline;
pub mod runtime;
pub mod sampler;
pub mod schedule;
pub mod types;
