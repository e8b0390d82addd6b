//! Session engine, frame pipeline, model pool, and renderer for the
//! real-time semantic-segmentation gateway.
//!
//! This crate has no transport of its own — `seg-gateway` owns the
//! WebSocket framing and wires these pieces together per connection. Every
//! type here is either process-wide and internally synchronized
//! ([`model_pool::ModelPool`]) or owned exclusively by one session
//! ([`session::Session`], [`inference::InferenceEngine`]).

pub mod codec;
pub mod colormap;
pub mod config;
pub mod error;
pub mod inference;
pub mod model_pool;
pub mod onnx;
pub mod pipeline;
pub mod protocol;
pub mod renderer;
pub mod session;
pub mod stats;

pub use error::ErrorKind;
pub use inference::{InferenceEngine, ModelMode};
pub use model_pool::{LoadedModel, ModelPool, ModelPoolError};
pub use pipeline::{AdmitDecision, FramePipeline};
pub use session::{Session, SessionPhase};
