// src/lib.rs
// Fine-tuned recipe model: settings, artifact checks, LoRA-merged Llama
// inference on the CPU and the model check built on top of them.

pub mod artifacts;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod environment;
pub mod error;
pub mod generation;
pub mod hub;
pub mod llama;
pub mod logging;
pub mod lora;
pub mod sampling;
pub mod system_resources;
pub mod tokenizer;
pub mod weights;

pub use config::Settings;
pub use error::{Error, Result};
