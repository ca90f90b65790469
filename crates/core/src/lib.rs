pub mod client;
pub mod config;
pub mod error;
pub mod gpu;
pub mod model;

pub use client::ControllerClient;
pub use error::Error;
pub use gpu::{GpuSet, SelectedGpuSet};
pub use model::*;
