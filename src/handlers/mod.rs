//! HTTP surface

pub mod relay;
pub mod stats;
pub mod stream;
