pub mod config;
pub mod data;
pub mod error;
pub mod evaluate;
pub mod inference;
pub mod loss;
pub mod lr_schedule;
pub mod model_artifacts;
pub mod models;
pub mod normalizer;
pub mod train;
pub mod windows;
