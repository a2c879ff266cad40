//! Shared domain model, configuration and error types for the touch
//! sequencing engine.

pub mod config;
pub mod error;
pub mod types;

pub use config::AppConfig;
pub use error::{CampaignError, CampaignResult};
