//! Colloquy Common - Shared configuration, errors and logging for the colloquy service.
//!
//! This crate provides:
//! - Configuration types and loading (file + environment overrides)
//! - Configuration validation
//! - The shared error type
//! - Logging setup and request span helpers

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    ChatConfig, Config, ModelConfig, ObservabilityConfig, ProviderKind, ServerConfig,
    StorageConfig, SystemPromptPolicy,
};
pub use error::{Error, Result};
