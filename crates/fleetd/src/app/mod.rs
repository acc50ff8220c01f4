//! Application module
//!
//! This module contains the main application structure and lifecycle
//! management: building the component graph from CLI arguments, spawning
//! background tasks and coordinating graceful shutdown.

pub mod builder;
pub mod core;
pub mod tasks;

// Re-export main types
pub use builder::ApplicationBuilder;
pub use core::Application;
