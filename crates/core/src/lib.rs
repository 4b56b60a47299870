//! Core crate for the celshift video stylization pipeline.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod server;
pub mod session;
pub mod stages;
pub mod workspace;
