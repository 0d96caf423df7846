//! Synod server library
//!
//! The binary is a thin shell around `synod-core`: it loads configuration,
//! sets up logging and metrics, and feeds JSON-line commands from stdin to
//! the cluster while streaming responses and notifications to stdout.

pub mod metrics;
pub mod model;
pub mod shell;
pub mod startup;
