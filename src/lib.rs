// Exliar GPU
//
// GPU inventory, container passthrough configuration, boot parameter
// management and verification for LXC hypervisor hosts

// Configuration file and command line
pub mod config;

// Host facts, process execution and bootloader backends
pub mod core;

pub mod error;

// GPU inventory, path resolution and vendor tables
pub mod gpu;

// Container passthrough rules and LXC config integration
pub mod passthrough;

// Report rendering
pub mod ui;

// Utility functions
pub mod utils;

// Verification pipeline
pub mod verify;

pub use error::{Error, Result};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
