// Error types for Exliar GPU
//
// Inventory and path resolution report absence through Option/empty results;
// these errors are for the operations that must stop instead of guessing.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::gpu::GpuVendor;

/// Failure to run an external process
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("executable `{0}` not found")]
    NotFound(String),

    #[error("`{program}` did not finish within {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no {0} GPU detected")]
    HardwareNotFound(GpuVendor),

    #[error("kernel module `{0}` is not loaded")]
    DriverNotLoaded(String),

    #[error("device node {} is missing", .0.display())]
    DeviceNodeMissing(PathBuf),

    #[error("no /dev/dri/by-path entry for PCI device {0}")]
    DeviceNodeUnresolvable(String),

    #[error("device node {} exists but is not readable and writable", .0.display())]
    PermissionDenied(PathBuf),

    #[error("required tool `{0}` is not installed")]
    ToolMissing(String),

    #[error("`{tool}` ran but reported no usable device: {detail}")]
    ToolNonFunctional { tool: String, detail: String },

    #[error("failed to write container config {}: {reason}", .path.display())]
    SandboxConfigWriteFailed { path: PathBuf, reason: String },

    #[error("no supported bootloader backend found (looked for {0})")]
    BootBackendNotFound(String),

    #[error("bootloader refresh failed: {0}")]
    BootRefreshFailed(String),

    #[error("vendor {0} has no passthrough profile")]
    UnsupportedVendor(GpuVendor),

    #[error("multiple {vendor} GPUs found ({candidates}); choose one with --gpu")]
    AmbiguousSelection { vendor: GpuVendor, candidates: String },

    #[error("no supported GPU at PCI address {0}")]
    DeviceNotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("pattern error: {0}")]
    Regex(#[from] regex::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
