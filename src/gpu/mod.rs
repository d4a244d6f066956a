// GPU management module for Exliar GPU
//
// This module handles GPU device detection, classification, stable device
// path resolution and the per-vendor passthrough tables

pub mod detection;
pub mod paths;
pub mod vendor;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::gpu::paths::ResolvedPaths;

/// GPU vendors the engine knows about
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GpuVendor {
    AMD,
    NVIDIA,
    Other(String),
}

impl GpuVendor {
    /// Classifies a PCI vendor descriptor by case-insensitive substring match.
    /// AMD markers are checked first so the result never depends on anything
    /// but the descriptor itself.
    pub fn classify(descriptor: &str) -> Self {
        let lower = descriptor.to_lowercase();
        if lower.contains("amd") || lower.contains("advanced micro devices") || lower.contains("ati technologies") {
            GpuVendor::AMD
        } else if lower.contains("nvidia") {
            GpuVendor::NVIDIA
        } else {
            GpuVendor::Other(descriptor.trim().to_string())
        }
    }

    /// Whether the vendor has a passthrough profile
    pub fn is_supported(&self) -> bool {
        !matches!(self, GpuVendor::Other(_))
    }
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GpuVendor::AMD => write!(f, "AMD"),
            GpuVendor::NVIDIA => write!(f, "NVIDIA"),
            GpuVendor::Other(name) => write!(f, "{}", name),
        }
    }
}

impl FromStr for GpuVendor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "amd" => Ok(GpuVendor::AMD),
            "nvidia" => Ok(GpuVendor::NVIDIA),
            other => Err(format!("unsupported vendor '{}' (expected amd or nvidia)", other)),
        }
    }
}

/// One physical GPU, re-derived on every invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuDevice {
    pub vendor: GpuVendor,
    pub pci_address: String,       // Canonical domain:bus:device.function
    pub display_name: String,      // Model string from lspci
    pub vendor_name: String,       // Vendor descriptor from lspci
    pub driver: Option<String>,    // Kernel driver currently bound
    pub paths: Option<ResolvedPaths>,
    pub compute_interface_present: bool,
}

impl GpuDevice {
    pub fn card_path(&self) -> Option<&Path> {
        self.paths.as_ref().map(|p| p.card_node.as_path())
    }

    pub fn render_path(&self) -> Option<&Path> {
        self.paths.as_ref().and_then(|p| p.render_node.as_deref())
    }
}

/// Canonicalises a PCI address to lower-case `dddd:bb:dd.f`.
/// A bare `bb:dd.f` slot gets the default `0000` domain.
pub fn canonical_pci_address(address: &str) -> Option<String> {
    let re = Regex::new(r"^(?:([0-9a-fA-F]{4}):)?([0-9a-fA-F]{2}):([0-9a-fA-F]{2})\.([0-7])$").ok()?;
    let caps = re.captures(address.trim())?;
    let domain = caps.get(1).map_or("0000", |m| m.as_str());
    Some(format!("{}:{}:{}.{}", domain, &caps[2], &caps[3], &caps[4]).to_lowercase())
}
