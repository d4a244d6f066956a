// Configuration for Exliar GPU
//
// A JSON file supplies defaults for every run; command line flags override
// the file. A missing file means defaults.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::gpu::GpuVendor;
use crate::passthrough::{MountSource, OverridePolicy};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/exliar-gpu/config.json";

/// Command-line arguments
#[derive(Parser, Debug, Clone)]
#[command(name = "exliar-gpu", version, about = "GPU passthrough configuration and verification for LXC hosts")]
pub struct Cli {
    /// Path to configuration file (JSON)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Filesystem root to inspect instead of the config value
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Probe timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Show what would change without writing any file
    #[arg(long)]
    pub dry_run: bool,

    /// Print machine-readable JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List display-class PCI devices
    Scan {
        /// Include GPUs of unsupported vendors
        #[arg(long)]
        all: bool,
    },
    /// Print the LXC directives for a GPU
    Synthesize {
        /// GPU vendor (amd or nvidia); inferred when only one vendor is present
        #[arg(long)]
        vendor: Option<GpuVendor>,
        /// PCI address of the GPU
        #[arg(long)]
        gpu: Option<String>,
    },
    /// Write the passthrough block into a container config
    Apply {
        /// Container id
        #[arg(long)]
        ctid: u32,
        #[arg(long)]
        vendor: Option<GpuVendor>,
        #[arg(long)]
        gpu: Option<String>,
    },
    /// Remove the passthrough block from a container config
    Unapply {
        #[arg(long)]
        ctid: u32,
    },
    /// Manage kernel boot parameters
    Boot {
        #[command(subcommand)]
        action: BootAction,
    },
    /// Run the verification pipeline
    Verify {
        #[arg(long)]
        vendor: Option<GpuVendor>,
        #[arg(long)]
        gpu: Option<String>,
        /// Also verify from inside this running container
        #[arg(long)]
        ctid: Option<u32>,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootAction {
    /// Persist the configured boot parameters
    Apply,
    /// Remove the configured boot parameter keys
    Remove,
    /// Report whether the parameters are persisted and active
    Status,
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Filesystem root; "/" except in tests and offline inspection
    pub root: PathBuf,

    /// Upper bound for each external probe
    pub probe_timeout_secs: u64,

    /// Upper bound for update-grub or proxmox-boot-tool refresh
    pub boot_refresh_timeout_secs: u64,

    /// Kernel parameters to manage (key to value, empty value for a bare flag)
    pub boot_params: BTreeMap<String, String>,

    /// Container sandbox overrides
    pub overrides: OverridePolicy,

    /// Character device majors by /proc/devices name (kfd, nvidia-uvm, nvidia-caps)
    pub majors: BTreeMap<String, u32>,

    /// Source path used for DRM bind mounts
    pub mount_source: MountSource,

    pub dry_run: bool,

    /// Proxmox VE version to assume instead of asking pveversion
    pub pve_version: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            probe_timeout_secs: 15,
            boot_refresh_timeout_secs: 600,
            boot_params: BTreeMap::new(),
            overrides: OverridePolicy::default(),
            majors: BTreeMap::new(),
            mount_source: MountSource::default(),
            dry_run: false,
            pve_version: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }
        let data = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.probe_timeout_secs == 0 {
            return Err(Error::Config("probe_timeout_secs must be at least 1".to_string()));
        }
        if self.boot_refresh_timeout_secs == 0 {
            return Err(Error::Config("boot_refresh_timeout_secs must be at least 1".to_string()));
        }
        if let Some(key) = self.boot_params.keys().find(|k| k.is_empty() || k.contains(char::is_whitespace) || k.contains('=')) {
            return Err(Error::Config(format!("invalid boot parameter key {:?}", key)));
        }
        if let Some((key, _)) = self.boot_params.iter().find(|(_, v)| v.contains(char::is_whitespace)) {
            return Err(Error::Config(format!("boot parameter {} has whitespace in its value", key)));
        }
        Ok(())
    }

    /// Applies command-line overrides
    pub fn merge_cli(mut self, cli: &Cli) -> Self {
        if let Some(root) = &cli.root {
            self.root = root.clone();
        }
        if let Some(timeout) = cli.timeout {
            self.probe_timeout_secs = timeout.max(1);
        }
        self.dry_run |= cli.dry_run;
        self
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn boot_refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_refresh_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passthrough::Toggle;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.probe_timeout(), Duration::from_secs(15));
        assert_eq!(config.boot_refresh_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "boot_params": {"amdgpu.gttsize": "126976", "ttm.pages_limit": "32505856"},
                "overrides": {"apparmor_param_mask": "off"},
                "majors": {"kfd": 238},
                "mount_source": "by_path"
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.boot_params.len(), 2);
        assert_eq!(config.overrides.apparmor_param_mask, Toggle::Off);
        assert!(config.overrides.mac_unconfined);
        assert_eq!(config.majors.get("kfd"), Some(&238));
        assert_eq!(config.mount_source, MountSource::ByPath);
        assert_eq!(config.root, PathBuf::from("/"));
    }

    #[test]
    fn rejects_bad_boot_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"boot_params": {"amdgpu gttsize": "1"}}"#).unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn refresh_timeout_is_separate_from_probe_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"probe_timeout_secs": 5, "boot_refresh_timeout_secs": 1800}"#).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.boot_refresh_timeout(), Duration::from_secs(1800));

        fs::write(&path, r#"{"boot_refresh_timeout_secs": 0}"#).unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn cli_overrides_config() {
        let cli = Cli::parse_from(["exliar-gpu", "--root", "/mnt/host", "--dry-run", "--timeout", "3", "scan"]);
        let config = Config::default().merge_cli(&cli);
        assert_eq!(config.root, PathBuf::from("/mnt/host"));
        assert!(config.dry_run);
        assert_eq!(config.probe_timeout_secs, 3);
    }

    #[test]
    fn parses_vendor_and_boot_subcommands() {
        let cli = Cli::parse_from(["exliar-gpu", "verify", "--vendor", "AMD", "--ctid", "101"]);
        match cli.command {
            Command::Verify { vendor, ctid, gpu } => {
                assert_eq!(vendor, Some(GpuVendor::AMD));
                assert_eq!(ctid, Some(101));
                assert_eq!(gpu, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
        let cli = Cli::parse_from(["exliar-gpu", "boot", "status"]);
        assert!(matches!(cli.command, Command::Boot { action: BootAction::Status }));
    }
}
