// Host facts for Exliar GPU
//
// Snapshot of the host state that probes depend on:
// - Filesystem root (so /dev, /sys, /proc and /etc can be redirected in tests)
// - Executable search path
// - Live kernel command line and loaded modules
// - Character device majors from /proc/devices
// - Kernel version, distribution and hypervisor platform

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::core::process::{CommandRunner, CommandSpec};

/// Holds information about the kernel version
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: Option<u32>,
    pub full_version: String,
}

/// Holds information about the Linux distribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Distribution {
    pub name: String,
    pub version: String,
    pub id: String,
}

/// Hypervisor platforms with known container passthrough quirks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlatformKind {
    ProxmoxVe,
}

/// The hypervisor platform the host runs, if recognised
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostPlatform {
    pub kind: PlatformKind,
    pub version: Option<String>,
    pub major: Option<u32>,
}

impl HostPlatform {
    /// Proxmox VE at the given manager version (e.g. "9.0.3")
    pub fn proxmox(version: Option<String>) -> Self {
        let major = version.as_deref().and_then(leading_number);
        HostPlatform { kind: PlatformKind::ProxmoxVe, version, major }
    }
}

/// Everything the engine reads about the host, captured once per invocation
#[derive(Debug, Clone, Serialize)]
pub struct HostFacts {
    pub root: PathBuf,
    pub path_dirs: Vec<PathBuf>,
    pub kernel_cmdline: String,
    pub loaded_modules: BTreeSet<String>,
    pub char_majors: BTreeMap<String, u32>,
    pub kernel_version: KernelVersion,
    pub distribution: Option<Distribution>,
    pub platform: Option<HostPlatform>,
}

impl HostFacts {
    /// Empty facts rooted at `root`; used as a starting point by tests
    pub fn empty(root: impl Into<PathBuf>) -> Self {
        HostFacts {
            root: root.into(),
            path_dirs: vec![PathBuf::from("/usr/sbin"), PathBuf::from("/usr/bin"), PathBuf::from("/sbin"), PathBuf::from("/bin")],
            kernel_cmdline: String::new(),
            loaded_modules: BTreeSet::new(),
            char_majors: BTreeMap::new(),
            kernel_version: KernelVersion::default(),
            distribution: None,
            platform: None,
        }
    }

    /// Reads the host state below `root`. Never fails; unreadable sources
    /// leave the corresponding field empty.
    pub fn detect(root: impl Into<PathBuf>, runner: &dyn CommandRunner) -> Self {
        let mut facts = HostFacts::empty(root);

        if let Some(path) = env::var_os("PATH") {
            let dirs: Vec<PathBuf> = env::split_paths(&path).collect();
            if !dirs.is_empty() {
                facts.path_dirs = dirs;
            }
        }

        facts.kernel_cmdline = facts.read("/proc/cmdline").trim().to_string();
        facts.loaded_modules = parse_proc_modules(&facts.read("/proc/modules"));
        facts.char_majors = parse_proc_devices(&facts.read("/proc/devices"));
        facts.kernel_version = facts.detect_kernel_version();
        facts.distribution = parse_os_release(&facts.read("/etc/os-release"));
        facts.platform = facts.detect_platform(runner);

        debug!(
            root = %facts.root.display(),
            kernel = %facts.kernel_version.full_version,
            modules = facts.loaded_modules.len(),
            platform = ?facts.platform,
            "Host facts collected"
        );
        facts
    }

    /// Maps an absolute host path onto the configured root
    pub fn path(&self, host_path: impl AsRef<Path>) -> PathBuf {
        let host_path = host_path.as_ref();
        let relative: PathBuf = host_path
            .components()
            .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
            .collect();
        self.root.join(relative)
    }

    pub fn exists(&self, host_path: impl AsRef<Path>) -> bool {
        self.path(host_path).exists()
    }

    /// Reads a host file, returning an empty string if it cannot be read
    pub fn read(&self, host_path: &str) -> String {
        fs::read_to_string(self.path(host_path)).unwrap_or_default()
    }

    /// Looks a tool up on the search path and returns its host path
    pub fn find_tool(&self, name: &str) -> Option<PathBuf> {
        self.path_dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| self.path(candidate).is_file())
    }

    pub fn module_loaded(&self, module: &str) -> bool {
        // /proc/modules always uses underscores
        self.loaded_modules.contains(&module.replace('-', "_"))
    }

    fn detect_kernel_version(&self) -> KernelVersion {
        let osrelease = self.read("/proc/sys/kernel/osrelease");
        if !osrelease.trim().is_empty() {
            return parse_kernel_version(osrelease.trim());
        }
        // Fallback to /proc/version
        let version = self.read("/proc/version");
        match version.split_whitespace().nth(2) {
            Some(ver_str) => parse_kernel_version(ver_str),
            None => KernelVersion { full_version: "unknown".to_string(), ..KernelVersion::default() },
        }
    }

    fn detect_platform(&self, runner: &dyn CommandRunner) -> Option<HostPlatform> {
        if !self.exists("/usr/share/pve-manager") && !self.exists("/etc/pve") {
            return None;
        }
        let version = runner
            .run(&CommandSpec::new("pveversion", &[]))
            .ok()
            .filter(|out| out.success())
            .and_then(|out| parse_pveversion(&out.stdout));
        Some(HostPlatform::proxmox(version))
    }
}

/// Parses kernel version string into components
pub fn parse_kernel_version(version_str: &str) -> KernelVersion {
    let parts: Vec<&str> = version_str.split('.').collect();

    let major = parts.first().and_then(|v| v.parse::<u32>().ok()).unwrap_or(0);
    let minor = parts.get(1).and_then(|v| leading_number(v)).unwrap_or(0);
    // Patch might include extra parts like "-generic" or "-4-pve"
    let patch = parts.get(2).and_then(|v| leading_number(v));

    KernelVersion { major, minor, patch, full_version: version_str.to_string() }
}

fn leading_number(s: &str) -> Option<u32> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Module names from /proc/modules
pub fn parse_proc_modules(content: &str) -> BTreeSet<String> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(String::from)
        .collect()
}

/// Character device majors from the `Character devices:` section of /proc/devices
pub fn parse_proc_devices(content: &str) -> BTreeMap<String, u32> {
    let mut majors = BTreeMap::new();
    let mut in_char_section = false;
    for line in content.lines() {
        let line = line.trim();
        if line.ends_with(':') {
            in_char_section = line == "Character devices:";
            continue;
        }
        if !in_char_section {
            continue;
        }
        let mut fields = line.split_whitespace();
        if let (Some(major), Some(name)) = (fields.next(), fields.next()) {
            if let Ok(major) = major.parse::<u32>() {
                // First registration wins; some drivers register several ranges
                majors.entry(name.to_string()).or_insert(major);
            }
        }
    }
    majors
}

/// Extracts the manager version from `pveversion` output
/// (e.g. `pve-manager/9.0.3/025864202ebb6109 (running kernel: 6.14.8-2-pve)`)
pub fn parse_pveversion(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("pve-manager/"))
        .and_then(|rest| rest.split('/').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parses /etc/os-release
pub fn parse_os_release(os_release: &str) -> Option<Distribution> {
    let mut name = String::new();
    let mut version = String::new();
    let mut id = String::new();

    for line in os_release.lines() {
        if let Some(v) = line.strip_prefix("NAME=") {
            name = v.trim_matches('"').to_string();
        } else if let Some(v) = line.strip_prefix("VERSION=") {
            version = v.trim_matches('"').to_string();
        } else if let Some(v) = line.strip_prefix("ID=") {
            id = v.trim_matches('"').to_string();
        }
    }

    if name.is_empty() {
        None
    } else {
        Some(Distribution { name, version, id })
    }
}
