// Container passthrough configuration
//
// Turns a resolved GpuDevice into the LXC directives that expose it inside a
// system container: cgroup device-class allow rules, bind mounts of the
// device nodes and the container-wide overrides the vendor stack needs.
// Synthesis is a pure function of (GpuDevice, SynthesisContext) so re-running
// it against an already configured container produces the same block.

pub mod lxc;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::host::{HostFacts, HostPlatform};
use crate::error::{Error, Result};
use crate::gpu::vendor::{self, DeviceClass, DeviceClassRole, MountCondition, Quirk, VendorProfile, DRM_CLASS};
use crate::gpu::{GpuDevice, GpuVendor};

/// In-container DRM node names the workloads expect
pub const CONTAINER_CARD: &str = "dev/dri/card0";
pub const CONTAINER_RENDER: &str = "dev/dri/renderD128";

/// Module parameter hidden by the AppArmor quirk
pub const APPARMOR_ENABLED_PARAM: &str = "sys/module/apparmor/parameters/enabled";

/// What a bind mount creates in the container when the target is missing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateKind {
    File,
    Dir,
}

impl CreateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreateKind::File => "file",
            CreateKind::Dir => "dir",
        }
    }
}

/// cgroup device permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAccess {
    /// read, write, mknod
    ReadWriteMknod,
}

impl DeviceAccess {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceAccess::ReadWriteMknod => "rwm",
        }
    }
}

/// One isolation directive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PassthroughRule {
    DeviceClassAllow {
        major: u32,
        access: DeviceAccess,
    },
    BindMount {
        host_path: PathBuf,
        container_path: String,
        optional: bool,
        create: CreateKind,
    },
}

impl fmt::Display for PassthroughRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassthroughRule::DeviceClassAllow { major, access } => {
                write!(f, "lxc.cgroup2.devices.allow: c {}:* {}", major, access.as_str())
            }
            PassthroughRule::BindMount { host_path, container_path, optional, create } => {
                let optional = if *optional { ",optional" } else { "" };
                write!(
                    f,
                    "lxc.mount.entry: {} {} none bind{},create={}",
                    host_path.display(),
                    container_path,
                    optional,
                    create.as_str()
                )
            }
        }
    }
}

/// Container-wide relaxations
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SandboxOverride {
    /// Run the container without an AppArmor profile
    MacUnconfined,
    /// Bind /dev/null over a virtual file inside the container
    MaskVirtualFile { container_path: String },
}

impl fmt::Display for SandboxOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxOverride::MacUnconfined => write!(f, "lxc.apparmor.profile: unconfined"),
            SandboxOverride::MaskVirtualFile { container_path } => {
                write!(f, "lxc.mount.entry: /dev/null {} none bind 0 0", container_path)
            }
        }
    }
}

/// Ordered, deduplicated rule list plus overrides for one GPU
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassthroughConfig {
    pub vendor: GpuVendor,
    pub pci_address: String,
    pub rules: Vec<PassthroughRule>,
    pub overrides: BTreeSet<SandboxOverride>,
}

impl PassthroughConfig {
    pub fn new(vendor: GpuVendor, pci_address: &str) -> Self {
        Self { vendor, pci_address: pci_address.to_string(), rules: Vec::new(), overrides: BTreeSet::new() }
    }

    /// Appends a rule unless an identical one is already present
    pub fn push(&mut self, rule: PassthroughRule) -> bool {
        if self.rules.contains(&rule) {
            return false;
        }
        self.rules.push(rule);
        true
    }

    /// The literal LXC directive block
    pub fn render(&self) -> String {
        let mut out = String::new();
        for rule in &self.rules {
            out.push_str(&rule.to_string());
            out.push('\n');
        }
        for override_ in &self.overrides {
            out.push_str(&override_.to_string());
            out.push('\n');
        }
        out
    }

    pub fn allowed_majors(&self) -> Vec<u32> {
        self.rules
            .iter()
            .filter_map(|rule| match rule {
                PassthroughRule::DeviceClassAllow { major, .. } => Some(*major),
                _ => None,
            })
            .collect()
    }

    pub fn has_mount_to(&self, container: &str) -> bool {
        self.rules.iter().any(|rule| {
            matches!(rule, PassthroughRule::BindMount { container_path, .. } if container_path == container)
        })
    }

    /// Absolute in-container paths of the bound device files
    pub fn container_nodes(&self) -> Vec<String> {
        self.rules
            .iter()
            .filter_map(|rule| match rule {
                PassthroughRule::BindMount { container_path, create: CreateKind::File, .. } => {
                    Some(format!("/{}", container_path))
                }
                _ => None,
            })
            .collect()
    }
}

/// auto / on / off switch for a quirk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Toggle {
    #[default]
    Auto,
    On,
    Off,
}

impl Toggle {
    pub fn resolve(self, auto: bool) -> bool {
        match self {
            Toggle::Auto => auto,
            Toggle::On => true,
            Toggle::Off => false,
        }
    }
}

/// Operator control over the container overrides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverridePolicy {
    pub mac_unconfined: bool,
    pub apparmor_param_mask: Toggle,
}

impl Default for OverridePolicy {
    fn default() -> Self {
        Self { mac_unconfined: true, apparmor_param_mask: Toggle::Auto }
    }
}

/// Which host path a DRM bind mount uses as its source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountSource {
    /// The resolved node, e.g. /dev/dri/card1
    #[default]
    Node,
    /// The by-path symlink, stable across reordering
    ByPath,
}

/// A top-level /dev entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Host inputs to synthesis besides the device itself
#[derive(Debug, Clone)]
pub struct SynthesisContext {
    /// Character device majors by /proc/devices name
    pub majors: BTreeMap<String, u32>,
    /// Top-level /dev entries, sorted by name
    pub dev_entries: Vec<DevEntry>,
    pub platform: Option<HostPlatform>,
    pub overrides: OverridePolicy,
    pub mount_source: MountSource,
}

impl SynthesisContext {
    /// Builds the context from host facts. Configured majors take precedence
    /// over /proc/devices.
    pub fn from_host(
        host: &HostFacts,
        overrides: OverridePolicy,
        mount_source: MountSource,
        major_overrides: &BTreeMap<String, u32>,
    ) -> Self {
        let mut majors = host.char_majors.clone();
        majors.extend(major_overrides.iter().map(|(name, major)| (name.clone(), *major)));

        let mut dev_entries: Vec<DevEntry> = match fs::read_dir(host.path("/dev")) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| DevEntry {
                    name: e.file_name().to_string_lossy().into_owned(),
                    is_dir: e.file_type().map(|t| t.is_dir()).unwrap_or(false),
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "Could not list /dev");
                Vec::new()
            }
        };
        dev_entries.sort_by(|a, b| a.name.cmp(&b.name));

        Self { majors, dev_entries, platform: host.platform.clone(), overrides, mount_source }
    }

    pub fn major_for(&self, class: &DeviceClass) -> u32 {
        class
            .proc_name
            .and_then(|name| self.majors.get(name).copied())
            .unwrap_or(class.default_major)
    }

    fn has_dev_entry(&self, host_path: &str) -> bool {
        let name = host_path.strip_prefix("/dev/").unwrap_or(host_path);
        self.dev_entries.iter().any(|entry| entry.name == name)
    }
}

/// Produces the passthrough rules for one GPU.
///
/// Fails when the vendor has no profile or when the DRM nodes the vendor
/// needs could not be resolved; a device index is never guessed.
pub fn synthesize(device: &GpuDevice, ctx: &SynthesisContext) -> Result<PassthroughConfig> {
    let profile = vendor::profile(&device.vendor).ok_or_else(|| Error::UnsupportedVendor(device.vendor.clone()))?;
    if profile.requires_drm_nodes && device.paths.is_none() {
        return Err(Error::DeviceNodeUnresolvable(device.pci_address.clone()));
    }

    let mut config = PassthroughConfig::new(device.vendor.clone(), &device.pci_address);

    for class in profile.device_classes {
        config.push(PassthroughRule::DeviceClassAllow {
            major: ctx.major_for(class),
            access: DeviceAccess::ReadWriteMknod,
        });
    }

    // Mounted DRM nodes are useless unless their class is allowed too
    if device.paths.is_some() {
        config.push(PassthroughRule::DeviceClassAllow {
            major: ctx.major_for(&DRM_CLASS),
            access: DeviceAccess::ReadWriteMknod,
        });
    }

    push_drm_mounts(&mut config, device, ctx);
    push_vendor_mounts(&mut config, device, profile, ctx);

    if ctx.overrides.mac_unconfined {
        config.overrides.insert(SandboxOverride::MacUnconfined);
    }
    let mask_auto = profile
        .platform_quirks
        .iter()
        .any(|q| q.quirk == Quirk::AppArmorParamMask && q.applies_to(ctx.platform.as_ref()));
    if ctx.overrides.apparmor_param_mask.resolve(mask_auto) {
        config.overrides.insert(SandboxOverride::MaskVirtualFile {
            container_path: APPARMOR_ENABLED_PARAM.to_string(),
        });
    }

    debug!(pci = %device.pci_address, rules = config.rules.len(), overrides = config.overrides.len(), "Synthesized passthrough config");
    Ok(config)
}

fn push_drm_mounts(config: &mut PassthroughConfig, device: &GpuDevice, ctx: &SynthesisContext) {
    let Some(paths) = &device.paths else {
        warn!(pci = %device.pci_address, "No DRM nodes resolved, skipping card/render mounts");
        return;
    };

    let (card, render) = match ctx.mount_source {
        MountSource::Node => (paths.card_node.clone(), paths.render_node.clone()),
        MountSource::ByPath => (paths.card_link.clone(), paths.render_link.clone()),
    };

    config.push(bind_file(card, CONTAINER_CARD));
    match render {
        Some(render) => {
            config.push(bind_file(render, CONTAINER_RENDER));
        }
        None => warn!(pci = %device.pci_address, "No render node resolved"),
    }
}

fn push_vendor_mounts(config: &mut PassthroughConfig, device: &GpuDevice, profile: &VendorProfile, ctx: &SynthesisContext) {
    if let Some(prefix) = profile.passthrough_node_prefix {
        for entry in ctx.dev_entries.iter().filter(|e| !e.is_dir && e.name.starts_with(prefix)) {
            config.push(bind_file(PathBuf::from("/dev").join(&entry.name), &format!("dev/{}", entry.name)));
        }
    }

    for mount in profile.node_mounts {
        let wanted = match mount.when {
            MountCondition::ComputeInterfacePresent => device.compute_interface_present,
            MountCondition::HostNodeExists => ctx.has_dev_entry(mount.host_path),
        };
        if wanted {
            config.push(PassthroughRule::BindMount {
                host_path: PathBuf::from(mount.host_path),
                container_path: mount.container_path.to_string(),
                optional: true,
                create: mount.create,
            });
        }
    }
}

fn bind_file(host_path: PathBuf, container_path: &str) -> PassthroughRule {
    PassthroughRule::BindMount {
        host_path,
        container_path: container_path.to_string(),
        optional: true,
        create: CreateKind::File,
    }
}

/// A rule a working configuration cannot do without
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MissingRule {
    DeviceClass { role: DeviceClassRole, major: u32 },
    CardMount,
}

impl fmt::Display for MissingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingRule::DeviceClass { role, major } => {
                write!(f, "missing device-class allow for {} (major {})", role.label(), major)
            }
            MissingRule::CardMount => write!(f, "missing bind mount for {}", CONTAINER_CARD),
        }
    }
}

/// Lists required rules absent from `config`. Catches hand-edited or stale
/// blocks where, for example, the NVIDIA UVM class was dropped.
pub fn check_completeness(config: &PassthroughConfig, ctx: &SynthesisContext) -> Result<Vec<MissingRule>> {
    let profile = vendor::profile(&config.vendor).ok_or_else(|| Error::UnsupportedVendor(config.vendor.clone()))?;
    let allowed = config.allowed_majors();

    let mut missing: Vec<MissingRule> = profile
        .device_classes
        .iter()
        .map(|class| (class.role, ctx.major_for(class)))
        .filter(|(_, major)| !allowed.contains(major))
        .map(|(role, major)| MissingRule::DeviceClass { role, major })
        .collect();

    if config.has_mount_to(CONTAINER_CARD) {
        let drm = MissingRule::DeviceClass { role: DRM_CLASS.role, major: ctx.major_for(&DRM_CLASS) };
        if !allowed.contains(&ctx.major_for(&DRM_CLASS)) && !missing.contains(&drm) {
            missing.push(drm);
        }
    } else if profile.requires_drm_nodes {
        missing.push(MissingRule::CardMount);
    }
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_rendering() {
        let allow = PassthroughRule::DeviceClassAllow { major: 226, access: DeviceAccess::ReadWriteMknod };
        assert_eq!(allow.to_string(), "lxc.cgroup2.devices.allow: c 226:* rwm");

        let mount = bind_file(PathBuf::from("/dev/dri/card1"), CONTAINER_CARD);
        assert_eq!(mount.to_string(), "lxc.mount.entry: /dev/dri/card1 dev/dri/card0 none bind,optional,create=file");

        let mask = SandboxOverride::MaskVirtualFile { container_path: APPARMOR_ENABLED_PARAM.to_string() };
        assert_eq!(
            mask.to_string(),
            "lxc.mount.entry: /dev/null sys/module/apparmor/parameters/enabled none bind 0 0"
        );
    }

    #[test]
    fn push_deduplicates() {
        let mut config = PassthroughConfig::new(GpuVendor::AMD, "0000:c3:00.0");
        let allow = PassthroughRule::DeviceClassAllow { major: 226, access: DeviceAccess::ReadWriteMknod };
        assert!(config.push(allow.clone()));
        assert!(!config.push(allow));
        assert_eq!(config.rules.len(), 1);
    }

    #[test]
    fn toggle_resolution() {
        assert!(Toggle::Auto.resolve(true));
        assert!(!Toggle::Auto.resolve(false));
        assert!(Toggle::On.resolve(false));
        assert!(!Toggle::Off.resolve(true));
    }
}
