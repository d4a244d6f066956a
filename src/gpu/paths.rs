// Stable device path resolution
//
// DRM node names (card0, card1, renderD128, ...) depend on probe order and
// change when hardware is added or reordered. /dev/dri/by-path carries one
// symlink per node keyed by PCI address, which is the only stable handle.

use std::fs;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::host::HostFacts;
use crate::gpu::canonical_pci_address;

/// Directory holding the PCI-keyed DRM symlinks
pub const BY_PATH_DIR: &str = "/dev/dri/by-path";

/// Card and render nodes of one GPU, as host paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPaths {
    pub card_link: PathBuf,
    pub card_node: PathBuf,
    pub render_link: Option<PathBuf>,
    pub render_node: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Card,
    Render,
}

/// Finds the by-path entries for `pci_address`.
///
/// Returns `None` when no card entry matches; a device index is never guessed.
pub fn resolve(host: &HostFacts, pci_address: &str) -> Option<ResolvedPaths> {
    let target = canonical_pci_address(pci_address)?;
    let dir = host.path(BY_PATH_DIR);

    let mut names: Vec<String> = match fs::read_dir(&dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "by-path directory not readable");
            return None;
        }
    };
    names.sort();

    let re = Regex::new(r"^pci-([0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7])-(card|render)$").ok()?;

    let mut card: Option<(PathBuf, PathBuf)> = None;
    let mut render: Option<(PathBuf, PathBuf)> = None;

    for name in names {
        let Some(caps) = re.captures(&name) else { continue };
        if canonical_pci_address(&caps[1]).as_deref() != Some(target.as_str()) {
            continue;
        }
        let kind = if &caps[2] == "card" { NodeKind::Card } else { NodeKind::Render };
        let link = Path::new(BY_PATH_DIR).join(&name);
        let Some(node) = link_target(host, &link) else { continue };

        let slot = match kind {
            NodeKind::Card => &mut card,
            NodeKind::Render => &mut render,
        };
        if slot.is_none() {
            *slot = Some((link, node));
        }
    }

    let (card_link, card_node) = card?;
    let (render_link, render_node) = match render {
        Some((link, node)) => (Some(link), Some(node)),
        None => (None, None),
    };

    debug!(pci = %target, card = %card_node.display(), render = ?render_node, "Resolved DRM nodes");
    Some(ResolvedPaths { card_link, card_node, render_link, render_node })
}

/// Reads a by-path symlink and returns its target as an absolute host path
fn link_target(host: &HostFacts, link: &Path) -> Option<PathBuf> {
    let target = match fs::read_link(host.path(link)) {
        Ok(target) => target,
        Err(e) => {
            debug!(link = %link.display(), error = %e, "Skipping unreadable by-path entry");
            return None;
        }
    };
    let absolute = if target.is_absolute() {
        target
    } else {
        link.parent().unwrap_or(Path::new("/")).join(target)
    };
    Some(normalize(&absolute))
}

/// Lexically removes `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
