// LXC container integration
//
// Writes a PassthroughConfig into a container's config file as a managed
// block, and runs probes inside a running container through `pct`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::core::host::HostFacts;
use crate::core::process::{CommandOutput, CommandRunner, CommandSpec};
use crate::error::{Error, ProbeError, Result};
use crate::passthrough::PassthroughConfig;
use crate::utils::create_timestamped_backup;

/// Directory holding per-container configs
pub const CONFIG_DIR: &str = "/etc/pve/lxc";

const BEGIN_MARKER: &str = "# exliar-gpu: begin";
const END_MARKER: &str = "# exliar-gpu: end";

/// A container config file with an optional managed passthrough block
#[derive(Debug, Clone)]
pub struct SandboxConfigFile {
    ctid: u32,
    path: PathBuf,
}

impl SandboxConfigFile {
    pub fn new(host: &HostFacts, ctid: u32) -> Self {
        Self { ctid, path: host.path(format!("{}/{}.conf", CONFIG_DIR, ctid)) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `config` as the managed block, replacing any previous one.
    /// Returns false without touching the file when the block is unchanged.
    pub fn apply(&self, config: &PassthroughConfig, dry_run: bool) -> Result<bool> {
        let block = format!(
            "{}\n# {} {}\n{}{}\n",
            BEGIN_MARKER,
            config.vendor,
            config.pci_address,
            config.render(),
            END_MARKER
        );
        self.update(Some(&block), dry_run)
    }

    /// Deletes the managed block
    pub fn remove(&self, dry_run: bool) -> Result<bool> {
        self.update(None, dry_run)
    }

    /// The currently written managed block, markers included
    pub fn managed_block(&self) -> Result<Option<String>> {
        let content = self.read()?;
        let (_, block) = split_managed_block(&content);
        Ok(block)
    }

    fn update(&self, block: Option<&str>, dry_run: bool) -> Result<bool> {
        let current = self.read()?;
        let updated = splice_block(&current, block);
        if updated == current {
            debug!(ctid = self.ctid, "Container config already up to date");
            return Ok(false);
        }

        if dry_run {
            info!(ctid = self.ctid, path = %self.path.display(), "[DRY RUN] Would rewrite container config");
            return Ok(true);
        }

        let backup = create_timestamped_backup(&self.path).map_err(|e| self.write_failed(e))?;
        debug!(backup = %backup.display(), "Created backup");
        fs::write(&self.path, updated).map_err(|e| self.write_failed(e))?;
        info!(ctid = self.ctid, path = %self.path.display(), "Updated container config");
        Ok(true)
    }

    fn read(&self) -> Result<String> {
        fs::read_to_string(&self.path).map_err(|e| self.write_failed(e))
    }

    fn write_failed(&self, e: std::io::Error) -> Error {
        Error::SandboxConfigWriteFailed { path: self.path.clone(), reason: e.to_string() }
    }
}

/// Splits a config into the content without the managed block and the block itself
fn split_managed_block(content: &str) -> (Vec<&str>, Option<String>) {
    let mut kept = Vec::new();
    let mut block: Option<String> = None;
    let mut inside = false;

    for line in content.lines() {
        if line.trim() == BEGIN_MARKER {
            inside = true;
            block = Some(String::new());
        }
        if inside {
            if let Some(b) = block.as_mut() {
                b.push_str(line);
                b.push('\n');
            }
            if line.trim() == END_MARKER {
                inside = false;
            }
            continue;
        }
        kept.push(line);
    }
    (kept, block)
}

/// Removes any managed block and inserts `block` at the end of the main
/// section, before the first `[snapshot]` section.
fn splice_block(content: &str, block: Option<&str>) -> String {
    let (kept, _) = split_managed_block(content);

    let snapshot_start = kept.iter().position(|line| line.starts_with('['));
    let (main, snapshots) = kept.split_at(snapshot_start.unwrap_or(kept.len()));

    let mut out = String::new();
    for line in main {
        out.push_str(line);
        out.push('\n');
    }
    if let Some(block) = block {
        out.push_str(block);
    }
    for line in snapshots {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Result of an access probe on one in-container node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAccess {
    Ok,
    Missing,
    Denied,
}

/// `pct` front end
pub struct ContainerCli<'a> {
    runner: &'a dyn CommandRunner,
    timeout: Duration,
}

impl<'a> ContainerCli<'a> {
    pub fn new(runner: &'a dyn CommandRunner, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Whether the container is running; `None` if `pct` gave no answer
    pub fn is_running(&self, ctid: u32) -> std::result::Result<Option<bool>, ProbeError> {
        let ctid = ctid.to_string();
        let spec = CommandSpec::new("pct", &["status", &ctid]).with_timeout(self.timeout);
        let output = self.runner.run(&spec)?;
        Ok(parse_pct_status(&output.stdout))
    }

    /// Runs a shell snippet inside the container
    pub fn exec(&self, ctid: u32, script: &str) -> std::result::Result<CommandOutput, ProbeError> {
        let ctid = ctid.to_string();
        let spec = CommandSpec::new("pct", &["exec", &ctid, "--", "sh", "-c", script]).with_timeout(self.timeout);
        self.runner.run(&spec)
    }

    /// Checks that each node exists and is readable and writable inside the container
    pub fn probe_nodes(&self, ctid: u32, nodes: &[String]) -> std::result::Result<Vec<(String, NodeAccess)>, ProbeError> {
        let output = self.exec(ctid, &node_access_script(nodes))?;
        Ok(parse_node_access(&output.stdout))
    }
}

/// Parses `pct status` output (`status: running`)
pub fn parse_pct_status(stdout: &str) -> Option<bool> {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("status:"))
        .map(|status| status.trim() == "running")
}

/// Shell snippet printing `ok|missing|denied <path>` per node
pub fn node_access_script(nodes: &[String]) -> String {
    nodes
        .iter()
        .map(|node| {
            format!(
                "if [ -e '{0}' ]; then if [ -r '{0}' ] && [ -w '{0}' ]; then echo 'ok {0}'; else echo 'denied {0}'; fi; else echo 'missing {0}'; fi",
                node
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

pub fn parse_node_access(stdout: &str) -> Vec<(String, NodeAccess)> {
    stdout
        .lines()
        .filter_map(|line| {
            let (status, path) = line.trim().split_once(' ')?;
            let access = match status {
                "ok" => NodeAccess::Ok,
                "missing" => NodeAccess::Missing,
                "denied" => NodeAccess::Denied,
                _ => return None,
            };
            Some((path.to_string(), access))
        })
        .collect()
}
