// src/core/bootloader/cmdline_file.rs
//
// Backend for hosts booted through proxmox-boot-tool, where the kernel
// command line lives on the single line of /etc/kernel/cmdline.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info};

use super::{BootBackend, BootBackendKind};
use crate::core::host::HostFacts;
use crate::core::process::{CommandRunner, CommandSpec};
use crate::error::{Error, Result};
use crate::utils::create_timestamped_backup;

pub const CMDLINE_PATH: &str = "/etc/kernel/cmdline";

const REFRESH_TOOL: &str = "proxmox-boot-tool";

#[derive(Debug)]
pub struct KernelCmdlineFile {
    cmdline_path: PathBuf,
}

impl KernelCmdlineFile {
    pub fn new(host: &HostFacts) -> Self {
        Self { cmdline_path: host.path(CMDLINE_PATH) }
    }
}

impl BootBackend for KernelCmdlineFile {
    fn kind(&self) -> BootBackendKind {
        BootBackendKind::KernelCmdlineFile
    }

    fn read_line(&self) -> Result<String> {
        // A missing file is an empty command line
        match fs::read_to_string(&self.cmdline_path) {
            Ok(content) => Ok(content.lines().next().unwrap_or_default().trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let backup = create_timestamped_backup(&self.cmdline_path)?;
        debug!(backup = %backup.display(), "Created backup");
        fs::write(&self.cmdline_path, format!("{}\n", line))?;
        info!(path = %self.cmdline_path.display(), "Updated kernel command line");
        Ok(())
    }

    fn refresh(&self, runner: &dyn CommandRunner, timeout: Duration) -> Result<()> {
        let spec = CommandSpec::new(REFRESH_TOOL, &["refresh"]).with_timeout(timeout);
        info!(command = %spec.display(), "Refreshing boot entries");
        let output = runner.run(&spec).map_err(|e| Error::BootRefreshFailed(e.to_string()))?;
        if !output.success() {
            return Err(Error::BootRefreshFailed(format!(
                "{} exited with {:?}: {}",
                spec.display(),
                output.status,
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}
