// src/core/bootloader/grub.rs

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use super::{BootBackend, BootBackendKind, GRUB_BACKEND_MARKER};
use crate::core::host::HostFacts;
use crate::core::process::{CommandRunner, CommandSpec};
use crate::error::{Error, Result};
use crate::utils::create_timestamped_backup;

/// GRUB regeneration commands, tried in order
const UPDATE_COMMANDS: &[(&str, &[&str])] = &[
    ("update-grub", &[]),
    ("grub-mkconfig", &["-o", "/boot/grub/grub.cfg"]),
    ("grub2-mkconfig", &["-o", "/boot/grub2/grub.cfg"]),
];

/// GRUB backend editing GRUB_CMDLINE_LINUX_DEFAULT in /etc/default/grub
#[derive(Debug)]
pub struct GrubDefault {
    default_grub_path: PathBuf,
    update_command: Option<(&'static str, &'static [&'static str])>,
}

impl GrubDefault {
    pub fn new(host: &HostFacts) -> Self {
        let update_command = UPDATE_COMMANDS
            .iter()
            .find(|(name, _)| host.find_tool(name).is_some())
            .map(|(name, args)| (*name, *args));
        Self { default_grub_path: host.path(GRUB_BACKEND_MARKER), update_command }
    }
}

/// Extracts the quoted GRUB_CMDLINE_LINUX_DEFAULT value; empty if the line is absent
pub fn read_cmdline_default(content: &str) -> Result<String> {
    // The regex crate has no backreferences, so each quote style gets its own group
    let re = Regex::new(r#"(?m)^\s*GRUB_CMDLINE_LINUX_DEFAULT\s*=\s*(?:"([^"]*)"|'([^']*)')"#)?;
    Ok(re
        .captures(content)
        .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map_or(String::new(), |m| m.as_str().to_string()))
}

/// Replaces the GRUB_CMDLINE_LINUX_DEFAULT value, appending the line if absent
pub fn write_cmdline_default(content: &str, params: &str) -> Result<String> {
    let re = Regex::new(r#"(?m)^(?P<prefix>\s*GRUB_CMDLINE_LINUX_DEFAULT\s*=\s*["'])(?P<params>.*?)(?P<suffix>["']\s*)$"#)?;

    if re.is_match(content) {
        Ok(re
            .replacen(content, 1, |caps: &regex::Captures| format!("{}{}{}", &caps["prefix"], params, &caps["suffix"]))
            .into_owned())
    } else {
        warn!("GRUB_CMDLINE_LINUX_DEFAULT line not found or malformed, appending");
        let mut content = content.to_string();
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&format!("GRUB_CMDLINE_LINUX_DEFAULT=\"{}\"\n", params));
        Ok(content)
    }
}

impl BootBackend for GrubDefault {
    fn kind(&self) -> BootBackendKind {
        BootBackendKind::GrubDefault
    }

    fn read_line(&self) -> Result<String> {
        let content = fs::read_to_string(&self.default_grub_path)?;
        read_cmdline_default(&content)
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let content = fs::read_to_string(&self.default_grub_path)?;
        let backup = create_timestamped_backup(&self.default_grub_path)?;
        debug!(backup = %backup.display(), "Created backup");
        fs::write(&self.default_grub_path, write_cmdline_default(&content, line)?)?;
        info!(path = %self.default_grub_path.display(), "Updated GRUB defaults");
        Ok(())
    }

    fn refresh(&self, runner: &dyn CommandRunner, timeout: Duration) -> Result<()> {
        let Some((program, args)) = &self.update_command else {
            return Err(Error::BootRefreshFailed(
                "no GRUB update command found (update-grub, grub-mkconfig, grub2-mkconfig)".to_string(),
            ));
        };

        let spec = CommandSpec::new(program, args).with_timeout(timeout);
        info!(command = %spec.display(), "Regenerating GRUB configuration");
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

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_GRUB: &str = "\
GRUB_DEFAULT=0
GRUB_TIMEOUT=5
GRUB_DISTRIBUTOR=`lsb_release -i -s 2> /dev/null || echo Debian`
GRUB_CMDLINE_LINUX_DEFAULT=\"quiet\"
GRUB_CMDLINE_LINUX=\"\"
";

    #[test]
    fn reads_default_line_not_plain_linux_line() {
        assert_eq!(read_cmdline_default(DEFAULT_GRUB).unwrap(), "quiet");
        assert_eq!(read_cmdline_default("GRUB_CMDLINE_LINUX_DEFAULT='quiet splash'\n").unwrap(), "quiet splash");
        assert_eq!(read_cmdline_default("GRUB_TIMEOUT=5\n").unwrap(), "");
    }

    #[test]
    fn rewrites_only_the_default_line() {
        let out = write_cmdline_default(DEFAULT_GRUB, "quiet amd_iommu=on").unwrap();
        assert!(out.contains("GRUB_CMDLINE_LINUX_DEFAULT=\"quiet amd_iommu=on\"\n"));
        assert!(out.contains("GRUB_CMDLINE_LINUX=\"\"\n"));
        assert!(out.contains("GRUB_TIMEOUT=5\n"));
    }

    #[test]
    fn appends_missing_line() {
        let out = write_cmdline_default("GRUB_TIMEOUT=5", "iommu=pt").unwrap();
        assert_eq!(out, "GRUB_TIMEOUT=5\nGRUB_CMDLINE_LINUX_DEFAULT=\"iommu=pt\"\n");
    }
}
