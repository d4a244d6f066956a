// src/core/bootloader/mod.rs
//
// Idempotent kernel boot parameter management over two file-based backends.
// The managed keys are stripped and re-appended as a unit; unrelated
// parameters keep their position. A line that already carries every desired
// value is never rewritten.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

pub mod cmdline_file;
pub mod grub;

use crate::core::host::HostFacts;
use crate::core::process::{CommandRunner, DEFAULT_REFRESH_TIMEOUT};
use crate::error::{Error, Result};
use cmdline_file::KernelCmdlineFile;
use grub::GrubDefault;

/// Marker selecting the kernel command line file backend
pub const CMDLINE_BACKEND_MARKER: &str = "/etc/kernel/proxmox-boot-uuids";
/// Marker selecting the GRUB backend
pub const GRUB_BACKEND_MARKER: &str = "/etc/default/grub";

/// Bootloader backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BootBackendKind {
    GrubDefault,
    KernelCmdlineFile,
}

impl fmt::Display for BootBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BootBackendKind::GrubDefault => write!(f, "GRUB (/etc/default/grub)"),
            BootBackendKind::KernelCmdlineFile => write!(f, "kernel cmdline (/etc/kernel/cmdline)"),
        }
    }
}

/// Read/write access to the persisted kernel parameter line
pub trait BootBackend {
    fn kind(&self) -> BootBackendKind;

    /// Returns the persisted parameter line
    fn read_line(&self) -> Result<String>;

    /// Replaces the persisted parameter line
    fn write_line(&self, line: &str) -> Result<()>;

    /// Regenerates the boot configuration from the persisted line
    fn refresh(&self, runner: &dyn CommandRunner, timeout: Duration) -> Result<()>;
}

/// Selects the active backend by marker file
pub fn detect_backend(host: &HostFacts) -> Result<Box<dyn BootBackend>> {
    if host.exists(CMDLINE_BACKEND_MARKER) {
        debug!("Using kernel cmdline file backend");
        return Ok(Box::new(KernelCmdlineFile::new(host)));
    }
    if host.exists(GRUB_BACKEND_MARKER) {
        debug!("Using GRUB backend");
        return Ok(Box::new(GrubDefault::new(host)));
    }
    Err(Error::BootBackendNotFound(format!("{} or {}", CMDLINE_BACKEND_MARKER, GRUB_BACKEND_MARKER)))
}

/// Parsed view of a parameter line. Bare flags map to an empty value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootParameterSet {
    pub backend: BootBackendKind,
    pub params: BTreeMap<String, String>,
}

impl BootParameterSet {
    pub fn parse(backend: BootBackendKind, line: &str) -> Self {
        let params = line.split_whitespace().map(split_token).map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Self { backend, params }
    }
}

/// Result of an apply/remove
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub changed: bool,
    pub reboot_required: bool,
}

/// Where the desired parameters stand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BootParamState {
    /// Not in the persisted configuration
    Unconfigured,
    /// Persisted but not in the running kernel's command line
    Stale,
    /// Persisted and active
    Current,
}

pub struct BootParameterManager<'a> {
    backend: Box<dyn BootBackend>,
    host: &'a HostFacts,
    runner: &'a dyn CommandRunner,
    dry_run: bool,
    refresh_timeout: Duration,
}

impl<'a> BootParameterManager<'a> {
    pub fn new(backend: Box<dyn BootBackend>, host: &'a HostFacts, runner: &'a dyn CommandRunner) -> Self {
        Self { backend, host, runner, dry_run: false, refresh_timeout: DEFAULT_REFRESH_TIMEOUT }
    }

    /// Manager for whichever backend the host uses
    pub fn detect(host: &'a HostFacts, runner: &'a dyn CommandRunner) -> Result<Self> {
        Ok(Self::new(detect_backend(host)?, host, runner))
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn backend(&self) -> BootBackendKind {
        self.backend.kind()
    }

    pub fn current(&self) -> Result<BootParameterSet> {
        Ok(BootParameterSet::parse(self.backend.kind(), &self.backend.read_line()?))
    }

    /// Makes the persisted line carry exactly the desired values.
    ///
    /// Leaves the file untouched when every desired key already occurs once
    /// with the desired value. Reboot is required after a change and whenever the
    /// running kernel was booted without the desired values.
    pub fn apply(&self, desired: &BTreeMap<String, String>) -> Result<ApplyOutcome> {
        let line = self.backend.read_line()?;
        let pending = self.pending(desired);

        if line_satisfies(&line, desired) {
            debug!(backend = %self.backend.kind(), "Boot parameters already configured");
            return Ok(ApplyOutcome { changed: false, reboot_required: pending });
        }

        let keys: Vec<&str> = desired.keys().map(String::as_str).collect();
        let mut tokens = strip_keys(&line, &keys);
        tokens.extend(desired.iter().map(|(k, v)| join_token(k, v)));
        self.commit(&line, &tokens.join(" "))?;

        Ok(ApplyOutcome { changed: true, reboot_required: true })
    }

    /// Removes every occurrence of `keys`
    pub fn remove(&self, keys: &[&str]) -> Result<ApplyOutcome> {
        let line = self.backend.read_line()?;
        let live_has_keys = self
            .host
            .kernel_cmdline
            .split_whitespace()
            .any(|token| keys.contains(&split_token(token).0));

        let tokens = strip_keys(&line, keys);
        if tokens.len() == line.split_whitespace().count() {
            debug!(backend = %self.backend.kind(), "Boot parameters already absent");
            return Ok(ApplyOutcome { changed: false, reboot_required: live_has_keys });
        }

        self.commit(&line, &tokens.join(" "))?;
        Ok(ApplyOutcome { changed: true, reboot_required: true })
    }

    /// Whether the running kernel lacks the desired values
    pub fn pending(&self, desired: &BTreeMap<String, String>) -> bool {
        live_cmdline_pending(self.host, desired)
    }

    pub fn status(&self, desired: &BTreeMap<String, String>) -> Result<BootParamState> {
        let line = self.backend.read_line()?;
        Ok(if !line_satisfies(&line, desired) {
            BootParamState::Unconfigured
        } else if self.pending(desired) {
            BootParamState::Stale
        } else {
            BootParamState::Current
        })
    }

    /// Writes `new_line` and regenerates the boot configuration. A failed
    /// refresh puts `old_line` back so the next apply retries the whole change.
    fn commit(&self, old_line: &str, new_line: &str) -> Result<()> {
        info!(backend = %self.backend.kind(), line = %new_line, "New kernel parameter line");
        if self.dry_run {
            info!("[DRY RUN] Not writing boot configuration");
            return Ok(());
        }
        self.backend.write_line(new_line)?;

        if let Err(refresh_error) = self.backend.refresh(self.runner, self.refresh_timeout) {
            warn!(error = %refresh_error, "Boot refresh failed, restoring previous parameter line");
            if let Err(restore_error) = self.backend.write_line(old_line) {
                error!(error = %restore_error, line = %old_line, "Could not restore previous parameter line");
            }
            return Err(refresh_error);
        }
        Ok(())
    }
}

/// Whether the kernel was booted without the desired values. Also feeds the
/// reboot signal of the verification pipeline.
pub fn live_cmdline_pending(host: &HostFacts, desired: &BTreeMap<String, String>) -> bool {
    !line_satisfies(&host.kernel_cmdline, desired)
}

/// Splits `key=value` into its parts; a bare flag has an empty value
pub fn split_token(token: &str) -> (&str, &str) {
    token.split_once('=').unwrap_or((token, ""))
}

fn join_token(key: &str, value: &str) -> String {
    if value.is_empty() {
        key.to_string()
    } else {
        format!("{}={}", key, value)
    }
}

/// True when every desired key occurs exactly once, with the desired value
pub fn line_satisfies(line: &str, desired: &BTreeMap<String, String>) -> bool {
    desired.iter().all(|(key, value)| {
        let values: Vec<&str> = line
            .split_whitespace()
            .map(split_token)
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v)
            .collect();
        values == [value.as_str()]
    })
}

/// Tokens of `line` with every occurrence of `keys` removed, order preserved
fn strip_keys(line: &str, keys: &[&str]) -> Vec<String> {
    line.split_whitespace()
        .filter(|token| !keys.contains(&split_token(token).0))
        .map(String::from)
        .collect()
}
