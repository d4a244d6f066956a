// Verification pipeline for Exliar GPU
//
// Runs an ordered list of stages against one GPU and folds their checks into
// a three-way result: Pass, RebootRequired or Fail. Stages accumulate checks
// instead of aborting; only a failed hardware stage stops the run.

pub mod stages;

use std::collections::BTreeMap;
use std::fmt;
use std::process::ExitCode;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::core::bootloader::live_cmdline_pending;
use crate::core::host::HostFacts;
use crate::core::process::CommandRunner;
use crate::error::{Error, ProbeError, Result};
use crate::gpu::vendor::{self, VendorProfile};
use crate::gpu::{GpuDevice, GpuVendor};
use crate::passthrough::SynthesisContext;

/// Outcome of a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckOutcome {
    Pass,
    Fail,
    /// Not evaluated, e.g. a stage that does not apply to this run
    Unknown,
}

/// Why a check failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    HardwareNotFound,
    SelectionAmbiguous,
    DriverNotLoaded,
    DeviceNodeMissing,
    DeviceNodeUnresolvable,
    PermissionDenied,
    ToolMissing,
    ToolNonFunctional,
    Timeout,
    SandboxNotRunning,
}

impl From<&Error> for FailureKind {
    fn from(error: &Error) -> Self {
        match error {
            Error::HardwareNotFound(_) | Error::DeviceNotFound(_) | Error::UnsupportedVendor(_) => {
                FailureKind::HardwareNotFound
            }
            Error::AmbiguousSelection { .. } => FailureKind::SelectionAmbiguous,
            Error::DriverNotLoaded(_) => FailureKind::DriverNotLoaded,
            Error::DeviceNodeMissing(_) => FailureKind::DeviceNodeMissing,
            Error::DeviceNodeUnresolvable(_) => FailureKind::DeviceNodeUnresolvable,
            Error::PermissionDenied(_) => FailureKind::PermissionDenied,
            Error::ToolMissing(_) | Error::Probe(ProbeError::NotFound(_)) => FailureKind::ToolMissing,
            Error::Probe(ProbeError::TimedOut { .. }) => FailureKind::Timeout,
            _ => FailureKind::ToolNonFunctional,
        }
    }
}

impl From<&ProbeError> for FailureKind {
    fn from(error: &ProbeError) -> Self {
        match error {
            ProbeError::NotFound(_) => FailureKind::ToolMissing,
            ProbeError::TimedOut { .. } => FailureKind::Timeout,
            ProbeError::Spawn { .. } => FailureKind::ToolNonFunctional,
        }
    }
}

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum StageKind {
    HardwareDetected,
    DriverLoaded,
    DeviceNodesPresent,
    VendorToolFunctional,
    ComputeFunctional,
    SandboxReachable,
    OptionalTooling,
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::HardwareDetected => "Hardware detected",
            StageKind::DriverLoaded => "Driver loaded",
            StageKind::DeviceNodesPresent => "Device nodes present",
            StageKind::VendorToolFunctional => "Vendor tool functional",
            StageKind::ComputeFunctional => "Compute functional",
            StageKind::SandboxReachable => "Sandbox reachable",
            StageKind::OptionalTooling => "Optional tooling",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One recorded check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationCheck {
    pub stage: StageKind,
    pub name: String,
    pub required: bool,
    pub outcome: CheckOutcome,
    pub detail: String,
    pub failure: Option<FailureKind>,
    pub hint: Option<String>,
}

impl VerificationCheck {
    pub fn pass(stage: StageKind, required: bool, name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            stage,
            name: name.into(),
            required,
            outcome: CheckOutcome::Pass,
            detail: detail.into(),
            failure: None,
            hint: None,
        }
    }

    pub fn fail(
        stage: StageKind,
        required: bool,
        name: impl Into<String>,
        failure: FailureKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            name: name.into(),
            required,
            outcome: CheckOutcome::Fail,
            detail: detail.into(),
            failure: Some(failure),
            hint: None,
        }
    }

    pub fn unknown(stage: StageKind, name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            stage,
            name: name.into(),
            required: false,
            outcome: CheckOutcome::Unknown,
            detail: detail.into(),
            failure: None,
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// A required check that did not pass
    pub fn is_blocking(&self) -> bool {
        self.required && self.outcome != CheckOutcome::Pass
    }
}

/// Overall verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OverallStatus {
    Pass,
    RebootRequired,
    Fail,
}

impl OverallStatus {
    /// 0 success, 3 success pending a reboot, 1 failure
    pub fn exit_code(&self) -> u8 {
        match self {
            OverallStatus::Pass => 0,
            OverallStatus::RebootRequired => 3,
            OverallStatus::Fail => 1,
        }
    }
}

impl From<&OverallStatus> for ExitCode {
    fn from(status: &OverallStatus) -> Self {
        ExitCode::from(status.exit_code())
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OverallStatus::Pass => write!(f, "PASS"),
            OverallStatus::RebootRequired => write!(f, "REBOOT REQUIRED"),
            OverallStatus::Fail => write!(f, "FAIL"),
        }
    }
}

/// Host state that turns a failure into "reboot to finish"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebootSignals {
    /// Driver packages or modules are installed for the running kernel
    pub install_artifacts_present: bool,
    /// The running kernel was booted without the desired parameters
    pub boot_params_pending: bool,
}

/// Folds checks into the overall verdict.
///
/// A missing or failed hardware check is always a failure. Otherwise all
/// required checks passing is a pass, and required failures become
/// RebootRequired only when a reboot is the known remedy: pending boot
/// parameters, or a driver that is installed but not yet loaded.
pub fn derive_overall(checks: &[VerificationCheck], signals: RebootSignals) -> OverallStatus {
    let hardware_ok = checks
        .iter()
        .filter(|c| c.stage == StageKind::HardwareDetected)
        .map(|c| c.outcome == CheckOutcome::Pass)
        .reduce(|a, b| a && b)
        .unwrap_or(false);
    if !hardware_ok {
        return OverallStatus::Fail;
    }

    let blocking: Vec<&VerificationCheck> = checks.iter().filter(|c| c.is_blocking()).collect();
    if blocking.is_empty() {
        return OverallStatus::Pass;
    }

    if signals.boot_params_pending {
        return OverallStatus::RebootRequired;
    }
    let driver_awaits_reboot = blocking
        .iter()
        .any(|c| c.failure == Some(FailureKind::DriverNotLoaded));
    if driver_awaits_reboot && signals.install_artifacts_present {
        return OverallStatus::RebootRequired;
    }

    OverallStatus::Fail
}

/// Machine-readable result of one verification run
#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub vendor: GpuVendor,
    pub pci_address: Option<String>,
    pub checks: Vec<VerificationCheck>,
    pub signals: RebootSignals,
    pub overall: OverallStatus,
    pub passed: usize,
    pub total: usize,
}

impl VerificationReport {
    pub fn new(vendor: GpuVendor, pci_address: Option<String>, checks: Vec<VerificationCheck>, signals: RebootSignals) -> Self {
        let overall = derive_overall(&checks, signals);
        let passed = checks.iter().filter(|c| c.outcome == CheckOutcome::Pass).count();
        let total = checks.len();
        Self { vendor, pci_address, checks, signals, overall, passed, total }
    }

    pub fn exit_code(&self) -> u8 {
        self.overall.exit_code()
    }

    /// Folded outcome of one stage; `None` if the stage did not run
    pub fn stage_outcome(&self, stage: StageKind) -> Option<CheckOutcome> {
        let outcomes: Vec<CheckOutcome> = self.checks.iter().filter(|c| c.stage == stage).map(|c| c.outcome).collect();
        if outcomes.is_empty() {
            None
        } else if outcomes.contains(&CheckOutcome::Fail) {
            Some(CheckOutcome::Fail)
        } else if outcomes.iter().all(|o| *o == CheckOutcome::Pass) {
            Some(CheckOutcome::Pass)
        } else {
            Some(CheckOutcome::Unknown)
        }
    }

    /// The first required check that did not pass
    pub fn first_blocking(&self) -> Option<&VerificationCheck> {
        self.checks.iter().find(|c| c.is_blocking())
    }
}

/// What to verify
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub vendor: GpuVendor,
    /// Explicit PCI address; needed when several GPUs of the vendor exist
    pub gpu: Option<String>,
    /// Container to probe from the inside
    pub ctid: Option<u32>,
    /// Desired kernel parameters, checked against the running kernel
    pub boot_params: BTreeMap<String, String>,
}

/// State shared by the stages of one run
pub struct PipelineContext<'a> {
    pub host: &'a HostFacts,
    pub runner: &'a dyn CommandRunner,
    pub request: VerifyRequest,
    pub profile: &'static VendorProfile,
    pub synthesis: SynthesisContext,
    pub timeout: Duration,
    /// Inventory of supported GPUs, filled by the hardware stage
    pub devices: Vec<GpuDevice>,
    /// The GPU under test, selected by the hardware stage
    pub target: Option<GpuDevice>,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        host: &'a HostFacts,
        runner: &'a dyn CommandRunner,
        request: VerifyRequest,
        synthesis: SynthesisContext,
        timeout: Duration,
    ) -> Result<Self> {
        let profile = vendor::profile(&request.vendor).ok_or_else(|| Error::UnsupportedVendor(request.vendor.clone()))?;
        Ok(Self { host, runner, request, profile, synthesis, timeout, devices: Vec::new(), target: None })
    }

    pub fn reboot_signals(&self) -> RebootSignals {
        RebootSignals {
            install_artifacts_present: self.profile.install_artifacts_present(self.host),
            boot_params_pending: live_cmdline_pending(self.host, &self.request.boot_params),
        }
    }
}

/// A pipeline step. Each stage records one or more checks.
pub trait Stage {
    fn kind(&self) -> StageKind;

    /// Whether this stage's checks count toward the overall verdict
    fn required(&self, ctx: &PipelineContext) -> bool;

    fn run(&self, ctx: &mut PipelineContext, required: bool) -> Vec<VerificationCheck>;
}

pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    /// The seven stages in their fixed order
    pub fn standard() -> Self {
        Self::with_stages(vec![
            Box::new(stages::HardwareDetected),
            Box::new(stages::DriverLoaded),
            Box::new(stages::DeviceNodesPresent),
            Box::new(stages::VendorToolFunctional),
            Box::new(stages::ComputeFunctional),
            Box::new(stages::SandboxReachable),
            Box::new(stages::OptionalTooling),
        ])
    }

    pub fn with_stages(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    pub fn run(&self, ctx: &mut PipelineContext) -> VerificationReport {
        let mut checks = Vec::new();

        for stage in &self.stages {
            let required = stage.required(ctx);
            let stage_checks = stage.run(ctx, required);
            let failed = stage_checks.iter().any(|c| c.outcome == CheckOutcome::Fail);
            debug!(stage = %stage.kind(), checks = stage_checks.len(), failed, "Stage finished");
            checks.extend(stage_checks);

            if stage.kind() == StageKind::HardwareDetected && failed {
                info!("No usable GPU, skipping remaining stages");
                break;
            }
        }

        let signals = ctx.reboot_signals();
        let pci_address = ctx.target.as_ref().map(|gpu| gpu.pci_address.clone());
        let report = VerificationReport::new(ctx.request.vendor.clone(), pci_address, checks, signals);
        info!(
            vendor = %report.vendor,
            overall = %report.overall,
            passed = report.passed,
            total = report.total,
            "Verification finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hardware_pass() -> VerificationCheck {
        VerificationCheck::pass(StageKind::HardwareDetected, true, "GPU", "0000:c3:00.0")
    }

    fn driver_fail() -> VerificationCheck {
        VerificationCheck::fail(StageKind::DriverLoaded, true, "amdgpu", FailureKind::DriverNotLoaded, "not loaded")
    }

    #[test]
    fn hardware_failure_is_terminal() {
        let checks = vec![VerificationCheck::fail(
            StageKind::HardwareDetected,
            true,
            "GPU",
            FailureKind::HardwareNotFound,
            "no AMD GPU",
        )];
        let signals = RebootSignals { install_artifacts_present: true, boot_params_pending: true };
        assert_eq!(derive_overall(&checks, signals), OverallStatus::Fail);
        assert_eq!(derive_overall(&[], RebootSignals::default()), OverallStatus::Fail);
    }

    #[test]
    fn optional_failures_do_not_matter() {
        let checks = vec![
            hardware_pass(),
            VerificationCheck::fail(StageKind::OptionalTooling, false, "nvtop", FailureKind::ToolMissing, "not installed"),
        ];
        assert_eq!(derive_overall(&checks, RebootSignals::default()), OverallStatus::Pass);
    }

    #[test]
    fn driver_failure_depends_on_install_artifacts() {
        let checks = vec![hardware_pass(), driver_fail()];
        let installed = RebootSignals { install_artifacts_present: true, boot_params_pending: false };
        assert_eq!(derive_overall(&checks, installed), OverallStatus::RebootRequired);
        assert_eq!(derive_overall(&checks, RebootSignals::default()), OverallStatus::Fail);
    }

    #[test]
    fn pending_boot_params_explain_failures() {
        let checks = vec![
            hardware_pass(),
            VerificationCheck::fail(StageKind::ComputeFunctional, true, "rocm-smi", FailureKind::ToolNonFunctional, "no VRAM"),
        ];
        let pending = RebootSignals { install_artifacts_present: false, boot_params_pending: true };
        assert_eq!(derive_overall(&checks, pending), OverallStatus::RebootRequired);
    }

    #[test]
    fn pending_boot_params_alone_do_not_block_a_pass() {
        let pending = RebootSignals { install_artifacts_present: false, boot_params_pending: true };
        assert_eq!(derive_overall(&[hardware_pass()], pending), OverallStatus::Pass);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(OverallStatus::Pass.exit_code(), 0);
        assert_eq!(OverallStatus::RebootRequired.exit_code(), 3);
        assert_eq!(OverallStatus::Fail.exit_code(), 1);
    }

    #[test]
    fn report_counts_and_stage_folding() {
        let checks = vec![
            hardware_pass(),
            VerificationCheck::pass(StageKind::DeviceNodesPresent, true, "/dev/dri/card1", "read/write"),
            VerificationCheck::fail(StageKind::DeviceNodesPresent, true, "/dev/kfd", FailureKind::DeviceNodeMissing, "missing"),
        ];
        let report = VerificationReport::new(GpuVendor::AMD, Some("0000:c3:00.0".into()), checks, RebootSignals::default());
        assert_eq!(report.passed, 2);
        assert_eq!(report.total, 3);
        assert_eq!(report.stage_outcome(StageKind::DeviceNodesPresent), Some(CheckOutcome::Fail));
        assert_eq!(report.stage_outcome(StageKind::HardwareDetected), Some(CheckOutcome::Pass));
        assert_eq!(report.stage_outcome(StageKind::SandboxReachable), None);
        assert_eq!(report.first_blocking().map(|c| c.name.as_str()), Some("/dev/kfd"));
        assert_eq!(report.exit_code(), 1);
    }
}
