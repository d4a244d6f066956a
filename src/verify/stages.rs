// The standard verification stages
//
// Each stage reads the host through PipelineContext and records checks;
// vendor differences come from the VendorProfile, never from matching on
// the vendor here.

use std::fs::OpenOptions;
use std::io;

use tracing::{debug, warn};

use crate::core::process::CommandSpec;
use crate::gpu::detection::{scan, select_gpu};
use crate::gpu::vendor::nvidia::is_indexed_node;
use crate::gpu::vendor::ToolProbe;
use crate::passthrough::lxc::{ContainerCli, NodeAccess};
use crate::passthrough::synthesize;
use crate::verify::{FailureKind, PipelineContext, Stage, StageKind, VerificationCheck};

pub struct HardwareDetected;

impl Stage for HardwareDetected {
    fn kind(&self) -> StageKind {
        StageKind::HardwareDetected
    }

    fn required(&self, _ctx: &PipelineContext) -> bool {
        true
    }

    fn run(&self, ctx: &mut PipelineContext, required: bool) -> Vec<VerificationCheck> {
        let kind = self.kind();
        let name = format!("{} GPU", ctx.request.vendor);
        ctx.devices = scan(ctx.host, ctx.runner, ctx.timeout);

        let selected = select_gpu(&ctx.devices, &ctx.request.vendor, ctx.request.gpu.as_deref()).cloned();
        match selected {
            Ok(gpu) => {
                let detail = format!("{} at {}", gpu.display_name, gpu.pci_address);
                ctx.target = Some(gpu);
                vec![VerificationCheck::pass(kind, required, name, detail)]
            }
            Err(e) => vec![VerificationCheck::fail(kind, required, name, FailureKind::from(&e), e.to_string())
                .with_hint("check `lspci -D -vmm` and, with several GPUs, pass --gpu <pci address>")],
        }
    }
}

pub struct DriverLoaded;

impl Stage for DriverLoaded {
    fn kind(&self) -> StageKind {
        StageKind::DriverLoaded
    }

    fn required(&self, _ctx: &PipelineContext) -> bool {
        true
    }

    fn run(&self, ctx: &mut PipelineContext, required: bool) -> Vec<VerificationCheck> {
        let module = ctx.profile.kernel_module;
        let check = if ctx.host.module_loaded(module) {
            let bound = ctx.target.as_ref().and_then(|gpu| gpu.driver.clone());
            let detail = match bound {
                Some(driver) => format!("{} loaded, device bound to {}", module, driver),
                None => format!("{} loaded", module),
            };
            VerificationCheck::pass(self.kind(), required, module, detail)
        } else {
            VerificationCheck::fail(
                self.kind(),
                required,
                module,
                FailureKind::DriverNotLoaded,
                format!("kernel module {} is not loaded", module),
            )
            .with_hint(ctx.profile.driver_hint)
        };
        vec![check]
    }
}

pub struct DeviceNodesPresent;

impl DeviceNodesPresent {
    /// Nodes the GPU needs on the host, as absolute host paths
    fn expected_nodes(ctx: &PipelineContext) -> Vec<String> {
        let mut nodes = Vec::new();
        if let Some(paths) = ctx.target.as_ref().and_then(|gpu| gpu.paths.as_ref()) {
            nodes.push(paths.card_node.display().to_string());
            if let Some(render) = &paths.render_node {
                nodes.push(render.display().to_string());
            }
        }
        nodes.extend(ctx.profile.compute_nodes.iter().map(|n| n.to_string()));
        if let Some(prefix) = ctx.profile.indexed_node_prefix {
            nodes.extend(
                ctx.synthesis
                    .dev_entries
                    .iter()
                    .filter(|e| !e.is_dir && is_indexed_node(&e.name, prefix))
                    .map(|e| format!("/dev/{}", e.name)),
            );
        }
        nodes
    }

    fn check_node(ctx: &PipelineContext, kind: StageKind, required: bool, node: &str) -> VerificationCheck {
        let is_compute = node == ctx.profile.compute_interface();
        let path = ctx.host.path(node);

        if !path.exists() {
            let detail = if is_compute {
                format!("compute interface not found ({})", node)
            } else {
                format!("{} does not exist", node)
            };
            let hint = if is_compute { ctx.profile.compute_hint } else { ctx.profile.driver_hint };
            return VerificationCheck::fail(kind, required, node, FailureKind::DeviceNodeMissing, detail).with_hint(hint);
        }

        match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(_) => VerificationCheck::pass(kind, required, node, "readable and writable"),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => VerificationCheck::fail(
                kind,
                required,
                node,
                FailureKind::PermissionDenied,
                format!("{} exists but cannot be opened read/write", node),
            )
            .with_hint("add the operating user to the render and video groups, or run as root"),
            Err(e) => VerificationCheck::fail(
                kind,
                required,
                node,
                FailureKind::DeviceNodeMissing,
                format!("{} cannot be opened: {}", node, e),
            )
            .with_hint(ctx.profile.driver_hint),
        }
    }
}

impl Stage for DeviceNodesPresent {
    fn kind(&self) -> StageKind {
        StageKind::DeviceNodesPresent
    }

    fn required(&self, _ctx: &PipelineContext) -> bool {
        true
    }

    fn run(&self, ctx: &mut PipelineContext, required: bool) -> Vec<VerificationCheck> {
        let kind = self.kind();
        let mut checks = Vec::new();

        if let Some(gpu) = &ctx.target {
            if ctx.profile.requires_drm_nodes && gpu.paths.is_none() {
                checks.push(
                    VerificationCheck::fail(
                        kind,
                        required,
                        "/dev/dri/by-path",
                        FailureKind::DeviceNodeUnresolvable,
                        format!("no by-path entry for {}", gpu.pci_address),
                    )
                    .with_hint(ctx.profile.driver_hint),
                );
            }
        }

        if let Some(prefix) = ctx.profile.indexed_node_prefix {
            let any_indexed = ctx.synthesis.dev_entries.iter().any(|e| !e.is_dir && is_indexed_node(&e.name, prefix));
            if !any_indexed {
                checks.push(
                    VerificationCheck::fail(
                        kind,
                        required,
                        format!("/dev/{}N", prefix),
                        FailureKind::DeviceNodeMissing,
                        format!("no /dev/{}<N> device node", prefix),
                    )
                    .with_hint(ctx.profile.driver_hint),
                );
            }
        }

        for node in Self::expected_nodes(ctx) {
            checks.push(Self::check_node(ctx, kind, required, &node));
        }
        checks
    }
}

/// Runs a vendor tool and applies its parser
fn run_probe(
    ctx: &PipelineContext,
    kind: StageKind,
    required: bool,
    probe: &ToolProbe,
    describe: fn(u64) -> String,
    hint: &str,
) -> VerificationCheck {
    let spec = CommandSpec::new(probe.program, probe.args).with_timeout(ctx.timeout);
    let name = spec.display();

    let output = match ctx.runner.run(&spec) {
        Ok(output) => output,
        Err(e) => {
            warn!(command = %name, error = %e, "Probe failed");
            let hint = if FailureKind::from(&e) == FailureKind::ToolMissing { ctx.profile.tool_hint } else { hint };
            return VerificationCheck::fail(kind, required, name, FailureKind::from(&e), e.to_string()).with_hint(hint);
        }
    };

    // Exit status alone is not trusted; the parser must find a success marker
    match (probe.parse)(&output.stdout) {
        Some(value) if output.success() => VerificationCheck::pass(kind, required, name, describe(value)),
        parsed => {
            debug!(command = %name, status = ?output.status, parsed = ?parsed, "Probe output rejected");
            let detail = match output.status {
                Some(0) => "ran but reported no usable GPU".to_string(),
                status => format!("exited with {:?}: {}", status, output.stderr.trim()),
            };
            VerificationCheck::fail(kind, required, name, FailureKind::ToolNonFunctional, detail).with_hint(hint)
        }
    }
}

pub struct VendorToolFunctional;

impl Stage for VendorToolFunctional {
    fn kind(&self) -> StageKind {
        StageKind::VendorToolFunctional
    }

    fn required(&self, _ctx: &PipelineContext) -> bool {
        true
    }

    fn run(&self, ctx: &mut PipelineContext, required: bool) -> Vec<VerificationCheck> {
        let probe = ctx.profile.agent_probe;
        vec![run_probe(ctx, self.kind(), required, &probe, |n| format!("{} GPU agent(s)", n), ctx.profile.tool_hint)]
    }
}

pub struct ComputeFunctional;

impl Stage for ComputeFunctional {
    fn kind(&self) -> StageKind {
        StageKind::ComputeFunctional
    }

    fn required(&self, _ctx: &PipelineContext) -> bool {
        true
    }

    fn run(&self, ctx: &mut PipelineContext, required: bool) -> Vec<VerificationCheck> {
        let probe = ctx.profile.memory_probe;
        vec![run_probe(ctx, self.kind(), required, &probe, describe_memory, ctx.profile.compute_hint)]
    }
}

fn describe_memory(bytes: u64) -> String {
    format!("{:.1} GiB device memory", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
}

pub struct SandboxReachable;

impl Stage for SandboxReachable {
    fn kind(&self) -> StageKind {
        StageKind::SandboxReachable
    }

    fn required(&self, ctx: &PipelineContext) -> bool {
        ctx.request.ctid.is_some()
    }

    fn run(&self, ctx: &mut PipelineContext, required: bool) -> Vec<VerificationCheck> {
        let kind = self.kind();
        let Some(ctid) = ctx.request.ctid else {
            return vec![VerificationCheck::unknown(kind, "container", "no container id given")];
        };
        let name = format!("container {}", ctid);
        let cli = ContainerCli::new(ctx.runner, ctx.timeout);

        match cli.is_running(ctid) {
            Ok(Some(true)) => {}
            Ok(running) => {
                let detail = if running.is_some() { "container is not running" } else { "pct reported no status" };
                return vec![VerificationCheck::fail(kind, required, name, FailureKind::SandboxNotRunning, detail)
                    .with_hint(format!("start it with `pct start {}`", ctid))];
            }
            Err(e) => {
                return vec![VerificationCheck::fail(kind, required, name, FailureKind::from(&e), e.to_string())];
            }
        }

        let Some(gpu) = ctx.target.as_ref() else {
            return vec![VerificationCheck::unknown(kind, name, "no GPU selected")];
        };
        let nodes = match synthesize(gpu, &ctx.synthesis) {
            Ok(config) => config.container_nodes(),
            Err(e) => {
                return vec![VerificationCheck::fail(kind, required, name, FailureKind::from(&e), e.to_string())];
            }
        };

        let results = match cli.probe_nodes(ctid, &nodes) {
            Ok(results) => results,
            Err(e) => {
                return vec![VerificationCheck::fail(kind, required, name, FailureKind::from(&e), e.to_string())];
            }
        };

        let hint = format!("run `exliar-gpu apply --ctid {}` and restart the container", ctid);
        nodes
            .iter()
            .map(|node| {
                let check_name = format!("{}:{}", ctid, node);
                match results.iter().find(|(path, _)| path == node).map(|(_, access)| *access) {
                    Some(NodeAccess::Ok) => VerificationCheck::pass(kind, required, check_name, "readable and writable in container"),
                    Some(NodeAccess::Denied) => VerificationCheck::fail(
                        kind,
                        required,
                        check_name,
                        FailureKind::PermissionDenied,
                        format!("{} is not readable and writable in container {}", node, ctid),
                    )
                    .with_hint(hint.clone()),
                    Some(NodeAccess::Missing) | None => VerificationCheck::fail(
                        kind,
                        required,
                        check_name,
                        FailureKind::DeviceNodeMissing,
                        format!("{} is missing in container {}", node, ctid),
                    )
                    .with_hint(hint.clone()),
                }
            })
            .collect()
    }
}

pub struct OptionalTooling;

impl Stage for OptionalTooling {
    fn kind(&self) -> StageKind {
        StageKind::OptionalTooling
    }

    fn required(&self, _ctx: &PipelineContext) -> bool {
        false
    }

    fn run(&self, ctx: &mut PipelineContext, required: bool) -> Vec<VerificationCheck> {
        ctx.profile
            .monitoring_tools
            .iter()
            .map(|tool| match ctx.host.find_tool(tool) {
                Some(path) => VerificationCheck::pass(self.kind(), required, *tool, path.display().to_string()),
                None => VerificationCheck::fail(self.kind(), required, *tool, FailureKind::ToolMissing, "not installed"),
            })
            .collect()
    }
}
