use std::collections::BTreeSet;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::Parser;
use serde::Serialize;
use tracing::{error, info, warn};

use exliar_gpu::config::{BootAction, Cli, Command, Config};
use exliar_gpu::core::bootloader::{BootParamState, BootParameterManager};
use exliar_gpu::core::host::{HostFacts, HostPlatform};
use exliar_gpu::core::process::SystemRunner;
use exliar_gpu::gpu::detection::{scan, scan_all, select_gpu};
use exliar_gpu::gpu::{GpuDevice, GpuVendor};
use exliar_gpu::passthrough::lxc::SandboxConfigFile;
use exliar_gpu::passthrough::{check_completeness, synthesize, PassthroughConfig, SynthesisContext};
use exliar_gpu::ui::{self, report};
use exliar_gpu::verify::{Pipeline, PipelineContext, VerifyRequest};

/// Exit code for "succeeded, reboot to activate"
const EXIT_REBOOT_REQUIRED: u8 = 3;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose { "exliar_gpu=debug" } else { "exliar_gpu=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?
        .merge_cli(cli);
    info!(version = exliar_gpu::VERSION, root = %config.root.display(), dry_run = config.dry_run, "exliar-gpu starting");

    let runner = SystemRunner::new();
    let mut host = HostFacts::detect(&config.root, &runner);
    if let Some(version) = &config.pve_version {
        host.platform = Some(HostPlatform::proxmox(Some(version.clone())));
    }

    match &cli.command {
        Command::Scan { all } => {
            let devices = if *all {
                scan_all(&host, &runner, config.probe_timeout())
            } else {
                scan(&host, &runner, config.probe_timeout())
            };
            if cli.json {
                print_json(&devices)?;
            } else {
                print!("{}", report::render_inventory(&devices, &ui::detect_theme()));
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Synthesize { vendor, gpu } => {
            let passthrough = synthesize_for(&host, &runner, &config, vendor.as_ref(), gpu.as_deref())?;
            if cli.json {
                print_json(&passthrough)?;
            } else {
                print!("{}", passthrough.render());
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Apply { ctid, vendor, gpu } => {
            let passthrough = synthesize_for(&host, &runner, &config, vendor.as_ref(), gpu.as_deref())?;
            let file = SandboxConfigFile::new(&host, *ctid);
            let changed = file
                .apply(&passthrough, config.dry_run)
                .with_context(|| format!("configuring container {}", ctid))?;
            if changed {
                info!(ctid, "Passthrough configured; restart the container to apply it");
            } else {
                info!(ctid, "Container already configured");
            }
            if cli.json {
                print_json(&serde_json::json!({ "ctid": ctid, "changed": changed, "config": passthrough }))?;
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Unapply { ctid } => {
            let changed = SandboxConfigFile::new(&host, *ctid)
                .remove(config.dry_run)
                .with_context(|| format!("removing passthrough from container {}", ctid))?;
            info!(ctid, changed, "Passthrough block removed");
            if cli.json {
                print_json(&serde_json::json!({ "ctid": ctid, "changed": changed }))?;
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Boot { action } => run_boot(cli, &config, &host, &runner, *action),

        Command::Verify { vendor, gpu, ctid } => {
            let vendor = match vendor {
                Some(vendor) => vendor.clone(),
                None => infer_vendor(&scan(&host, &runner, config.probe_timeout()))?,
            };
            let request = VerifyRequest {
                vendor,
                gpu: gpu.clone(),
                ctid: *ctid,
                boot_params: config.boot_params.clone(),
            };
            let synthesis = SynthesisContext::from_host(&host, config.overrides.clone(), config.mount_source, &config.majors);
            let mut ctx = PipelineContext::new(&host, &runner, request, synthesis, config.probe_timeout())?;
            let verification = Pipeline::standard().run(&mut ctx);

            if cli.json {
                print_json(&verification)?;
            } else {
                print!("{}", report::render_report(&verification, &ui::detect_theme()));
            }
            Ok(ExitCode::from(&verification.overall))
        }
    }
}

fn run_boot(
    cli: &Cli,
    config: &Config,
    host: &HostFacts,
    runner: &SystemRunner,
    action: BootAction,
) -> anyhow::Result<ExitCode> {
    if config.boot_params.is_empty() {
        bail!("no boot_params configured in {}", cli.config.display());
    }
    let manager = BootParameterManager::detect(host, runner)?
        .dry_run(config.dry_run)
        .refresh_timeout(config.boot_refresh_timeout());
    info!(backend = %manager.backend(), "Boot backend selected");

    match action {
        BootAction::Apply | BootAction::Remove => {
            let outcome = if action == BootAction::Apply {
                manager.apply(&config.boot_params)?
            } else {
                let keys: Vec<&str> = config.boot_params.keys().map(String::as_str).collect();
                manager.remove(&keys)?
            };
            if cli.json {
                print_json(&outcome)?;
            } else {
                println!("changed: {}, reboot required: {}", outcome.changed, outcome.reboot_required);
            }
            if outcome.reboot_required {
                warn!("Reboot the host to activate the new kernel parameters");
                Ok(ExitCode::from(EXIT_REBOOT_REQUIRED))
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        BootAction::Status => {
            let state = manager.status(&config.boot_params)?;
            if cli.json {
                print_json(&serde_json::json!({ "backend": manager.backend(), "state": state, "current": manager.current()? }))?;
            } else {
                println!("{}: {:?}", manager.backend(), state);
            }
            Ok(match state {
                BootParamState::Current => ExitCode::SUCCESS,
                BootParamState::Stale => ExitCode::from(EXIT_REBOOT_REQUIRED),
                BootParamState::Unconfigured => ExitCode::FAILURE,
            })
        }
    }
}

/// Selects a GPU and synthesizes its passthrough block, warning about gaps
fn synthesize_for(
    host: &HostFacts,
    runner: &SystemRunner,
    config: &Config,
    vendor: Option<&GpuVendor>,
    gpu: Option<&str>,
) -> anyhow::Result<PassthroughConfig> {
    let devices = scan(host, runner, config.probe_timeout());
    let vendor = match vendor {
        Some(vendor) => vendor.clone(),
        None => infer_vendor(&devices)?,
    };
    let device = select_gpu(&devices, &vendor, gpu)?;

    let ctx = SynthesisContext::from_host(host, config.overrides.clone(), config.mount_source, &config.majors);
    let passthrough = synthesize(device, &ctx).with_context(|| format!("synthesizing passthrough for {}", device.pci_address))?;
    for missing in check_completeness(&passthrough, &ctx)? {
        warn!(pci = %device.pci_address, "{}", missing);
    }
    Ok(passthrough)
}

/// The vendor of the detected GPUs, when there is exactly one
fn infer_vendor(devices: &[GpuDevice]) -> anyhow::Result<GpuVendor> {
    let vendors: BTreeSet<&GpuVendor> = devices.iter().map(|gpu| &gpu.vendor).collect();
    match vendors.into_iter().collect::<Vec<_>>().as_slice() {
        [] => bail!("no supported GPU detected"),
        [only] => Ok((*only).clone()),
        _ => bail!("GPUs from several vendors found; choose one with --vendor"),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
