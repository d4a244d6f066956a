mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::TestHost;
use exliar_gpu::core::bootloader::{detect_backend, BootBackendKind, BootParamState, BootParameterManager};
use exliar_gpu::core::host::HostFacts;
use exliar_gpu::core::process::{CommandOutput, ScriptedResponse, ScriptedRunner, DEFAULT_REFRESH_TIMEOUT, DEFAULT_TIMEOUT};
use exliar_gpu::error::Error;

const DEFAULT_GRUB: &str = "\
# If you change this file, run 'update-grub' afterwards to update
GRUB_DEFAULT=0
GRUB_TIMEOUT=5
GRUB_DISTRIBUTOR=\"Proxmox VE\"
GRUB_CMDLINE_LINUX_DEFAULT=\"quiet\"
GRUB_CMDLINE_LINUX=\"\"
";

fn desired() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("amdgpu.gttsize".to_string(), "126976".to_string()),
        ("ttm.pages_limit".to_string(), "32505856".to_string()),
    ])
}

fn grub_host() -> TestHost {
    let host = TestHost::new();
    host.file("/etc/default/grub", DEFAULT_GRUB).file("/usr/sbin/update-grub", "");
    host
}

fn cmdline_host(line: &str) -> TestHost {
    let host = TestHost::new();
    host.file("/etc/kernel/proxmox-boot-uuids", "8E1D-55A2\n")
        .file("/etc/kernel/cmdline", &format!("{}\n", line))
        // GRUB defaults exist on these hosts too but are not used
        .file("/etc/default/grub", DEFAULT_GRUB);
    host
}

fn refresh_ok() -> ScriptedRunner {
    ScriptedRunner::new()
        .stdout("update-grub", &[], "Generating grub configuration file ...\ndone\n")
        .stdout("proxmox-boot-tool", &["refresh"], "Running hook script 'proxmox-auto-removal'..\n")
}

#[test]
fn backend_selection_by_marker() {
    let host = cmdline_host("root=ZFS=rpool/ROOT/pve-1 boot=zfs");
    assert_eq!(detect_backend(&host.facts()).unwrap().kind(), BootBackendKind::KernelCmdlineFile);

    let host = grub_host();
    assert_eq!(detect_backend(&host.facts()).unwrap().kind(), BootBackendKind::GrubDefault);

    let host = TestHost::new();
    assert!(matches!(detect_backend(&host.facts()), Err(Error::BootBackendNotFound(_))));
}

#[test]
fn grub_apply_is_idempotent() {
    let host = grub_host();
    let facts = host.facts();
    let runner = refresh_ok();
    let manager = BootParameterManager::detect(&facts, &runner).unwrap();

    let first = manager.apply(&desired()).unwrap();
    assert!(first.changed);
    assert!(first.reboot_required);
    let written = host.read("/etc/default/grub");
    assert!(written.contains("GRUB_CMDLINE_LINUX_DEFAULT=\"quiet amdgpu.gttsize=126976 ttm.pages_limit=32505856\"\n"));
    assert!(written.contains("GRUB_CMDLINE_LINUX=\"\"\n"));
    assert_eq!(runner.calls(), vec!["update-grub"]);
    assert_eq!(host.files_starting_with("/etc/default", "grub.backup_").len(), 1);

    let second = manager.apply(&desired()).unwrap();
    assert!(!second.changed);
    // Still not active in the running kernel
    assert!(second.reboot_required);
    assert_eq!(host.read("/etc/default/grub"), written);
    assert_eq!(runner.calls().len(), 1);
}

#[test]
fn no_reboot_once_the_kernel_runs_with_the_parameters() {
    let host = grub_host();
    host.file("/etc/default/grub", &DEFAULT_GRUB.replace("\"quiet\"", "\"quiet amdgpu.gttsize=126976 ttm.pages_limit=32505856\""));
    let mut facts = host.facts();
    facts.kernel_cmdline = "BOOT_IMAGE=/boot/vmlinuz-6.14.8-2-pve root=/dev/mapper/pve-root ro quiet amdgpu.gttsize=126976 ttm.pages_limit=32505856".into();
    let runner = refresh_ok();
    let manager = BootParameterManager::detect(&facts, &runner).unwrap();

    let outcome = manager.apply(&desired()).unwrap();
    assert!(!outcome.changed);
    assert!(!outcome.reboot_required);
    assert_eq!(manager.status(&desired()).unwrap(), BootParamState::Current);
    assert!(runner.calls().is_empty());
}

#[test]
fn stale_and_duplicate_values_are_replaced_in_place() {
    let host = cmdline_host("root=ZFS=rpool/ROOT/pve-1 amdgpu.gttsize=8192 boot=zfs amdgpu.gttsize=126976 quiet");
    let facts = host.facts();
    let runner = refresh_ok();
    let manager = BootParameterManager::detect(&facts, &runner).unwrap();
    assert_eq!(manager.backend(), BootBackendKind::KernelCmdlineFile);

    let outcome = manager.apply(&desired()).unwrap();
    assert!(outcome.changed);
    assert_eq!(
        host.read("/etc/kernel/cmdline"),
        "root=ZFS=rpool/ROOT/pve-1 boot=zfs quiet amdgpu.gttsize=126976 ttm.pages_limit=32505856\n"
    );
    assert_eq!(runner.calls(), vec!["proxmox-boot-tool refresh"]);
    // GRUB defaults are untouched on this backend
    assert_eq!(host.read("/etc/default/grub"), DEFAULT_GRUB);

    let current = manager.current().unwrap();
    assert_eq!(current.params.get("amdgpu.gttsize").map(String::as_str), Some("126976"));
    assert_eq!(current.params.get("quiet").map(String::as_str), Some(""));
}

#[test]
fn status_walks_unconfigured_stale_current() {
    let host = cmdline_host("root=ZFS=rpool/ROOT/pve-1 boot=zfs");
    let mut facts = host.facts();
    facts.kernel_cmdline = "initrd=\\EFI\\proxmox\\initrd.img root=ZFS=rpool/ROOT/pve-1 boot=zfs".into();
    let runner = refresh_ok();

    let manager = BootParameterManager::detect(&facts, &runner).unwrap();
    assert_eq!(manager.status(&desired()).unwrap(), BootParamState::Unconfigured);
    manager.apply(&desired()).unwrap();
    assert_eq!(manager.status(&desired()).unwrap(), BootParamState::Stale);
    assert!(manager.pending(&desired()));

    // After the reboot the live command line carries the parameters
    let mut rebooted: HostFacts = facts.clone();
    rebooted.kernel_cmdline.push_str(" amdgpu.gttsize=126976 ttm.pages_limit=32505856");
    let manager = BootParameterManager::detect(&rebooted, &runner).unwrap();
    assert_eq!(manager.status(&desired()).unwrap(), BootParamState::Current);
    assert!(!manager.pending(&desired()));
}

#[test]
fn dry_run_writes_nothing() {
    let host = grub_host();
    let facts = host.facts();
    let runner = refresh_ok();
    let manager = BootParameterManager::detect(&facts, &runner).unwrap().dry_run(true);

    let outcome = manager.apply(&desired()).unwrap();
    assert!(outcome.changed);
    assert_eq!(host.read("/etc/default/grub"), DEFAULT_GRUB);
    assert!(runner.calls().is_empty());
    assert!(host.files_starting_with("/etc/default", "grub.backup_").is_empty());
}

#[test]
fn remove_strips_keys_and_is_a_noop_when_absent() {
    let host = cmdline_host("root=ZFS=rpool/ROOT/pve-1 amdgpu.gttsize=126976 boot=zfs ttm.pages_limit=32505856");
    let facts = host.facts();
    let runner = refresh_ok();
    let manager = BootParameterManager::detect(&facts, &runner).unwrap();

    let outcome = manager.remove(&["amdgpu.gttsize", "ttm.pages_limit"]).unwrap();
    assert!(outcome.changed);
    assert_eq!(host.read("/etc/kernel/cmdline"), "root=ZFS=rpool/ROOT/pve-1 boot=zfs\n");

    let again = manager.remove(&["amdgpu.gttsize", "ttm.pages_limit"]).unwrap();
    assert!(!again.changed);
    assert_eq!(runner.calls().len(), 1);
}

#[test]
fn refresh_failure_is_reported() {
    let host = cmdline_host("root=ZFS=rpool/ROOT/pve-1 boot=zfs");
    let facts = host.facts();
    let runner = ScriptedRunner::new().respond(
        "proxmox-boot-tool",
        &["refresh"],
        ScriptedResponse::Output(CommandOutput::failed(2, "E: no ESP configured")),
    );
    let manager = BootParameterManager::detect(&facts, &runner).unwrap();
    assert!(matches!(manager.apply(&desired()), Err(Error::BootRefreshFailed(_))));
    // The previous line is back so a later apply redoes the whole change
    assert_eq!(host.read("/etc/kernel/cmdline"), "root=ZFS=rpool/ROOT/pve-1 boot=zfs\n");
}

#[test]
fn apply_after_failed_refresh_refreshes_again() {
    let host = cmdline_host("root=ZFS=rpool/ROOT/pve-1 boot=zfs");
    let facts = host.facts();

    let failing = ScriptedRunner::new().respond("proxmox-boot-tool", &["refresh"], ScriptedResponse::Timeout);
    let manager = BootParameterManager::detect(&facts, &failing).unwrap();
    assert!(matches!(manager.apply(&desired()), Err(Error::BootRefreshFailed(_))));
    assert_eq!(host.read("/etc/kernel/cmdline"), "root=ZFS=rpool/ROOT/pve-1 boot=zfs\n");

    let runner = refresh_ok();
    let manager = BootParameterManager::detect(&facts, &runner).unwrap();
    let outcome = manager.apply(&desired()).unwrap();
    assert!(outcome.changed);
    assert_eq!(runner.calls(), vec!["proxmox-boot-tool refresh"]);
    assert_eq!(
        host.read("/etc/kernel/cmdline"),
        "root=ZFS=rpool/ROOT/pve-1 boot=zfs amdgpu.gttsize=126976 ttm.pages_limit=32505856\n"
    );
}

#[test]
fn refresh_gets_its_own_timeout() {
    let host = grub_host();
    let facts = host.facts();

    let runner = refresh_ok();
    BootParameterManager::detect(&facts, &runner).unwrap().apply(&desired()).unwrap();
    let specs = runner.specs();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].timeout, DEFAULT_REFRESH_TIMEOUT);
    assert!(DEFAULT_REFRESH_TIMEOUT > DEFAULT_TIMEOUT);

    let host = cmdline_host("root=ZFS=rpool/ROOT/pve-1 boot=zfs");
    let facts = host.facts();
    let runner = refresh_ok();
    BootParameterManager::detect(&facts, &runner)
        .unwrap()
        .refresh_timeout(Duration::from_secs(1800))
        .apply(&desired())
        .unwrap();
    assert_eq!(runner.specs()[0].timeout, Duration::from_secs(1800));
}

#[test]
fn grub_without_update_command_cannot_refresh() {
    let host = TestHost::new();
    host.file("/etc/default/grub", DEFAULT_GRUB);
    let facts = host.facts();
    let runner = refresh_ok();
    let manager = BootParameterManager::detect(&facts, &runner).unwrap();
    assert!(matches!(manager.apply(&desired()), Err(Error::BootRefreshFailed(_))));
    assert_eq!(host.read("/etc/default/grub"), DEFAULT_GRUB);
}
