// Synthetic host roots for integration tests
#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use exliar_gpu::core::host::HostFacts;
use exliar_gpu::core::process::ScriptedRunner;
use tempfile::TempDir;

pub const AMD_PCI: &str = "0000:c3:00.0";
pub const NVIDIA_PCI: &str = "0000:01:00.0";

pub const LSPCI_AMD: &str = "\
Slot:\t0000:c1:00.0
Class:\tNon-Volatile memory controller
Vendor:\tSamsung Electronics Co Ltd
Device:\tNVMe SSD Controller PM9A1

Slot:\t0000:c3:00.0
Class:\tDisplay controller
Vendor:\tAdvanced Micro Devices, Inc. [AMD/ATI]
Device:\tStrix Halo [Radeon Graphics / Radeon 8050S / 8060S]
";

pub const LSPCI_NVIDIA: &str = "\
Slot:\t0000:00:02.0
Class:\tVGA compatible controller
Vendor:\tIntel Corporation
Device:\tAlder Lake-S GT1 [UHD Graphics 770]

Slot:\t0000:01:00.0
Class:\tVGA compatible controller
Vendor:\tNVIDIA Corporation
Device:\tGA102 [GeForce RTX 3090]
";

pub const PROC_DEVICES: &str = "\
Character devices:
  1 mem
  4 tty
195 nvidia-frontend
226 drm
237 kfd
508 nvidia-uvm
509 nvidia-caps

Block devices:
  8 sd
259 blkext
";

pub const ROCMINFO_GPU: &str = "\
*******
Agent 1
*******
  Name:                    AMD RYZEN AI MAX+ 395 w/ Radeon 8060S
  Device Type:             CPU
*******
Agent 2
*******
  Name:                    gfx1151
  Device Type:             GPU
";

pub const ROCM_SMI_VRAM: &str = "\
============================ ROCm System Management Interface ============================
================================== Memory Usage (Bytes) ==================================
GPU[0]\t\t: VRAM Total Memory (B): 103079215104
GPU[0]\t\t: VRAM Total Used Memory (B): 1310720
==========================================================================================
";

/// A temporary directory laid out like a host filesystem
pub struct TestHost {
    dir: TempDir,
}

impl TestHost {
    pub fn new() -> Self {
        Self { dir: tempfile::tempdir().expect("tempdir") }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, host_path: &str) -> PathBuf {
        self.root().join(host_path.trim_start_matches('/'))
    }

    pub fn file(&self, host_path: &str, content: &str) -> &Self {
        let path = self.path(host_path);
        fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
        fs::write(path, content).expect("write file");
        self
    }

    pub fn dir(&self, host_path: &str) -> &Self {
        fs::create_dir_all(self.path(host_path)).expect("create dir");
        self
    }

    pub fn symlink(&self, host_path: &str, target: &str) -> &Self {
        let path = self.path(host_path);
        fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
        symlink(target, path).expect("symlink");
        self
    }

    pub fn read(&self, host_path: &str) -> String {
        fs::read_to_string(self.path(host_path)).expect("read file")
    }

    /// Host facts for this root, with the standard tool search path
    pub fn facts(&self) -> HostFacts {
        let mut facts = HostFacts::detect(self.root(), &ScriptedRunner::new());
        facts.path_dirs = HostFacts::empty(self.root()).path_dirs;
        facts
    }

    /// Files in `dir` whose name starts with `prefix`
    pub fn files_starting_with(&self, dir: &str, prefix: &str) -> Vec<String> {
        fs::read_dir(self.path(dir))
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(prefix))
            .collect()
    }
}

/// One AMD GPU at 0000:c3:00.0 whose by-path entries resolve to card1 and
/// renderD128, next to an unrelated card0 of another device. /dev/kfd is
/// created only with `compute`.
pub fn amd_host(compute: bool) -> TestHost {
    let host = TestHost::new();
    host.file("/dev/dri/card0", "")
        .file("/dev/dri/card1", "")
        .file("/dev/dri/renderD128", "")
        .symlink("/dev/dri/by-path/pci-0000:c3:00.0-card", "../card1")
        .symlink("/dev/dri/by-path/pci-0000:c3:00.0-render", "../renderD128")
        .symlink("/dev/dri/by-path/pci-0000:c4:00.0-card", "../card0")
        .file("/proc/devices", PROC_DEVICES)
        .file("/proc/modules", "amdgpu 15192064 0 - Live 0x0\ndrm_buddy 20480 1 amdgpu, Live 0x0\n")
        .file("/proc/cmdline", "BOOT_IMAGE=/boot/vmlinuz-6.14.8-2-pve root=/dev/mapper/pve-root ro quiet\n")
        .file("/proc/sys/kernel/osrelease", "6.14.8-2-pve\n");
    if compute {
        host.file("/dev/kfd", "");
    }
    host
}

/// One NVIDIA GPU with the full set of driver nodes
pub fn nvidia_host() -> TestHost {
    let host = TestHost::new();
    host.file("/dev/nvidia0", "")
        .file("/dev/nvidiactl", "")
        .file("/dev/nvidia-uvm", "")
        .file("/dev/nvidia-uvm-tools", "")
        .dir("/dev/nvidia-caps")
        .file("/dev/nvidia-caps/nvidia-cap1", "")
        .file("/proc/devices", PROC_DEVICES)
        .file("/proc/modules", "nvidia_uvm 1961984 0 - Live 0x0\nnvidia 60461056 1 nvidia_uvm, Live 0x0\n")
        .file("/proc/sys/kernel/osrelease", "6.8.12-4-pve\n");
    host
}

pub fn amd_runner() -> ScriptedRunner {
    ScriptedRunner::new()
        .stdout("lspci", &["-D", "-vmm"], LSPCI_AMD)
        .stdout("rocminfo", &[], ROCMINFO_GPU)
        .stdout("rocm-smi", &["--showmeminfo", "vram"], ROCM_SMI_VRAM)
}

pub fn nvidia_runner() -> ScriptedRunner {
    ScriptedRunner::new()
        .stdout("lspci", &["-D", "-vmm"], LSPCI_NVIDIA)
        .stdout("nvidia-smi", &["-L"], "GPU 0: NVIDIA GeForce RTX 3090 (UUID: GPU-1b2c3d4e)\n")
        .stdout("nvidia-smi", &["--query-gpu=memory.total"], "24576\n")
}
