// GPU detection module for Exliar GPU
//
// This module handles detection of GPU devices in the system using
// lspci enumeration, vendor classification and sysfs/devfs enrichment

use std::fs;
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::host::HostFacts;
use crate::core::process::{CommandRunner, CommandSpec};
use crate::error::{Error, Result};
use crate::gpu::{canonical_pci_address, paths, vendor, GpuDevice, GpuVendor};

/// Describes a detected PCI device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDevice {
    pub slot: String,              // Slot as printed by lspci -D (e.g., "0000:01:00.0")
    pub class: String,             // Device class (e.g., "VGA compatible controller")
    pub vendor_name: String,       // Vendor name (e.g., "NVIDIA Corporation")
    pub device_name: String,       // Device name (e.g., "GA102 [GeForce RTX 3090]")
}

/// Detects every display-class GPU, including unsupported vendors.
/// Never fails: a missing or failing lspci yields an empty list.
pub fn scan_all(host: &HostFacts, runner: &dyn CommandRunner, timeout: Duration) -> Vec<GpuDevice> {
    let spec = CommandSpec::new("lspci", &["-D", "-vmm"]).with_timeout(timeout);
    let stdout = match runner.run(&spec) {
        Ok(output) if output.success() => output.stdout,
        Ok(output) => {
            warn!(status = ?output.status, stderr = %output.stderr.trim(), "lspci failed, assuming no GPUs");
            return Vec::new();
        }
        Err(e) => {
            warn!(error = %e, "Could not enumerate PCI devices");
            return Vec::new();
        }
    };

    parse_lspci_vmm(&stdout)
        .iter()
        .filter(|dev| is_gpu_device(dev))
        .filter_map(|dev| pci_to_gpu_device(host, dev))
        .collect()
}

/// Detects the GPUs of supported vendors, in PCI enumeration order
pub fn scan(host: &HostFacts, runner: &dyn CommandRunner, timeout: Duration) -> Vec<GpuDevice> {
    scan_all(host, runner, timeout)
        .into_iter()
        .filter(|gpu| gpu.vendor.is_supported())
        .collect()
}

/// Picks the single GPU a vendor flow should operate on.
///
/// An explicit PCI address always wins. Without one, exactly one candidate of
/// the vendor is selected automatically and several are an error the operator
/// must resolve.
pub fn select_gpu<'a>(devices: &'a [GpuDevice], vendor: &GpuVendor, explicit: Option<&str>) -> Result<&'a GpuDevice> {
    if let Some(address) = explicit {
        let wanted = canonical_pci_address(address).unwrap_or_else(|| address.to_lowercase());
        return devices
            .iter()
            .find(|gpu| gpu.pci_address == wanted && gpu.vendor == *vendor)
            .ok_or_else(|| Error::DeviceNotFound(wanted.clone()));
    }

    let candidates: Vec<&GpuDevice> = devices.iter().filter(|gpu| gpu.vendor == *vendor).collect();
    match candidates.as_slice() {
        [] => Err(Error::HardwareNotFound(vendor.clone())),
        [only] => Ok(*only),
        many => Err(Error::AmbiguousSelection {
            vendor: vendor.clone(),
            candidates: many.iter().map(|gpu| gpu.pci_address.as_str()).collect::<Vec<_>>().join(", "),
        }),
    }
}

/// Check if a PCI device is a GPU
fn is_gpu_device(device: &PciDevice) -> bool {
    // VGA compatible controller, Display controller, or 3D controller
    let class = device.class.to_lowercase();
    class.contains("vga compatible controller") || class.contains("display controller") || class.contains("3d controller")
}

/// Converts a PCI device to a GPU device with resolved paths and driver state
fn pci_to_gpu_device(host: &HostFacts, device: &PciDevice) -> Option<GpuDevice> {
    let Some(pci_address) = canonical_pci_address(&device.slot) else {
        warn!(slot = %device.slot, "Skipping device with unparseable PCI slot");
        return None;
    };
    let vendor = GpuVendor::classify(&device.vendor_name);

    let paths = paths::resolve(host, &pci_address);
    let compute_interface_present = vendor::profile(&vendor)
        .map(|profile| profile.has_compute_interface(host))
        .unwrap_or(false);
    let driver = get_device_driver(host, &pci_address);

    debug!(
        pci = %pci_address,
        vendor = %vendor,
        driver = ?driver,
        resolved = paths.is_some(),
        compute = compute_interface_present,
        "Detected GPU"
    );

    Some(GpuDevice {
        vendor,
        pci_address,
        display_name: device.device_name.clone(),
        vendor_name: device.vendor_name.clone(),
        driver,
        paths,
        compute_interface_present,
    })
}

/// Gets the current driver for a PCI device from sysfs
fn get_device_driver(host: &HostFacts, pci_address: &str) -> Option<String> {
    let driver_path = host.path(format!("/sys/bus/pci/devices/{}/driver", pci_address));
    fs::read_link(driver_path)
        .ok()
        .and_then(|target| target.file_name().map(|name| name.to_string_lossy().to_string()))
}

/// Parses `lspci -vmm` output: one stanza of `Key:\tValue` lines per device
pub fn parse_lspci_vmm(stdout: &str) -> Vec<PciDevice> {
    let mut devices = Vec::new();

    for section in stdout.split("\n\n") {
        if section.trim().is_empty() {
            continue;
        }

        let mut slot = String::new();
        let mut class = String::new();
        let mut vendor_name = String::new();
        let mut device_name = String::new();

        for line in section.lines() {
            let Some((key, value)) = line.split_once(':') else { continue };
            let value = value.trim();
            match key.trim() {
                "Slot" => slot = value.to_string(),
                "Class" => class = value.to_string(),
                "Vendor" => vendor_name = value.to_string(),
                "Device" => device_name = value.to_string(),
                _ => {}
            }
        }

        if !slot.is_empty() {
            devices.push(PciDevice { slot, class, vendor_name, device_name });
        }
    }

    devices
}
