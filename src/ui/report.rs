// Text rendering of inventories and verification reports

use std::fmt::Write;

use unicode_width::UnicodeWidthStr;

use crate::gpu::GpuDevice;
use crate::ui::colors::Theme;
use crate::verify::{CheckOutcome, StageKind, VerificationReport};

/// Pads `text` with spaces to `width` terminal columns
fn pad(text: &str, width: usize) -> String {
    let used = UnicodeWidthStr::width(text);
    format!("{}{}", text, " ".repeat(width.saturating_sub(used)))
}

fn outcome_label(outcome: CheckOutcome) -> &'static str {
    match outcome {
        CheckOutcome::Pass => "PASS",
        CheckOutcome::Fail => "FAIL",
        CheckOutcome::Unknown => "SKIP",
    }
}

/// One row per GPU: PCI address, vendor, model, driver, resolved nodes
pub fn render_inventory(devices: &[GpuDevice], theme: &Theme) -> String {
    let mut out = String::new();
    if devices.is_empty() {
        let _ = writeln!(out, "{}", theme.paint("No GPUs detected", theme.muted));
        return out;
    }

    let rows: Vec<[String; 5]> = devices
        .iter()
        .map(|gpu| {
            let nodes = match &gpu.paths {
                Some(paths) => {
                    let mut nodes = paths.card_node.display().to_string();
                    if let Some(render) = &paths.render_node {
                        let _ = write!(nodes, ", {}", render.display());
                    }
                    nodes
                }
                None => "unresolved".to_string(),
            };
            [
                gpu.pci_address.clone(),
                gpu.vendor.to_string(),
                gpu.display_name.clone(),
                gpu.driver.clone().unwrap_or_else(|| "-".to_string()),
                nodes,
            ]
        })
        .collect();

    let headers = ["PCI", "VENDOR", "MODEL", "DRIVER", "NODES"];
    let widths: Vec<usize> = (0..headers.len())
        .map(|i| {
            rows.iter()
                .map(|row| UnicodeWidthStr::width(row[i].as_str()))
                .chain(std::iter::once(headers[i].len()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let header_line: Vec<String> = headers.iter().zip(&widths).map(|(h, w)| pad(h, *w)).collect();
    let header_line = header_line.join("  ");
    let _ = writeln!(out, "{}", theme.paint(header_line.trim_end(), theme.heading).bold());
    for row in &rows {
        let line: Vec<String> = row.iter().zip(&widths).map(|(cell, w)| pad(cell, *w)).collect();
        let _ = writeln!(out, "{}", line.join("  ").trim_end());
    }
    out
}

/// Checks grouped by stage, then the verdict and the first remediation hint
pub fn render_report(report: &VerificationReport, theme: &Theme) -> String {
    let mut out = String::new();
    let title = match &report.pci_address {
        Some(pci) => format!("{} GPU verification ({})", report.vendor, pci),
        None => format!("{} GPU verification", report.vendor),
    };
    let _ = writeln!(out, "{}", theme.paint(&title, theme.heading).bold());

    let name_width = report
        .checks
        .iter()
        .map(|c| UnicodeWidthStr::width(c.name.as_str()))
        .max()
        .unwrap_or(0);

    let mut current: Option<StageKind> = None;
    for check in &report.checks {
        if current != Some(check.stage) {
            current = Some(check.stage);
            let suffix = if check.required { "" } else { " (optional)" };
            let _ = writeln!(out, "\n{}{}", theme.paint(check.stage.name(), theme.label), suffix);
        }
        let label = outcome_label(check.outcome);
        let _ = writeln!(
            out,
            "  [{}] {}  {}",
            theme.paint(label, theme.outcome_color(check.outcome)),
            pad(&check.name, name_width),
            theme.paint(&check.detail, theme.muted)
        );
    }

    let overall = report.overall.to_string();
    let _ = writeln!(
        out,
        "\n{} {} ({}/{} checks passed)",
        theme.paint("Overall:", theme.heading).bold(),
        theme.paint(&overall, theme.overall_color(report.overall)).bold(),
        report.passed,
        report.total
    );

    if let Some(blocking) = report.first_blocking() {
        let _ = writeln!(out, "Failed at: {} / {}: {}", blocking.stage, blocking.name, blocking.detail);
        if let Some(hint) = &blocking.hint {
            let _ = writeln!(out, "Hint: {}", hint);
        }
    }
    if report.overall == crate::verify::OverallStatus::RebootRequired {
        let _ = writeln!(out, "Configuration is in place; reboot the host to activate it.");
    }
    out
}
