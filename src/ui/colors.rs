// Pastel color palette for report output

use crossterm::style::{Color, Stylize};
use std::fmt;

use crate::verify::{CheckOutcome, OverallStatus};

/// Defines the pastel color palette for the UI
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PastelColor {
    Pink,
    Lavender,
    Mint,
    SkyBlue,
    Peach,
    LightYellow,
    White,
    Gray,
}

impl PastelColor {
    /// Get the terminal color representation
    pub fn as_color(&self) -> Color {
        match self {
            PastelColor::Pink => Color::Rgb { r: 255, g: 182, b: 193 },       // Light pink
            PastelColor::Lavender => Color::Rgb { r: 204, g: 169, b: 221 },   // Light purple
            PastelColor::Mint => Color::Rgb { r: 176, g: 224, b: 183 },       // Mint green
            PastelColor::SkyBlue => Color::Rgb { r: 173, g: 216, b: 230 },    // Light sky blue
            PastelColor::Peach => Color::Rgb { r: 255, g: 218, b: 185 },      // Peach
            PastelColor::LightYellow => Color::Rgb { r: 255, g: 255, b: 224 },// Light yellow
            PastelColor::White => Color::White,
            PastelColor::Gray => Color::Rgb { r: 169, g: 169, b: 169 },       // Light gray
        }
    }
}

/// Text that is colored only when the output is a terminal
pub struct StyledText<'a> {
    content: &'a str,
    color: PastelColor,
    bold: bool,
    enabled: bool,
}

impl<'a> StyledText<'a> {
    pub fn new(text: &'a str, color: PastelColor, enabled: bool) -> Self {
        Self { content: text, color, bold: false, enabled }
    }

    pub fn bold(mut self) -> Self {
        self.bold = true;
        self
    }
}

impl<'a> fmt::Display for StyledText<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.enabled {
            return f.write_str(self.content);
        }
        let styled = self.content.with(self.color.as_color());
        if self.bold {
            write!(f, "{}", styled.bold())
        } else {
            write!(f, "{}", styled)
        }
    }
}

/// Colors for each kind of report element
#[derive(Clone, Copy, Debug)]
pub struct Theme {
    pub heading: PastelColor,
    pub label: PastelColor,
    pub text: PastelColor,
    pub muted: PastelColor,
    pub pass: PastelColor,
    pub fail: PastelColor,
    pub reboot: PastelColor,
    pub unknown: PastelColor,
    /// Emit ANSI color sequences
    pub enabled: bool,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            heading: PastelColor::Lavender,
            label: PastelColor::SkyBlue,
            text: PastelColor::White,
            muted: PastelColor::Gray,
            pass: PastelColor::Mint,
            fail: PastelColor::Pink,
            reboot: PastelColor::LightYellow,
            unknown: PastelColor::Peach,
            enabled: true,
        }
    }
}

impl Theme {
    /// Theme that prints plain text
    pub fn plain() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    pub fn paint<'a>(&self, text: &'a str, color: PastelColor) -> StyledText<'a> {
        StyledText::new(text, color, self.enabled)
    }

    pub fn outcome_color(&self, outcome: CheckOutcome) -> PastelColor {
        match outcome {
            CheckOutcome::Pass => self.pass,
            CheckOutcome::Fail => self.fail,
            CheckOutcome::Unknown => self.unknown,
        }
    }

    pub fn overall_color(&self, overall: OverallStatus) -> PastelColor {
        match overall {
            OverallStatus::Pass => self.pass,
            OverallStatus::RebootRequired => self.reboot,
            OverallStatus::Fail => self.fail,
        }
    }
}
