// Core module definitions for Exliar GPU

pub mod bootloader;
pub mod host;
pub mod process;
