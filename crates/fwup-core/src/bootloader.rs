//! Bootloader hand-off.
//!
//! The STM32 bootloader is not written over the updater protocol; an
//! external flashing tool is run against the port instead.

use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};

use crate::protocol::constants::BOOTLOADER_FLASH_ADDRESS;

#[derive(Error, Debug)]
pub enum HandoffError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} failed with exit code {}", .code.map_or("none".to_string(), |c| c.to_string()))]
    ToolFailed { program: String, code: Option<i32> },
}

/// External flashing tool and its argument template.
///
/// `{image}`, `{address}` and `{port}` in `args` are replaced before the
/// tool runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlasherConfig {
    pub program: String,
    pub args: Vec<String>,
    pub address: u32,
}

impl Default for FlasherConfig {
    fn default() -> Self {
        Self {
            program: "stm32flash".to_string(),
            args: ["-w", "{image}", "-v", "-S", "{address}", "{port}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            address: BOOTLOADER_FLASH_ADDRESS,
        }
    }
}

pub struct ExternalFlasher {
    config: FlasherConfig,
}

impl ExternalFlasher {
    pub fn new(config: FlasherConfig) -> Self {
        Self { config }
    }

    /// Arguments with the placeholders filled in.
    pub fn command_args(&self, image_path: &Path, address: u32, port: &str) -> Vec<String> {
        let image = image_path.display().to_string();
        let address = format!("0x{:08x}", address);
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{image}", &image)
                    .replace("{address}", &address)
                    .replace("{port}", port)
            })
            .collect()
    }

    /// Flash the bootloader at the configured address.
    pub fn flash_default(&self, image_path: &Path, port: &str) -> Result<(), HandoffError> {
        self.flash(image_path, self.config.address, port)
    }

    /// Run the tool and wait for it. Its output goes to the terminal.
    #[instrument(skip(self), fields(program = %self.config.program))]
    pub fn flash(&self, image_path: &Path, address: u32, port: &str) -> Result<(), HandoffError> {
        let args = self.command_args(image_path, address, port);
        info!(args = ?args, "Running bootloader flasher");

        let status = Command::new(&self.config.program)
            .args(&args)
            .status()
            .map_err(|source| HandoffError::Spawn {
                program: self.config.program.clone(),
                source,
            })?;

        if !status.success() {
            return Err(HandoffError::ToolFailed {
                program: self.config.program.clone(),
                code: status.code(),
            });
        }
        info!("Bootloader flashed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_line() {
        let flasher = ExternalFlasher::new(FlasherConfig::default());
        let args = flasher.command_args(Path::new("boot.bin"), BOOTLOADER_FLASH_ADDRESS, "/dev/ttyUSB0");
        assert_eq!(
            args,
            vec!["-w", "boot.bin", "-v", "-S", "0x08000000", "/dev/ttyUSB0"]
        );
    }

    #[test]
    fn test_missing_program() {
        let flasher = ExternalFlasher::new(FlasherConfig {
            program: "fwup-no-such-flasher".to_string(),
            ..FlasherConfig::default()
        });
        assert!(matches!(
            flasher.flash_default(Path::new("boot.bin"), "/dev/null"),
            Err(HandoffError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_tool_exit_status() {
        let ok = ExternalFlasher::new(FlasherConfig {
            program: "true".to_string(),
            ..FlasherConfig::default()
        });
        assert!(ok.flash_default(Path::new("boot.bin"), "/dev/null").is_ok());

        let failing = ExternalFlasher::new(FlasherConfig {
            program: "false".to_string(),
            ..FlasherConfig::default()
        });
        assert!(matches!(
            failing.flash_default(Path::new("boot.bin"), "/dev/null"),
            Err(HandoffError::ToolFailed { code: Some(1), .. })
        ));
    }
}
