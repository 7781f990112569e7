//! External tool capability detection.

use crate::config::model::ToolsConfig;
use crate::error::CapabilityError;

/// System capabilities detected at startup: whether the required
/// external tools are reachable and what version they report.
#[derive(Debug, Clone)]
pub struct SystemCapabilities {
    /// `ab-av1 --version` output, if the binary was found.
    pub ab_av1_version: Option<String>,
    /// `mediainfo --version` output, if the binary was found.
    pub mediainfo_version: Option<String>,
}

impl SystemCapabilities {
    /// Detects system capabilities by probing `--version` on each configured tool.
    ///
    /// Unlike config validation, a missing tool here is never fatal — `validate_config`
    /// downgrades it to a warning so `config-validate` can still report the rest of the file.
    pub fn detect(tools: &ToolsConfig) -> Self {
        Self {
            ab_av1_version: probe_version(&tools.ab_av1_path),
            mediainfo_version: probe_version(&tools.mediainfo_path),
        }
    }
}

/// Runs `<path> --version` and returns the first line of stdout on success.
fn probe_version(path: &str) -> Option<String> {
    let output = std::process::Command::new(path).arg("--version").output().ok()?;

    if !output.status.success() {
        return None;
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|line| line.trim().to_string())
}

/// Checks if a binary exists in `PATH`, for diagnostics that need a yes/no
/// rather than a version string.
pub fn which_binary(name: &str) -> Result<std::path::PathBuf, CapabilityError> {
    let output = std::process::Command::new("which")
        .arg(name)
        .output()
        .map_err(|e| CapabilityError::CommandFailed {
            command: format!("which {}", name),
            message: e.to_string(),
        })?;

    if output.status.success() {
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(std::path::PathBuf::from(path))
    } else {
        Err(CapabilityError::ToolNotFound { tool: name.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_version_missing_binary_is_none() {
        assert!(probe_version("this-binary-does-not-exist-anywhere").is_none());
    }

    #[test]
    fn detect_never_panics_on_missing_tools() {
        let tools = ToolsConfig {
            ab_av1_path: "this-binary-does-not-exist-anywhere".to_string(),
            mediainfo_path: "nor-does-this-one".to_string(),
        };
        let caps = SystemCapabilities::detect(&tools);
        assert!(caps.ab_av1_version.is_none());
        assert!(caps.mediainfo_version.is_none());
    }
}
