//! Semantic validation of the configuration surface.

use super::capabilities::SystemCapabilities;
use super::{ValidationIssue, ValidationResult};
use crate::config::model::AppConfig;

/// Validates the configuration. Rejects internally-inconsistent quality/batch
/// settings; reports (but does not reject) missing external tools.
pub fn validate(config: &AppConfig, capabilities: &SystemCapabilities) -> ValidationResult {
    let mut result = ValidationResult::new();

    let quality = &config.global.quality;
    if quality.vmaf_target_floor > quality.default_vmaf_target {
        result.add(
            ValidationIssue::error(
                "global.quality.vmaf_target_floor",
                format!(
                    "vmaf_target_floor ({}) must not exceed default_vmaf_target ({})",
                    quality.vmaf_target_floor, quality.default_vmaf_target
                ),
            )
            .with_suggestion("lower vmaf_target_floor or raise default_vmaf_target"),
        );
    }

    if quality.min_crf >= quality.max_crf {
        result.add(
            ValidationIssue::error(
                "global.quality.min_crf",
                format!("min_crf ({}) must be less than max_crf ({})", quality.min_crf, quality.max_crf),
            ),
        );
    }

    let analyzer = &config.global.analyzer;
    if analyzer.min_batch_size > analyzer.max_batch_size {
        result.add(ValidationIssue::error(
            "global.analyzer.min_batch_size",
            format!(
                "min_batch_size ({}) must not exceed max_batch_size ({})",
                analyzer.min_batch_size, analyzer.max_batch_size
            ),
        ));
    }

    if !(analyzer.min_batch_size..=analyzer.max_batch_size).contains(&analyzer.batch_size) {
        result.add(
            ValidationIssue::warning(
                "global.analyzer.batch_size",
                format!(
                    "batch_size ({}) falls outside [min_batch_size, max_batch_size] ({}..={})",
                    analyzer.batch_size, analyzer.min_batch_size, analyzer.max_batch_size
                ),
            )
            .with_suggestion("the auto-tuner will clamp this at runtime"),
        );
    }

    if let Some(parent) = config.global.temp_dir.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            result.add(
                ValidationIssue::error(
                    "global.temp_dir",
                    format!("parent directory {} does not exist", parent.display()),
                ),
            );
        }
    }

    for (i, library) in config.libraries.iter().enumerate() {
        if !library.path.exists() {
            result.add(
                ValidationIssue::warning(
                    format!("libraries[{}].path", i),
                    format!("{} does not exist", library.path.display()),
                )
                .with_suggestion("the library will simply contribute no videos until it appears"),
            );
        }
    }

    if capabilities.ab_av1_version.is_none() {
        result.add(
            ValidationIssue::warning("global.tools.ab_av1_path", "ab-av1 not found or did not respond to --version")
                .with_suggestion("CRF search and encoding will fail until this is resolved"),
        );
    }

    if capabilities.mediainfo_version.is_none() {
        result.add(
            ValidationIssue::warning("global.tools.mediainfo_path", "mediainfo not found or did not respond to --version")
                .with_suggestion("analysis will fail until this is resolved"),
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{AnalyzerConfig, DatabaseConfig, GlobalConfig, ProgressConfig, QualityConfig, RetryConfig, ToolsConfig};
    use std::path::PathBuf;

    fn base_config() -> AppConfig {
        AppConfig {
            global: GlobalConfig {
                log_level: "info".to_string(),
                temp_dir: PathBuf::from("/tmp/reencodarr"),
                database: DatabaseConfig { path: PathBuf::from("/tmp/reencodarr.db") },
                tools: ToolsConfig::default(),
                quality: QualityConfig::default(),
                analyzer: AnalyzerConfig::default(),
                retry: RetryConfig::default(),
                progress: ProgressConfig::default(),
                producer_poll_interval_seconds: 2,
            },
            libraries: vec![],
        }
    }

    #[test]
    fn rejects_inverted_vmaf_floor() {
        let mut config = base_config();
        config.global.quality.vmaf_target_floor = 99;
        config.global.quality.default_vmaf_target = 95;
        let capabilities = SystemCapabilities { ab_av1_version: Some("1.0".into()), mediainfo_version: Some("1.0".into()) };
        let result = validate(&config, &capabilities);
        assert!(!result.is_valid());
    }

    #[test]
    fn rejects_inverted_crf_range() {
        let mut config = base_config();
        config.global.quality.min_crf = 40;
        config.global.quality.max_crf = 8;
        let capabilities = SystemCapabilities { ab_av1_version: Some("1.0".into()), mediainfo_version: Some("1.0".into()) };
        let result = validate(&config, &capabilities);
        assert!(!result.is_valid());
    }

    #[test]
    fn missing_tools_are_warnings_not_errors() {
        let config = base_config();
        let capabilities = SystemCapabilities { ab_av1_version: None, mediainfo_version: None };
        let result = validate(&config, &capabilities);
        assert!(result.is_valid());
        assert_eq!(result.warnings().count(), 2);
    }
}
