use serde::Serialize;

use crate::accel::{MAX_PICTURE_DIMENSION, MAX_PP_OUTPUTS};
use crate::config::{OutputSpec, SessionConfig};
use crate::session::negotiator::MAX_BUFFERS;

/// Upper bound on the input ring depth.
pub const MAX_STREAM_BUFFERS: usize = 64;
/// Upper bound on frames the consumer may hold at once.
pub const MAX_OUTSTANDING_FRAMES: usize = 256;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_config(config: &SessionConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    if config.stream_buffers == 0 || config.stream_buffers > MAX_STREAM_BUFFERS {
        report.errors.push(format!(
            "stream_buffers must be between 1 and {MAX_STREAM_BUFFERS}, got {}",
            config.stream_buffers
        ));
    }
    if config.stream_buffer_size == 0 {
        report
            .errors
            .push("stream_buffer_size must be non-zero".into());
    }
    if config.timestamp_depth == 0 {
        report.errors.push("timestamp_depth must be non-zero".into());
    } else if config.timestamp_depth < config.stream_buffers {
        report.warnings.push(format!(
            "timestamp_depth {} is smaller than stream_buffers {}; timestamps of queued packets may be evicted",
            config.timestamp_depth, config.stream_buffers
        ));
    }
    if config.max_outstanding_frames == 0 || config.max_outstanding_frames > MAX_OUTSTANDING_FRAMES
    {
        report.errors.push(format!(
            "max_outstanding_frames must be between 1 and {MAX_OUTSTANDING_FRAMES}, got {}",
            config.max_outstanding_frames
        ));
    } else if config.max_outstanding_frames < MAX_BUFFERS {
        report.warnings.push(format!(
            "max_outstanding_frames {} is below the {MAX_BUFFERS} picture buffers the core may lend; a slow consumer can stall the session",
            config.max_outstanding_frames
        ));
    }
    if config.picture_limit == Some(0) {
        report
            .errors
            .push("picture_limit must be greater than zero when set".into());
    }
    if config.model.dpb_size == 0 {
        report.errors.push("model.dpb_size must be non-zero".into());
    }
    if config.model.fallback_width == 0 || config.model.fallback_height == 0 {
        report
            .errors
            .push("model fallback picture size must be non-zero".into());
    }
    let margin = config.buffer_margin();
    if config.model.dpb_size + margin > MAX_BUFFERS {
        report.errors.push(format!(
            "model.dpb_size {} plus buffer margin {margin} exceeds the {MAX_BUFFERS} buffer cap",
            config.model.dpb_size
        ));
    }

    if config.outputs.is_empty() {
        report
            .errors
            .push("At least one output must be configured".into());
    } else if config.outputs.len() > MAX_PP_OUTPUTS {
        report.errors.push(format!(
            "At most {MAX_PP_OUTPUTS} outputs are supported, got {}",
            config.outputs.len()
        ));
    } else if !config.outputs.iter().any(|output| output.enabled) {
        report.errors.push("At least one output must be enabled".into());
    }
    for (idx, output) in config.outputs.iter().enumerate() {
        report.merge(validate_output(idx, output));
    }

    report
}

fn validate_output(idx: usize, output: &OutputSpec) -> ValidationReport {
    let mut report = ValidationReport::default();
    if !output.enabled {
        return report;
    }
    if output.width == Some(0) || output.height == Some(0) {
        report
            .errors
            .push(format!("Output {idx}: scaled size must be non-zero"));
    } else if output.width.unwrap_or(0) > MAX_PICTURE_DIMENSION
        || output.height.unwrap_or(0) > MAX_PICTURE_DIMENSION
    {
        report.errors.push(format!(
            "Output {idx}: scaled size must not exceed {MAX_PICTURE_DIMENSION}"
        ));
    }
    if output.width.is_some() != output.height.is_some() {
        report.warnings.push(format!(
            "Output {idx}: only one scaled dimension given, the other follows the stream"
        ));
    }
    if let Some(crop) = output.crop
        && (crop.width == 0 || crop.height == 0)
    {
        report
            .errors
            .push(format!("Output {idx}: crop rectangle must be non-empty"));
    }
    if let Some(bit_depth) = output.bit_depth
        && !matches!(bit_depth, 8 | 10)
    {
        report
            .errors
            .push(format!("Output {idx}: bit_depth must be 8 or 10, got {bit_depth}"));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{CodecFormat, CropRect};

    #[test]
    fn default_config_has_no_errors() {
        let report = validate_config(&SessionConfig::new(CodecFormat::H264));
        assert!(report.is_ok(), "{:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn collects_every_problem() {
        let mut config = SessionConfig::new(CodecFormat::Vp9);
        config.stream_buffers = 0;
        config.picture_limit = Some(0);
        config.outputs = vec![
            OutputSpec {
                crop: Some(CropRect::default()),
                ..OutputSpec::default()
            },
            OutputSpec {
                bit_depth: Some(12),
                ..OutputSpec::default()
            },
        ];
        let report = validate_config(&config);
        assert_eq!(report.errors.len(), 4, "{:?}", report.errors);
        assert!(report.errors[0].contains("stream_buffers"));
    }

    #[test]
    fn scaled_size_beyond_core_limit() {
        let mut config = SessionConfig::new(CodecFormat::H264);
        config.outputs = vec![OutputSpec {
            width: Some(MAX_PICTURE_DIMENSION + 1),
            height: Some(720),
            ..OutputSpec::default()
        }];
        let report = validate_config(&config);
        assert_eq!(
            report.errors,
            vec![format!("Output 0: scaled size must not exceed {MAX_PICTURE_DIMENSION}")]
        );
    }

    #[test]
    fn too_many_or_disabled_outputs() {
        let mut config = SessionConfig::new(CodecFormat::Hevc);
        config.outputs = vec![OutputSpec::default(); MAX_PP_OUTPUTS + 1];
        assert!(!validate_config(&config).is_ok());

        config.outputs = vec![OutputSpec {
            enabled: false,
            ..OutputSpec::default()
        }];
        let report = validate_config(&config);
        assert_eq!(report.errors, vec!["At least one output must be enabled"]);
    }

    #[test]
    fn small_tables_warn() {
        let mut config = SessionConfig::new(CodecFormat::H264);
        config.timestamp_depth = 4;
        config.max_outstanding_frames = 8;
        let report = validate_config(&config);
        assert!(report.is_ok());
        assert_eq!(report.warnings.len(), 2);
    }
}
