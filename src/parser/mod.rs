//! Maps a single line of `ab-av1`/`mediainfo` output to a typed [`Event`].
//!
//! Pure, stateless, total: [`parse_line`] always returns exactly one
//! variant, defaulting to [`Event::Ignore`]. Rule order matters — more
//! specific patterns are tried before their generalizations.

use regex::Regex;

/// A single typed event extracted from one line of process output.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Emitted while probing a CRF: `sample 1/3 crf 28`.
    EncodingSample { sample_num: u32, total_samples: u32, crf: f64 },
    /// One sample's measurement: `sample 1/3 crf 28 VMAF 91.33 (85%)`.
    SampleVmaf { sample_num: u32, total_samples: u32, crf: f64, score: f64, percent: i64 },
    /// Dash-prefixed summary of a probed CRF: `- crf 28 VMAF 91.33 (85%)`.
    CandidateVmaf { crf: f64, score: f64, percent: i64 },
    /// Final candidate including predicted output size.
    PredictedSize {
        crf: f64,
        score: f64,
        predicted_size: f64,
        size_unit: String,
        percent: i64,
        time_taken: f64,
        time_unit: String,
    },
    /// Percent/fps of the current operation.
    Progress { percent: f64, fps: Option<f64>, eta: Option<f64>, eta_unit: Option<String> },
    /// Byte-level encode progress.
    FileProgress { size: f64, unit: String, percent: f64 },
    /// Announces the selected CRF.
    Success { crf: f64 },
    /// Non-fatal diagnostic.
    Warning { message: String },
    /// `ffmpeg` reported a non-zero exit internally.
    FfmpegError { exit_code: i32 },
    /// A structured fatal-error line.
    FatalError { message: String },
    /// Announces the beginning of an encode.
    EncodingStart { filename: String, video_id: Option<i64> },
    /// Informational comparison between two files; no side effect.
    VmafComparison { file1: String, file2: String },
    /// No rule matched.
    Ignore,
}

/// The exact fatal-error string the CRF-search retry cascade watches for.
pub const CRF_EXHAUSTED_MESSAGE: &str = "Error: Failed to find a suitable crf";

/// Multipliers converting a [`TIME_UNITS`] token to seconds, in declaration order.
pub const TIME_UNITS: &[(&str, f64)] = &[
    ("second", 1.0),
    ("minute", 60.0),
    ("hour", 3600.0),
    ("day", 86400.0),
    ("week", 604800.0),
    ("month", 2_628_000.0),
    ("year", 31_536_000.0),
];

/// Multipliers converting a size unit token to bytes.
pub const SIZE_UNITS: &[(&str, f64)] = &[
    ("B", 1.0),
    ("KB", 1_000.0),
    ("MB", 1_000_000.0),
    ("GB", 1_000_000_000.0),
    ("TB", 1_000_000_000_000.0),
    ("KiB", 1024.0),
    ("MiB", 1024.0 * 1024.0),
    ("GiB", 1024.0 * 1024.0 * 1024.0),
];

/// Converts a size value + unit token into bytes, or `None` if the unit is unrecognized.
pub fn size_to_bytes(value: f64, unit: &str) -> Option<f64> {
    SIZE_UNITS.iter().find(|(u, _)| *u == unit).map(|(_, mult)| value * mult)
}

/// Converts a time value + unit token into seconds, or `None` if the unit is unrecognized.
/// Accepts both singular (`hour`) and plural (`hours`) forms.
pub fn time_to_seconds(value: f64, unit: &str) -> Option<f64> {
    let singular = unit.strip_suffix('s').unwrap_or(unit);
    TIME_UNITS.iter().find(|(u, _)| *u == singular).map(|(_, mult)| value * mult)
}

/// Strips an optional leading bracketed timestamp (`[12:34:56] `) and an
/// optional trailing `" (cache)"` suffix before rule matching.
fn strip_decorations(line: &str) -> String {
    static TIMESTAMP: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = TIMESTAMP.get_or_init(|| Regex::new(r"^\[[^\]]+\]\s*").unwrap());
    let stripped = re.replace(line, "");
    let trimmed = stripped.trim_end();
    trimmed.strip_suffix(" (cache)").unwrap_or(trimmed).to_string()
}

/// Maps a single raw line to its [`Event`]. Total: never panics, always
/// returns a value. The rule table below is ordered most-specific-first.
pub fn parse_line(raw: &str) -> Event {
    let line = strip_decorations(raw);
    let line = line.as_str();

    if let Some(event) = try_predicted_size(line) {
        return event;
    }
    if let Some(event) = try_sample_vmaf(line) {
        return event;
    }
    if let Some(event) = try_candidate_vmaf(line) {
        return event;
    }
    if let Some(event) = try_encoding_sample(line) {
        return event;
    }
    if let Some(event) = try_success(line) {
        return event;
    }
    if let Some(event) = try_fatal_error(line) {
        return event;
    }
    if let Some(event) = try_ffmpeg_error(line) {
        return event;
    }
    if let Some(event) = try_encoding_start(line) {
        return event;
    }
    if let Some(event) = try_vmaf_comparison(line) {
        return event;
    }
    if let Some(event) = try_file_progress(line) {
        return event;
    }
    if let Some(event) = try_progress(line) {
        return event;
    }
    if let Some(event) = try_warning(line) {
        return event;
    }

    Event::Ignore
}

fn regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static parser regex must compile")
}

fn try_predicted_size(line: &str) -> Option<Event> {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| {
        regex(
            r"crf (?P<crf>[\d.]+) VMAF (?P<score>[\d.]+) predicted video stream size (?P<size>[\d.]+) (?P<unit>[A-Za-z]+) \((?P<percent>\d+)%\) taking (?P<time>[\d.]+) (?P<time_unit>\w+)",
        )
    });
    let caps = re.captures(line)?;
    Some(Event::PredictedSize {
        crf: caps["crf"].parse().ok()?,
        score: caps["score"].parse().ok()?,
        predicted_size: caps["size"].parse().ok()?,
        size_unit: caps["unit"].to_string(),
        percent: caps["percent"].parse().ok()?,
        time_taken: caps["time"].parse().ok()?,
        time_unit: caps["time_unit"].to_string(),
    })
}

fn try_sample_vmaf(line: &str) -> Option<Event> {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| {
        regex(r"^sample (?P<n>\d+)/(?P<total>\d+) crf (?P<crf>[\d.]+) VMAF (?P<score>[\d.]+) \((?P<percent>\d+)%\)")
    });
    let caps = re.captures(line)?;
    Some(Event::SampleVmaf {
        sample_num: caps["n"].parse().ok()?,
        total_samples: caps["total"].parse().ok()?,
        crf: caps["crf"].parse().ok()?,
        score: caps["score"].parse().ok()?,
        percent: caps["percent"].parse().ok()?,
    })
}

fn try_candidate_vmaf(line: &str) -> Option<Event> {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| regex(r"^- crf (?P<crf>[\d.]+) VMAF (?P<score>[\d.]+) \((?P<percent>\d+)%\)"));
    let caps = re.captures(line)?;
    Some(Event::CandidateVmaf {
        crf: caps["crf"].parse().ok()?,
        score: caps["score"].parse().ok()?,
        percent: caps["percent"].parse().ok()?,
    })
}

fn try_encoding_sample(line: &str) -> Option<Event> {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| regex(r"^sample (?P<n>\d+)/(?P<total>\d+) crf (?P<crf>[\d.]+)$"));
    let caps = re.captures(line)?;
    Some(Event::EncodingSample {
        sample_num: caps["n"].parse().ok()?,
        total_samples: caps["total"].parse().ok()?,
        crf: caps["crf"].parse().ok()?,
    })
}

fn try_success(line: &str) -> Option<Event> {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| regex(r"^crf (?P<crf>[\d.]+) successful"));
    let caps = re.captures(line)?;
    Some(Event::Success { crf: caps["crf"].parse().ok()? })
}

fn try_fatal_error(line: &str) -> Option<Event> {
    if line.starts_with("Error:") {
        return Some(Event::FatalError { message: line.to_string() });
    }
    None
}

fn try_ffmpeg_error(line: &str) -> Option<Event> {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| regex(r"(?i)ffmpeg.*exit(?:ed|\s*code)?[:\s]+(?P<code>-?\d+)"));
    let caps = re.captures(line)?;
    Some(Event::FfmpegError { exit_code: caps["code"].parse().ok()? })
}

fn try_encoding_start(line: &str) -> Option<Event> {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| regex(r"^Encoding (?P<filename>.+?)(?: \(video_id (?P<id>\d+)\))?$"));
    let caps = re.captures(line)?;
    Some(Event::EncodingStart {
        filename: caps["filename"].to_string(),
        video_id: caps.name("id").and_then(|m| m.as_str().parse().ok()),
    })
}

fn try_vmaf_comparison(line: &str) -> Option<Event> {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| regex(r"^vmaf comparison (?P<f1>\S+) (?P<f2>\S+)$"));
    let caps = re.captures(line)?;
    Some(Event::VmafComparison { file1: caps["f1"].to_string(), file2: caps["f2"].to_string() })
}

fn try_file_progress(line: &str) -> Option<Event> {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| regex(r"^(?P<size>[\d.]+)(?P<unit>B|KB|MB|GB|TB|KiB|MiB|GiB) \((?P<percent>[\d.]+)%\)$"));
    let caps = re.captures(line)?;
    Some(Event::FileProgress {
        size: caps["size"].parse().ok()?,
        unit: caps["unit"].to_string(),
        percent: caps["percent"].parse().ok()?,
    })
}

fn try_progress(line: &str) -> Option<Event> {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| {
        regex(r"(?P<percent>[\d.]+)%.*?(?:(?P<fps>[\d.]+) fps)?.*?(?:eta (?P<eta>[\d.]+) (?P<eta_unit>\w+))?")
    });
    let caps = re.captures(line)?;
    // Guard against matching arbitrary lines that merely contain a `%` sign
    // with no other progress context (e.g. a VMAF score line already
    // classified above); require the literal word boundary right after `%`.
    if !line.contains('%') {
        return None;
    }
    Some(Event::Progress {
        percent: caps["percent"].parse().ok()?,
        fps: caps.name("fps").and_then(|m| m.as_str().parse().ok()),
        eta: caps.name("eta").and_then(|m| m.as_str().parse().ok()),
        eta_unit: caps.name("eta_unit").map(|m| m.as_str().to_string()),
    })
}

fn try_warning(line: &str) -> Option<Event> {
    if line.starts_with("Warning:") || line.to_ascii_lowercase().starts_with("warn:") {
        return Some(Event::Warning { message: line.to_string() });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicted_size_event() {
        let event = parse_line("crf 26 VMAF 95.50 predicted video stream size 550.0 MB (51%) taking 120 seconds");
        assert_eq!(
            event,
            Event::PredictedSize {
                crf: 26.0,
                score: 95.50,
                predicted_size: 550.0,
                size_unit: "MB".to_string(),
                percent: 51,
                time_taken: 120.0,
                time_unit: "seconds".to_string(),
            }
        );
    }

    #[test]
    fn sample_vmaf_event() {
        let event = parse_line("sample 1/3 crf 28 VMAF 91.33 (85%)");
        assert_eq!(
            event,
            Event::SampleVmaf { sample_num: 1, total_samples: 3, crf: 28.0, score: 91.33, percent: 85 }
        );
    }

    #[test]
    fn candidate_vmaf_event() {
        let event = parse_line("- crf 28 VMAF 91.33 (85%)");
        assert_eq!(event, Event::CandidateVmaf { crf: 28.0, score: 91.33, percent: 85 });
    }

    #[test]
    fn success_event() {
        assert_eq!(parse_line("crf 26 successful"), Event::Success { crf: 26.0 });
    }

    #[test]
    fn fatal_error_exact_string_recognized() {
        let event = parse_line(CRF_EXHAUSTED_MESSAGE);
        assert_eq!(event, Event::FatalError { message: CRF_EXHAUSTED_MESSAGE.to_string() });
    }

    #[test]
    fn timestamp_prefix_is_stripped_to_equal_event() {
        let bare = parse_line("crf 26 successful");
        let prefixed = parse_line("[00:01:23] crf 26 successful");
        assert_eq!(bare, prefixed);
    }

    #[test]
    fn cache_suffix_is_stripped() {
        let plain = parse_line("- crf 28 VMAF 91.33 (85%)");
        let cached = parse_line("- crf 28 VMAF 91.33 (85%) (cache)");
        assert_eq!(plain, cached);
    }

    #[test]
    fn unrecognized_line_is_ignored() {
        assert_eq!(parse_line("some line nobody expected"), Event::Ignore);
    }

    #[test]
    fn size_unit_conversion_table() {
        assert_eq!(size_to_bytes(1.0, "GiB"), Some(1024.0 * 1024.0 * 1024.0));
        assert_eq!(size_to_bytes(1.0, "GB"), Some(1_000_000_000.0));
        assert_eq!(size_to_bytes(1.0, "nonsense"), None);
    }

    #[test]
    fn time_unit_conversion_table() {
        assert_eq!(time_to_seconds(1.0, "hour"), Some(3600.0));
        assert_eq!(time_to_seconds(2.0, "hours"), Some(7200.0));
        assert_eq!(time_to_seconds(1.0, "minute"), Some(60.0));
    }

    #[test]
    fn predicted_size_ordered_before_candidate_vmaf() {
        // Must not be misclassified as a bare CandidateVmaf because it also
        // contains "crf N VMAF N.NN".
        let event = parse_line("crf 22 VMAF 96.0 predicted video stream size 12.5 GB (95%) taking 150 seconds");
        assert!(matches!(event, Event::PredictedSize { .. }));
    }
}
