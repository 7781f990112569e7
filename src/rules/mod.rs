//! Composes the `ab-av1` argument vector for a given [`Video`] and stage.
//!
//! Pure and deterministic: identical inputs always yield identical output.
//! Flags are merged by name with later sources overriding earlier ones, in
//! the order base < rules < overrides.

use crate::store::models::Video;

/// Which `ab-av1` subcommand the argument vector is being built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CrfSearch,
    Encode,
}

/// Builds the full argv for `stage`, merging `base` (fixed flags already
/// decided by the caller, e.g. `--input`/`--min-vmaf`/`--temp-dir`), the
/// rules derived from `video`, and finally `overrides` (operator-supplied,
/// highest precedence). Flags are identified by name (the token starting
/// with `--`); the last write for a given name wins, value included.
pub fn build_args(video: &Video, stage: Stage, base: Vec<String>, overrides: &[String]) -> Vec<String> {
    let mut flags: Vec<(String, Option<String>)> = Vec::new();

    merge(&mut flags, to_pairs(base));
    merge(&mut flags, rule_flags(video, stage));
    merge(&mut flags, to_pairs(overrides.to_vec()));

    flatten(flags)
}

/// The flags the rules engine derives from `video`'s own metadata, before
/// operator overrides are applied.
fn rule_flags(video: &Video, stage: Stage) -> Vec<(String, Option<String>)> {
    let mut flags = Vec::new();

    if stage == Stage::Encode {
        flags.extend(audio_flags(video));
    }

    if video.is_hdr() {
        flags.push(("--hdr-passthrough".to_string(), None));
    }

    if video.atmos && stage == Stage::Encode {
        flags.push(("--preserve-atmos".to_string(), None));
    }

    // No grain-model synthesis by default; an explicit `--grain` override
    // always wins regardless of this stage.
    flags.push(("--grain".to_string(), Some("0".to_string())));

    flags
}

/// Audio handling: preserve an AV1-compatible codec as-is, otherwise
/// re-encode to Opus at a bitrate scaled by channel count. Suppressed
/// entirely during `crf_search`, which measures video quality only.
fn audio_flags(video: &Video) -> Vec<(String, Option<String>)> {
    let is_av1_compatible = video
        .audio_codecs
        .iter()
        .any(|codec| matches!(codec.to_ascii_lowercase().as_str(), "opus" | "aac" | "ac3" | "eac3"));

    if is_av1_compatible {
        return vec![("--acodec".to_string(), Some("copy".to_string()))];
    }

    let channels = video.max_audio_channels.unwrap_or(2).max(1);
    let bitrate_kbps = opus_bitrate_kbps(channels);

    vec![
        ("--acodec".to_string(), Some("libopus".to_string())),
        ("--ab".to_string(), Some(format!("{bitrate_kbps}k"))),
    ]
}

/// 64 kbps per channel pair, per `ab-av1`'s own Opus guidance, floor 96k.
fn opus_bitrate_kbps(channels: i64) -> i64 {
    (channels * 32).max(96)
}

fn to_pairs(args: Vec<String>) -> Vec<(String, Option<String>)> {
    let mut pairs = Vec::new();
    let mut iter = args.into_iter().peekable();
    while let Some(token) = iter.next() {
        if token.starts_with("--") {
            let value = match iter.peek() {
                Some(next) if !next.starts_with("--") => iter.next(),
                _ => None,
            };
            pairs.push((token, value));
        } else {
            // A bare positional (subcommand name, path) — keyed by itself so
            // it never collides with a flag and is never overridden.
            pairs.push((token, None));
        }
    }
    pairs
}

/// Appends `incoming` onto `flags`, replacing any existing entry with the
/// same name so later sources win.
fn merge(flags: &mut Vec<(String, Option<String>)>, incoming: Vec<(String, Option<String>)>) {
    for (name, value) in incoming {
        if let Some(existing) = flags.iter_mut().find(|(n, _)| *n == name) {
            *existing = (name, value);
        } else {
            flags.push((name, value));
        }
    }
}

fn flatten(flags: Vec<(String, Option<String>)>) -> Vec<String> {
    let mut out = Vec::with_capacity(flags.len() * 2);
    for (name, value) in flags {
        out.push(name);
        if let Some(value) = value {
            out.push(value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::VideoState;
    use chrono::Utc;

    fn video(audio_codecs: Vec<&str>, hdr: Option<&str>, atmos: bool, channels: i64) -> Video {
        Video {
            id: 1,
            path: "/videos/in.mkv".to_string(),
            library_id: None,
            service_id: None,
            service_type: None,
            width: Some(1920),
            height: Some(1080),
            bitrate: Some(8_000_000),
            max_audio_channels: Some(channels),
            duration: Some(3600.0),
            frame_rate: Some(23.976),
            video_codecs: vec!["H264".to_string()],
            audio_codecs: audio_codecs.into_iter().map(str::to_string).collect(),
            size: 1_000_000_000,
            title: None,
            hdr: hdr.map(str::to_string),
            atmos,
            state: VideoState::Analyzed,
            chosen_vmaf_id: None,
            inserted_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn overrides_beat_rules_beat_base() {
        let v = video(vec!["DTS"], None, false, 2);
        let base = vec!["--min-vmaf".to_string(), "95".to_string()];
        let overrides = vec!["--ab".to_string(), "256k".to_string()];
        let args = build_args(&v, Stage::Encode, base, &overrides);
        assert!(args.windows(2).any(|w| w == ["--ab", "256k"]));
        assert!(args.windows(2).any(|w| w == ["--min-vmaf", "95"]));
    }

    #[test]
    fn crf_search_suppresses_audio_flags() {
        let v = video(vec!["DTS"], None, false, 6);
        let args = build_args(&v, Stage::CrfSearch, vec![], &[]);
        assert!(!args.contains(&"--acodec".to_string()));
        assert!(!args.contains(&"--ab".to_string()));
    }

    #[test]
    fn av1_compatible_audio_is_copied() {
        let v = video(vec!["AAC"], None, false, 2);
        let args = build_args(&v, Stage::Encode, vec![], &[]);
        assert!(args.windows(2).any(|w| w == ["--acodec", "copy"]));
    }

    #[test]
    fn incompatible_audio_is_reencoded_to_opus_scaled_by_channels() {
        let v = video(vec!["DTS"], None, false, 6);
        let args = build_args(&v, Stage::Encode, vec![], &[]);
        assert!(args.windows(2).any(|w| w == ["--acodec", "libopus"]));
        assert!(args.windows(2).any(|w| w == ["--ab", "192k"]));
    }

    #[test]
    fn hdr_passthrough_flag_present_only_for_hdr_sources() {
        let hdr = video(vec!["AAC"], Some("HDR10"), false, 2);
        let sdr = video(vec!["AAC"], None, false, 2);
        assert!(build_args(&hdr, Stage::Encode, vec![], &[]).contains(&"--hdr-passthrough".to_string()));
        assert!(!build_args(&sdr, Stage::Encode, vec![], &[]).contains(&"--hdr-passthrough".to_string()));
    }

    #[test]
    fn atmos_preserved_only_during_encode() {
        let v = video(vec!["AAC"], None, true, 2);
        assert!(build_args(&v, Stage::Encode, vec![], &[]).contains(&"--preserve-atmos".to_string()));
        assert!(!build_args(&v, Stage::CrfSearch, vec![], &[]).contains(&"--preserve-atmos".to_string()));
    }

    #[test]
    fn identical_inputs_yield_identical_output() {
        let v = video(vec!["DTS"], Some("DV"), true, 8);
        let a = build_args(&v, Stage::Encode, vec!["--input".to_string(), "x".to_string()], &[]);
        let b = build_args(&v, Stage::Encode, vec!["--input".to_string(), "x".to_string()], &[]);
        assert_eq!(a, b);
    }
}
