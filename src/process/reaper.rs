//! Command-prefix hooks used at startup to kill children of a prior crashed run.

use super::runner::kill_orphans_matching;

/// Prefix used to match stray `ab-av1 crf-search` invocations.
pub const CRF_SEARCH_PREFIX: &str = "ab-av1 crf-search";

/// Prefix used to match stray `ab-av1 encode` invocations.
pub const ENCODE_PREFIX: &str = "ab-av1 encode";

/// Kills any residual `ab-av1 crf-search` or `ab-av1 encode` processes left
/// over from a prior crashed run.
pub fn kill_stale_pipeline_processes() {
    kill_orphans_matching(CRF_SEARCH_PREFIX);
    kill_orphans_matching(ENCODE_PREFIX);
}
