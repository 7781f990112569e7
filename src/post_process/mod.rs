//! Swaps a finished encode artifact into place over its source file.
//!
//! Delegated to an external collaborator whose own interface is out of
//! scope here; expressed as a trait so the Encoder Worker can be exercised
//! without a real media-library client.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

/// Atomically replaces a source media file with a freshly encoded one.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Moves `encoded_path` over `source_path`, removing the temp artifact
    /// on success. Implementations should prefer an in-place rename and
    /// fall back to copy+remove when source and destination are on
    /// different filesystems.
    async fn swap_into_place(&self, encoded_path: &Path, source_path: &Path) -> std::io::Result<()>;
}

/// The default filesystem implementation: `rename`, falling back to
/// `copy` + `remove_file` across filesystem boundaries.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilesystemOutputSink;

#[async_trait]
impl OutputSink for FilesystemOutputSink {
    async fn swap_into_place(&self, encoded_path: &Path, source_path: &Path) -> std::io::Result<()> {
        let encoded_path = encoded_path.to_path_buf();
        let source_path = source_path.to_path_buf();

        tokio::task::spawn_blocking(move || rename_or_copy(&encoded_path, &source_path))
            .await
            .unwrap_or_else(|e| Err(std::io::Error::other(e)))
    }
}

fn rename_or_copy(encoded_path: &Path, source_path: &Path) -> std::io::Result<()> {
    match std::fs::rename(encoded_path, source_path) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            debug!(from = ?encoded_path, to = ?source_path, "cross-device rename, falling back to copy");
            std::fs::copy(encoded_path, source_path)?;
            if let Err(e) = std::fs::remove_file(encoded_path) {
                warn!(path = ?encoded_path, error = %e, "failed to clean up temp artifact after copy fallback");
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn is_cross_device(error: &std::io::Error) -> bool {
    error.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(not(unix))]
fn is_cross_device(_error: &std::io::Error) -> bool {
    false
}

/// A no-op sink for tests: records the last swap it was asked to perform
/// without touching the filesystem.
#[derive(Default)]
pub struct NullOutputSink {
    pub last_swap: std::sync::Mutex<Option<(PathBuf, PathBuf)>>,
}

#[async_trait]
impl OutputSink for NullOutputSink {
    async fn swap_into_place(&self, encoded_path: &Path, source_path: &Path) -> std::io::Result<()> {
        *self.last_swap.lock().unwrap() = Some((encoded_path.to_path_buf(), source_path.to_path_buf()));
        Ok(())
    }
}

/// Picks the output extension for an encode: `.mp4` iff the source's
/// extension is `.mp4`, else `.mkv`.
pub fn output_extension(source_path: &Path) -> &'static str {
    match source_path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("mp4") => "mp4",
        _ => "mkv",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_sink_records_the_swap_without_touching_disk() {
        let sink = NullOutputSink::default();
        sink.swap_into_place(Path::new("/tmp/1.mkv"), Path::new("/videos/1.mkv")).await.unwrap();
        let recorded = sink.last_swap.lock().unwrap().clone();
        assert_eq!(recorded, Some((PathBuf::from("/tmp/1.mkv"), PathBuf::from("/videos/1.mkv"))));
    }

    #[test]
    fn mp4_source_keeps_mp4_extension() {
        assert_eq!(output_extension(Path::new("/videos/movie.mp4")), "mp4");
    }

    #[test]
    fn non_mp4_source_falls_back_to_mkv() {
        assert_eq!(output_extension(Path::new("/videos/movie.avi")), "mkv");
        assert_eq!(output_extension(Path::new("/videos/movie.mkv")), "mkv");
    }

    #[tokio::test]
    async fn filesystem_sink_renames_within_same_directory() {
        let dir = std::env::temp_dir().join(format!("reencodarr-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let encoded = dir.join("encoded.mkv");
        let source = dir.join("source.mkv");
        std::fs::write(&encoded, b"fake encode").unwrap();
        std::fs::write(&source, b"fake source").unwrap();

        let sink = FilesystemOutputSink;
        sink.swap_into_place(&encoded, &source).await.unwrap();

        assert!(!encoded.exists());
        assert_eq!(std::fs::read(&source).unwrap(), b"fake encode");

        std::fs::remove_dir_all(&dir).ok();
    }
}
