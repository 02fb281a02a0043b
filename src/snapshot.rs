//! On-demand snapshots of the latest frame.
//!
//! A snapshot reads the shared slot without waiting on the supervisor, encodes outside any
//! lock, and may return a stale frame with its original sequence number. Nothing here talks
//! to the camera: only the supervisor may touch the open transport.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};

use crate::codec::encode_jpeg;
use crate::error::SnapshotError;
use crate::supervisor::CameraContext;

pub const DEFAULT_SNAPSHOT_QUALITY: u8 = 95;
const MAX_NAME_SUFFIX: u32 = 1000;

#[derive(Clone, Debug)]
pub struct SnapshotResult {
    pub jpeg: Vec<u8>,
    /// Bare file name ending in `.jpg`.
    pub filename: String,
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug)]
pub struct SnapshotService {
    context: Arc<CameraContext>,
    default_quality: u8,
    directory: PathBuf,
}

impl SnapshotService {
    pub fn new(
        context: Arc<CameraContext>,
        default_quality: u8,
        directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            context,
            default_quality,
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Encode the most recent frame.
    pub fn snapshot(
        &self,
        quality: Option<u8>,
        filename_hint: Option<&str>,
    ) -> Result<SnapshotResult, SnapshotError> {
        let quality = quality.unwrap_or(self.default_quality);
        if !(1..=100).contains(&quality) {
            return Err(SnapshotError::InvalidQuality(quality));
        }
        let frame = self
            .context
            .slot()
            .latest()
            .ok_or(SnapshotError::NoFrameAvailable)?;

        let jpeg = encode_jpeg(frame.pixels(), frame.width, frame.height, quality)?;
        let filename = filename_hint
            .and_then(sanitize_filename)
            .unwrap_or_else(|| default_filename(Local::now()));
        Ok(SnapshotResult {
            jpeg,
            filename,
            sequence: frame.sequence,
            width: frame.width,
            height: frame.height,
        })
    }

    /// Write a snapshot into the snapshot directory without overwriting anything.
    /// Returns the path actually written; a `-N` suffix is added on name collisions.
    pub fn save(&self, result: &SnapshotResult) -> Result<PathBuf, SnapshotError> {
        fs::create_dir_all(&self.directory)?;
        let stem = result
            .filename
            .strip_suffix(".jpg")
            .unwrap_or(&result.filename);

        for n in 0..MAX_NAME_SUFFIX {
            let name = if n == 0 {
                format!("{stem}.jpg")
            } else {
                format!("{stem}-{n}.jpg")
            };
            let path = self.directory.join(name);
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            };
            if let Err(err) = file.write_all(&result.jpeg).and_then(|()| file.sync_all()) {
                drop(file);
                let _ = fs::remove_file(&path);
                return Err(err.into());
            }
            log::info!(
                "snapshot {} (sequence {}) saved to {}",
                result.filename,
                result.sequence,
                path.display()
            );
            return Ok(path);
        }
        Err(SnapshotError::Io(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free file name for {stem}.jpg"),
        )))
    }

    /// Snapshot and save in one step.
    pub fn capture(
        &self,
        quality: Option<u8>,
        filename_hint: Option<&str>,
    ) -> Result<(SnapshotResult, PathBuf), SnapshotError> {
        let result = self.snapshot(quality, filename_hint)?;
        let path = self.save(&result)?;
        Ok((result, path))
    }
}

pub fn default_filename(at: DateTime<Local>) -> String {
    format!("snapshot_{}.jpg", at.format("%Y%m%d_%H%M%S_%3f"))
}

/// Reduce a caller-supplied name to a bare, safe `.jpg` file name.
fn sanitize_filename(hint: &str) -> Option<String> {
    let base = Path::new(hint.trim()).file_name()?.to_str()?;
    let stem = match base.rsplit_once('.') {
        Some((stem, ext))
            if ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg") =>
        {
            stem
        }
        _ => base,
    };
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        None
    } else {
        Some(format!("{cleaned}.jpg"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{CameraEndpoint, Credentials};
    use crate::frame::{CapturedImage, Frame};

    fn context_with_frame(sequence: Option<u64>) -> Arc<CameraContext> {
        let context = CameraContext::new(
            CameraEndpoint::new("cam", Credentials::default(), 80, 554, "test").unwrap(),
        );
        if let Some(sequence) = sequence {
            context.slot().publish(Frame::new(
                CapturedImage::new(vec![90; 32 * 24 * 3], 32, 24),
                sequence,
            ));
        }
        context
    }

    #[test]
    fn no_frame_is_an_explicit_failure() {
        let dir = tempfile::tempdir().unwrap();
        let service = SnapshotService::new(context_with_frame(None), 95, dir.path());
        assert!(matches!(
            service.snapshot(None, None),
            Err(SnapshotError::NoFrameAvailable)
        ));
        assert!(matches!(
            service.capture(None, None),
            Err(SnapshotError::NoFrameAvailable)
        ));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn snapshot_carries_frame_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let service = SnapshotService::new(context_with_frame(Some(42)), 95, dir.path());
        let result = service.snapshot(Some(50), None).unwrap();
        assert_eq!(result.sequence, 42);
        assert_eq!((result.width, result.height), (32, 24));
        assert_eq!(&result.jpeg[..2], &[0xFF, 0xD8]);
        assert!(result.filename.starts_with("snapshot_"));
        assert!(result.filename.ends_with(".jpg"));
    }

    #[test]
    fn quality_is_validated() {
        let service = SnapshotService::new(context_with_frame(Some(1)), 95, "unused");
        assert!(matches!(
            service.snapshot(Some(0), None),
            Err(SnapshotError::InvalidQuality(0))
        ));
        assert!(matches!(
            service.snapshot(Some(101), None),
            Err(SnapshotError::InvalidQuality(101))
        ));
    }

    #[test]
    fn save_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested");
        let service = SnapshotService::new(context_with_frame(Some(3)), 95, &target);

        let (_, first) = service.capture(None, Some("door")).unwrap();
        let (_, second) = service.capture(None, Some("door.jpg")).unwrap();
        assert_eq!(first, target.join("door.jpg"));
        assert_eq!(second, target.join("door-1.jpg"));
        assert!(fs::metadata(&first).unwrap().len() > 0);
    }

    #[test]
    fn filename_hints_are_sanitized() {
        assert_eq!(sanitize_filename("../../etc/passwd").as_deref(), Some("passwd.jpg"));
        assert_eq!(sanitize_filename("front door.JPEG").as_deref(), Some("front_door.jpg"));
        assert_eq!(sanitize_filename("shot.png").as_deref(), Some("shot.png.jpg"));
        assert_eq!(sanitize_filename("   "), None);
        assert_eq!(sanitize_filename(".."), None);
    }
}
