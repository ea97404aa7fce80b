//! Evidence image persistence.
//!
//! Each image is written once to the archive root (`uploads/faces`) and
//! once to the public root (`uploads/photos`) under the same name. Files are
//! create-only: a call never overwrites an existing file, and either leaves
//! both copies on disk or neither.

use crate::types::FaceImagePair;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Logical prefix of archive paths handed to callers.
pub const FACES_PREFIX: &str = "uploads/faces";
/// Logical prefix of public paths handed to callers.
pub const PHOTOS_PREFIX: &str = "uploads/photos";

/// Cameras are inconsistent about trailing `=` padding.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Name collisions tolerated before giving up on a unique file name.
const MAX_NAME_ATTEMPTS: u32 = 100;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("payload is not an inline jpeg/jpg/png data URI")]
    InvalidFormat,
    #[error("directory not writable: {}", .0.display())]
    DirectoryNotWritable(PathBuf),
    #[error("image payload could not be decoded: {0}")]
    Decode(String),
    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to copy image to {}: {source}", path.display())]
    Copy { path: PathBuf, source: io::Error },
    #[error("image write timed out after {0:?}")]
    TimedOut(Duration),
    #[error("image write task failed: {0}")]
    Interrupted(String),
}

/// Writes face images under an archive root and a public root.
#[derive(Debug, Clone)]
pub struct ImageStore {
    archive_dir: PathBuf,
    public_dir: PathBuf,
}

impl ImageStore {
    pub fn new(archive_dir: impl Into<PathBuf>, public_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            public_dir: public_dir.into(),
        }
    }

    /// Store rooted at a web root: `<root>/uploads/faces` and `<root>/uploads/photos`.
    pub fn under(web_root: &Path) -> Self {
        Self::new(web_root.join(FACES_PREFIX), web_root.join(PHOTOS_PREFIX))
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn public_dir(&self) -> &Path {
        &self.public_dir
    }

    /// Create both roots if missing and confirm they are writable.
    pub fn ensure_dirs(&self) -> Result<(), ImageError> {
        for dir in [&self.archive_dir, &self.public_dir] {
            if let Err(source) = fs::create_dir_all(dir) {
                return Err(ImageError::Write {
                    path: dir.clone(),
                    source,
                });
            }
            if !is_writable_dir(dir) {
                return Err(ImageError::DirectoryNotWritable(dir.clone()));
            }
            tracing::info!(path = %dir.display(), "upload directory ready");
        }
        Ok(())
    }

    /// Decode an inline `data:image/...;base64,` payload and store it as
    /// `<prefix><seed>_<unix_ts>.<ext>` under both roots.
    pub fn save(&self, payload: &str, prefix: &str, seed: &str) -> Result<FaceImagePair, ImageError> {
        tracing::debug!(preview = %payload.chars().take(50).collect::<String>(), "saving image payload");

        let (extension, encoded) = split_data_uri(payload).ok_or(ImageError::InvalidFormat)?;

        for dir in [&self.archive_dir, &self.public_dir] {
            if !is_writable_dir(dir) {
                return Err(ImageError::DirectoryNotWritable(dir.clone()));
            }
        }

        let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        let bytes = PAYLOAD_ENGINE
            .decode(compact.as_bytes())
            .map_err(|e| ImageError::Decode(e.to_string()))?;
        if bytes.is_empty() {
            return Err(ImageError::Decode("empty image".into()));
        }

        let stem = format!(
            "{prefix}{}_{}",
            sanitize_seed(seed),
            chrono::Utc::now().timestamp()
        );
        let (file_name, archive_path, public_path) = self.write_pair(&stem, extension, &bytes)?;

        for path in [&archive_path, &public_path] {
            if let Err(e) = set_world_readable(path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to set image permissions");
            }
        }

        tracing::info!(file = %file_name, bytes = bytes.len(), "image stored");

        Ok(FaceImagePair {
            faces_path: format!("{FACES_PREFIX}/{file_name}"),
            photos_path: format!("{PHOTOS_PREFIX}/{file_name}"),
        })
    }

    /// [`save`](Self::save) on the blocking pool with an upper bound on its
    /// duration. A write that completes after the deadline is removed in the
    /// background so it cannot leave an unreferenced pair behind.
    pub async fn save_bounded(
        &self,
        payload: &str,
        prefix: &str,
        seed: &str,
        limit: Duration,
    ) -> Result<FaceImagePair, ImageError> {
        let store = self.clone();
        let (payload, prefix, seed) = (payload.to_string(), prefix.to_string(), seed.to_string());
        let mut task = tokio::task::spawn_blocking(move || store.save(&payload, &prefix, &seed));

        match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ImageError::Interrupted(e.to_string())),
            Err(_) => {
                let store = self.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(pair)) = task.await {
                        tracing::warn!(file = %pair.file_name(), "removing image written after its deadline");
                        if let Err(e) = store.remove(&pair) {
                            tracing::error!(file = %pair.file_name(), error = %e, "late image cleanup failed");
                        }
                    }
                });
                Err(ImageError::TimedOut(limit))
            }
        }
    }

    /// [`remove`](Self::remove) on the blocking pool.
    pub async fn remove_async(&self, pair: &FaceImagePair) -> io::Result<()> {
        let store = self.clone();
        let pair = pair.clone();
        tokio::task::spawn_blocking(move || store.remove(&pair))
            .await
            .map_err(io::Error::other)?
    }

    /// Delete both copies of a stored pair. Missing files are not an error,
    /// so calling this more than once is safe.
    pub fn remove(&self, pair: &FaceImagePair) -> io::Result<()> {
        let name = pair.file_name();
        let mut first_err = None;
        for dir in [&self.archive_dir, &self.public_dir] {
            match fs::remove_file(dir.join(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) if first_err.is_none() => first_err = Some(e),
                Err(_) => {}
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Absolute archive path for a logical pair, for inspection.
    pub fn archive_path(&self, pair: &FaceImagePair) -> PathBuf {
        self.archive_dir.join(pair.file_name())
    }

    /// Absolute public path for a logical pair, for inspection.
    pub fn public_path(&self, pair: &FaceImagePair) -> PathBuf {
        self.public_dir.join(pair.file_name())
    }

    /// Create both copies exclusively under one name, suffixing `_<n>` when
    /// either root already has it. Only files created here are ever removed.
    fn write_pair(
        &self,
        stem: &str,
        extension: &str,
        bytes: &[u8],
    ) -> Result<(String, PathBuf, PathBuf), ImageError> {
        let mut public_taken = false;
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let file_name = if attempt == 0 {
                format!("{stem}.{extension}")
            } else {
                format!("{stem}_{attempt}.{extension}")
            };

            let archive_path = self.archive_dir.join(&file_name);
            match create_exclusive(&archive_path, bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(source) => {
                    return Err(ImageError::Write {
                        path: archive_path,
                        source,
                    })
                }
            }

            let public_path = self.public_dir.join(&file_name);
            match create_exclusive(&public_path, bytes) {
                Ok(()) => return Ok((file_name, archive_path, public_path)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    remove_if_present(&archive_path);
                    public_taken = true;
                }
                Err(source) => {
                    // Never leave the archive copy without its public twin.
                    remove_if_present(&archive_path);
                    return Err(ImageError::Copy {
                        path: public_path,
                        source,
                    });
                }
            }
        }

        let exhausted = io::Error::new(io::ErrorKind::AlreadyExists, "no free file name");
        let first = format!("{stem}.{extension}");
        if public_taken {
            Err(ImageError::Copy {
                path: self.public_dir.join(first),
                source: exhausted,
            })
        } else {
            Err(ImageError::Write {
                path: self.archive_dir.join(first),
                source: exhausted,
            })
        }
    }
}

/// Create `path`, failing if anything already exists there, and write
/// `bytes`. A partially written file is removed.
fn create_exclusive(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    if let Err(e) = file.write_all(bytes).and_then(|()| file.sync_all()) {
        drop(file);
        remove_if_present(path);
        return Err(e);
    }
    Ok(())
}

/// Split `data:image/<fmt>;base64,<data>` into (file extension, data).
fn split_data_uri(payload: &str) -> Option<(&'static str, &str)> {
    let rest = payload.strip_prefix("data:image/")?;
    let (format, data) = rest.split_once(";base64,")?;
    let extension = match format {
        "jpeg" | "jpg" => "jpg",
        "png" => "png",
        _ => return None,
    };
    Some((extension, data))
}

/// Keep `[A-Za-z0-9_-]`; everything else (dots, slashes) becomes `_`.
fn sanitize_seed(seed: &str) -> String {
    seed.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn is_writable_dir(dir: &Path) -> bool {
    fs::metadata(dir)
        .map(|m| m.is_dir() && !m.permissions().readonly())
        .unwrap_or(false)
}

fn remove_if_present(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove image");
        }
    }
}

#[cfg(unix)]
fn set_world_readable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_world_readable(_path: &Path) -> io::Result<()> {
    Ok(())
}
