//! Scratch storage for uploaded images.
//!
//! An upload is written to the uploads directory, handed to the classifier by
//! path and removed again before the request completes.
use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Context, Result};
use common::protocol::Classification;
use unicode_normalization::UnicodeNormalization;

use crate::{config::CleanupPolicy, nn::Classifier};

/// Name used when nothing usable is left of a client supplied filename.
const FALLBACK_NAME: &str = "upload";

/// Make a client supplied filename safe to use as a single path component.
///
/// The name is NFKD normalized so accented letters keep their ASCII base.
/// Path separators and whitespace split the name into parts that are joined
/// with `_`, everything except ASCII alphanumerics, `.`, `-` and `_` is
/// dropped and leading/trailing dots and underscores are trimmed, so that
/// `../../etc/passwd.jpg` becomes `etc_passwd.jpg`. A name with nothing left
/// but its extension keeps the extension on the fallback name.
pub fn sanitize_filename(name: &str) -> String {
    let joined = name
        .split(|c: char| c == '/' || c == '\\' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");

    let kept: String = joined
        .nfkd()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();

    let trim = |s: &str| s.trim_matches(|c| c == '.' || c == '_').to_owned();

    if let Some((stem, extension)) = kept.rsplit_once('.') {
        let extension = trim(extension);
        if trim(stem).is_empty() && !extension.is_empty() {
            return format!("{FALLBACK_NAME}.{extension}");
        }
    }

    match trim(&kept).as_str() {
        "" => FALLBACK_NAME.to_owned(),
        trimmed => trimmed.to_owned(),
    }
}

/// Directory holding the scratch files of in-flight uploads.
pub struct UploadStore {
    dir: PathBuf,
    cleanup: CleanupPolicy,
    seq: AtomicU64,
}

impl UploadStore {
    /// Use `dir` as uploads directory, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>, cleanup: CleanupPolicy) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            cleanup,
            seq: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path for the next scratch file of an upload named `filename`.
    ///
    /// The sequence prefix keeps concurrent uploads of equally named files
    /// apart.
    pub fn scratch_path(&self, filename: &str) -> PathBuf {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!("{seq}-{}", sanitize_filename(filename)))
    }

    /// Write an upload to a fresh scratch file.
    pub async fn persist(&self, filename: &str, data: &[u8]) -> io::Result<ScratchFile> {
        // The guard exists before the write so a partial file is removed too
        let scratch = ScratchFile::new(self.scratch_path(filename), self.cleanup);
        tokio::fs::write(scratch.path(), data).await?;
        log::debug!("Stored {} bytes at {}", data.len(), scratch.path().display());

        Ok(scratch)
    }
}

/// A file that is removed when the guard is released or dropped.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    cleanup: CleanupPolicy,
    released: bool,
}

impl ScratchFile {
    pub fn new(path: PathBuf, cleanup: CleanupPolicy) -> Self {
        Self {
            path,
            cleanup,
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file, retrying with exponential backoff while it is locked.
    ///
    /// Returns whether the file is gone. Failures are logged, never returned.
    pub async fn release(mut self) -> bool {
        self.released = true;
        remove_with_retry(&self.path, self.cleanup).await
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::debug!("Removed abandoned {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => (),
            Err(e) => log::warn!("Could not delete {}: {e}", self.path.display()),
        }
    }
}

async fn remove_with_retry(path: &Path, policy: CleanupPolicy) -> bool {
    let attempts = policy.attempts.max(1);
    let mut backoff = policy.initial_backoff;

    for attempt in 1..=attempts {
        match tokio::fs::remove_file(path).await {
            Ok(()) => return true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return true,
            Err(e) if attempt == attempts => {
                log::warn!(
                    "Could not delete {} after {attempts} attempts, it might be locked by another process: {e}",
                    path.display()
                );
            }
            Err(e) => {
                log::debug!("Attempt {attempt} to delete {} failed: {e}", path.display());
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
    }

    false
}

/// Store an upload, classify it and remove it again.
///
/// Classifier errors are returned to the caller, the scratch file is removed
/// in either case.
pub async fn classify_upload(
    store: &UploadStore,
    classifier: Arc<dyn Classifier>,
    filename: &str,
    data: &[u8],
) -> Result<Classification> {
    let scratch = store
        .persist(filename, data)
        .await
        .context("failed to store upload")?;

    let path = scratch.path().to_owned();
    let result = tokio::task::spawn_blocking(move || classifier.classify(&path)).await;

    scratch.release().await;

    result.map_err(|e| anyhow!("classification task failed: {e}"))?
}

#[cfg(test)]
mod test {
    use std::{path::Component, time::Duration};

    use super::*;

    fn temp_uploads_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("waste_server-upload-{name}-{}", std::process::id()))
    }

    fn quick_policy() -> CleanupPolicy {
        CleanupPolicy {
            attempts: 3,
            initial_backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_sanitize_filename() {
        let cases = [
            ("../../etc/passwd.jpg", "etc_passwd.jpg"),
            ("My cool movie.mov", "My_cool_movie.mov"),
            ("..\\..\\windows\\win.ini", "windows_win.ini"),
            ("i contain cool \u{fc}ml\u{e4}uts.txt", "i_contain_cool_umlauts.txt"),
            ("Caf\u{e9} cr\u{e8}me.png", "Cafe_creme.png"),
            ("bottle.png", "bottle.png"),
            ("..", FALLBACK_NAME),
            ("", FALLBACK_NAME),
            ("/", FALLBACK_NAME),
            ("\u{5783}\u{573e}.jpg", "upload.jpg"),
            (".jpg", "upload.jpg"),
            ("jpg", "jpg"),
        ];

        for (input, expected) in cases {
            assert_eq!(sanitize_filename(input), expected, "input {input:?}");
        }
    }

    #[test]
    fn test_scratch_path_stays_inside_uploads_dir() {
        let dir = temp_uploads_dir("inside");
        let store = UploadStore::new(&dir, quick_policy()).unwrap();

        let hostile = [
            "../../etc/passwd.jpg",
            "/etc/passwd",
            "..",
            ".",
            "a/../../b",
            "C:\\Windows\\system32",
            "....//....//x",
            "\0nul.jpg",
            " ",
        ];

        for name in hostile {
            let path = store.scratch_path(name);
            assert_eq!(path.parent(), Some(store.dir()), "input {name:?}");

            let last = path.components().last();
            assert!(
                matches!(last, Some(Component::Normal(_))),
                "input {name:?} gave {path:?}"
            );
        }

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_scratch_paths_are_unique() {
        let dir = temp_uploads_dir("unique");
        let store = UploadStore::new(&dir, quick_policy()).unwrap();

        assert_ne!(store.scratch_path("a.jpg"), store.scratch_path("a.jpg"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_release_removes_file() {
        let dir = temp_uploads_dir("release");
        let store = UploadStore::new(&dir, quick_policy()).unwrap();

        let scratch = store.persist("can.jpg", b"not really a jpeg").await.unwrap();
        let path = scratch.path().to_owned();
        assert!(path.exists());

        assert!(scratch.release().await);
        assert!(!path.exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_release_of_missing_file_succeeds() {
        let dir = temp_uploads_dir("missing");
        let store = UploadStore::new(&dir, quick_policy()).unwrap();

        let scratch = store.persist("gone.jpg", b"data").await.unwrap();
        std::fs::remove_file(scratch.path()).unwrap();

        assert!(scratch.release().await);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_drop_removes_unreleased_file() {
        let dir = temp_uploads_dir("drop");
        let store = UploadStore::new(&dir, quick_policy()).unwrap();

        let path = {
            let scratch = store.persist("paper.jpg", b"data").await.unwrap();
            scratch.path().to_owned()
        };
        assert!(!path.exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_failed_removal_is_swallowed() {
        let dir = temp_uploads_dir("locked");
        let store = UploadStore::new(&dir, quick_policy()).unwrap();

        // A non-empty directory in place of the file cannot be removed with `remove_file`
        let path = store.scratch_path("locked.jpg");
        std::fs::create_dir_all(path.join("inner")).unwrap();
        let scratch = ScratchFile::new(path.clone(), quick_policy());

        assert!(!scratch.release().await);
        assert!(path.exists());

        std::fs::remove_dir_all(&dir).ok();
    }
}
