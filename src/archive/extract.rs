//! Local archive extraction
//!
//! Every entry name is checked before the destination is touched, so an
//! archive carrying a traversal entry is rejected as a whole and the previous
//! tree stays in place.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, error, info, warn};
use zip::ZipArchive;

use crate::error::{Abort, ProvisionError, StepResult};
use crate::progress::{phases, PhaseBand, Reporter};
use crate::session::Session;

const CHUNK_SIZE: usize = 64 * 1024;

/// One validated archive entry.
struct PlannedEntry {
    index: usize,
    relative: PathBuf,
    is_dir: bool,
}

/// Unpacks a downloaded archive into a fully replaced destination.
pub struct Extractor {
    band: PhaseBand,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor {
    pub fn new() -> Self {
        Self {
            band: phases::EXTRACT,
        }
    }

    /// Extract `local_archive` into `destination` and return the number of
    /// files written. The archive is deleted and untracked on success.
    pub async fn extract(
        &self,
        session: &Session,
        local_archive: &Path,
        destination: &Path,
        reporter: &Reporter,
    ) -> StepResult<usize> {
        if reporter.is_cancelled() {
            return Err(Abort::Cancelled);
        }
        info!(
            "[{}] extracting {} into {}",
            session.id(),
            local_archive.display(),
            destination.display()
        );
        reporter.progress(
            self.band.start,
            &format!("Extracting into {}", destination.display()),
        );

        let archive = local_archive.to_path_buf();
        let target = destination.to_path_buf();
        let worker_reporter = reporter.clone();
        let band = self.band;
        let result = tokio::task::spawn_blocking(move || {
            extract_blocking(&archive, &target, &worker_reporter, band)
        })
        .await
        .map_err(|e| ProvisionError::Extraction {
            path: local_archive.to_path_buf(),
            message: format!("extraction task failed: {}", e),
        })?;

        let files = match result {
            Ok(files) => files,
            Err(Abort::Cancelled) => {
                info!("[{}] extraction cancelled", session.id());
                // The old tree is already gone; don't leave half of the new one
                if let Err(e) = tokio::fs::remove_dir_all(destination).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(
                            "[{}] could not remove partial {}: {}",
                            session.id(),
                            destination.display(),
                            e
                        );
                    }
                }
                return Err(Abort::Cancelled);
            }
            Err(Abort::Failed(e)) => {
                error!("[{}] extraction failed: {}", session.id(), e);
                return Err(Abort::Failed(e));
            }
        };

        match tokio::fs::remove_file(local_archive).await {
            Ok(()) => session.untrack_local_file(local_archive),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                session.untrack_local_file(local_archive)
            }
            Err(e) => warn!(
                "[{}] could not remove {}: {}",
                session.id(),
                local_archive.display(),
                e
            ),
        }

        info!("[{}] extracted {} files", session.id(), files);
        reporter.progress(self.band.end, &format!("Extracted {} files", files));
        Ok(files)
    }
}

fn extract_blocking(
    archive_path: &Path,
    destination: &Path,
    reporter: &Reporter,
    band: PhaseBand,
) -> StepResult<usize> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| ProvisionError::Extraction {
        path: archive_path.to_path_buf(),
        message: format!("unreadable archive: {}", e),
    })?;

    let plan = plan_entries(&mut archive, archive_path)?;
    replace_destination(destination)?;

    let total = plan.len().max(1);
    let mut files = 0usize;
    let mut last_percent = band.start;
    // Directory modes wait until their contents exist, a read-only
    // directory would otherwise refuse its own children
    let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();

    for (n, entry) in plan.iter().enumerate() {
        if reporter.is_cancelled() {
            return Err(Abort::Cancelled);
        }

        let out_path = destination.join(&entry.relative);
        let mut zipped = archive
            .by_index(entry.index)
            .map_err(|e| ProvisionError::Extraction {
                path: out_path.clone(),
                message: e.to_string(),
            })?;

        if entry.is_dir {
            fs::create_dir_all(&out_path)?;
            if let Some(mode) = zipped.unix_mode() {
                dir_modes.push((out_path, mode));
            }
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            copy_entry(&mut zipped, &out_path, reporter)?;
            if let Some(mode) = zipped.unix_mode() {
                apply_mode(&out_path, mode);
            }
            files += 1;
        }

        let percent = band
            .at_fraction((n + 1) as f64 / total as f64)
            .min(band.end.saturating_sub(1));
        if percent > last_percent {
            reporter.progress(percent, &format!("Extracting: {}/{} entries", n + 1, plan.len()));
            last_percent = percent;
        }
    }

    // Deepest first so a parent is still writable while its children change
    dir_modes.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
    for (path, mode) in &dir_modes {
        apply_mode(path, *mode);
    }

    Ok(files)
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        debug!("could not set mode {:o} on {}: {}", mode, path.display(), e);
    }
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) {}

/// Validate every entry name up front.
fn plan_entries(
    archive: &mut ZipArchive<File>,
    archive_path: &Path,
) -> Result<Vec<PlannedEntry>, ProvisionError> {
    let mut plan = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .map_err(|e| ProvisionError::Extraction {
                path: archive_path.to_path_buf(),
                message: e.to_string(),
            })?;
        if matches!(entry.name(), "./" | ".") {
            continue;
        }
        let relative = safe_relative_path(entry.name(), entry.enclosed_name()).ok_or_else(|| {
            ProvisionError::Extraction {
                path: PathBuf::from(entry.name()),
                message: "entry escapes the destination directory".to_string(),
            }
        })?;
        plan.push(PlannedEntry {
            index,
            relative,
            is_dir: entry.is_dir(),
        });
    }
    Ok(plan)
}

/// Only plain, relative components survive.
fn safe_relative_path(raw_name: &str, enclosed: Option<PathBuf>) -> Option<PathBuf> {
    let enclosed = enclosed?;
    if raw_name.split(['/', '\\']).any(|part| part == "..") {
        return None;
    }
    let clean: PathBuf = enclosed
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    let all_normal = clean
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    (all_normal && clean.components().next().is_some()).then_some(clean)
}

fn replace_destination(destination: &Path) -> Result<(), ProvisionError> {
    match fs::remove_dir_all(destination) {
        Ok(()) => debug!("removed previous {}", destination.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(ProvisionError::Extraction {
                path: destination.to_path_buf(),
                message: format!("could not clear destination: {}", e),
            })
        }
    }
    fs::create_dir_all(destination)?;
    Ok(())
}

fn copy_entry(reader: &mut impl Read, out_path: &Path, reporter: &Reporter) -> StepResult<u64> {
    let mut out = File::create(out_path)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        if reporter.is_cancelled() {
            return Err(Abort::Cancelled);
        }
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        written += n as u64;
    }
    out.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::testing::RecordingCallback;
    use crate::session::testing::{zip_fixture, zip_fixture_with_modes, FakeTransport};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn setup() -> (Session, Arc<RecordingCallback>, Reporter) {
        let session = Session::with_transport("abc", "test", "u@h:22", FakeTransport::new());
        let cb = RecordingCallback::new();
        let reporter = Reporter::new(cb.clone(), session.control().clone());
        (session, cb, reporter)
    }

    fn write_archive(dir: &Path, entries: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join("provision_abc.zip");
        fs::write(&path, zip_fixture(entries)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_extract_replaces_destination() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("java");
        fs::create_dir_all(dest.join("old")).unwrap();
        fs::write(dest.join("old/stale.jar"), b"stale").unwrap();
        fs::write(dest.join("keep.txt"), b"old contents").unwrap();

        let archive = write_archive(
            temp.path(),
            &[
                ("lib/", b""),
                ("lib/a.jar", b"aaaa"),
                ("keep.txt", b"new contents"),
                ("conf/app.properties", b"x=1"),
            ],
        );
        let (session, cb, reporter) = setup();
        session.track_local_file(&archive);

        let files = Extractor::new()
            .extract(&session, &archive, &dest, &reporter)
            .await
            .unwrap();

        assert_eq!(files, 3);
        assert!(!dest.join("old").exists());
        assert_eq!(fs::read(dest.join("keep.txt")).unwrap(), b"new contents");
        assert_eq!(fs::read(dest.join("lib/a.jar")).unwrap(), b"aaaa");
        assert!(dest.join("conf/app.properties").is_file());

        assert!(!archive.exists());
        assert!(session.tracked_local_files().is_empty());

        let percents = cb.percents();
        assert!(percents.iter().all(|p| (80..=95).contains(p)));
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(percents.last(), Some(&95));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_read_only_directory_keeps_its_contents() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("java");
        let archive = temp.path().join("provision_abc.zip");
        fs::write(
            &archive,
            zip_fixture_with_modes(&[
                ("bin/", b"", 0o555),
                ("bin/tools/", b"", 0o555),
                ("bin/tools/run.sh", b"#!/bin/sh\n", 0o755),
                ("bin/start.sh", b"exec java\n", 0o644),
            ]),
        )
        .unwrap();
        let (session, _cb, reporter) = setup();

        let files = Extractor::new()
            .extract(&session, &archive, &dest, &reporter)
            .await
            .unwrap();

        let mode_of = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(files, 2);
        assert_eq!(fs::read(dest.join("bin/start.sh")).unwrap(), b"exec java\n");
        assert_eq!(fs::read(dest.join("bin/tools/run.sh")).unwrap(), b"#!/bin/sh\n");
        assert_eq!(mode_of(&dest.join("bin")), 0o555);
        assert_eq!(mode_of(&dest.join("bin/tools")), 0o555);
        assert_eq!(mode_of(&dest.join("bin/tools/run.sh")), 0o755);

        // Let the tempdir clean up after itself
        for dir in ["bin", "bin/tools"] {
            fs::set_permissions(dest.join(dir), fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    #[tokio::test]
    async fn test_traversal_entry_rejects_whole_archive() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("a/b/java");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("existing.jar"), b"keep me").unwrap();

        let archive = write_archive(
            temp.path(),
            &[("ok.txt", b"fine"), ("../../evil.txt", b"gotcha")],
        );
        let (session, _cb, reporter) = setup();
        session.track_local_file(&archive);

        let err = Extractor::new()
            .extract(&session, &archive, &dest, &reporter)
            .await
            .unwrap_err();

        assert!(matches!(err, Abort::Failed(ProvisionError::Extraction { .. })));
        assert!(!temp.path().join("a/evil.txt").exists());
        assert!(!temp.path().join("evil.txt").exists());
        assert!(!dest.join("ok.txt").exists());
        assert_eq!(fs::read(dest.join("existing.jar")).unwrap(), b"keep me");
        // Archive stays tracked for close()
        assert_eq!(session.tracked_local_files(), vec![archive]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_touches_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("java");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("existing.jar"), b"keep me").unwrap();
        let archive = write_archive(temp.path(), &[("a.txt", b"a")]);

        let (session, cb, reporter) = setup();
        cb.cancel.store(true, Ordering::SeqCst);

        let err = Extractor::new()
            .extract(&session, &archive, &dest, &reporter)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(dest.join("existing.jar").exists());
        assert!(archive.exists());
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_extraction_error() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("broken.zip");
        fs::write(&archive, b"not a zip").unwrap();
        let (session, _cb, reporter) = setup();

        let err = Extractor::new()
            .extract(&session, &archive, &temp.path().join("java"), &reporter)
            .await
            .unwrap_err();
        assert!(matches!(err, Abort::Failed(ProvisionError::Extraction { .. })));
    }

    #[test]
    fn test_safe_relative_path() {
        let ok = safe_relative_path("lib/./a.jar", Some(PathBuf::from("lib/./a.jar")));
        assert_eq!(ok, Some(PathBuf::from("lib/a.jar")));
        assert_eq!(safe_relative_path("/etc/passwd", None), None);
        assert_eq!(
            safe_relative_path("lib/../a.jar", Some(PathBuf::from("a.jar"))),
            None
        );
        assert_eq!(safe_relative_path("./", Some(PathBuf::from("."))), None);
    }
}
