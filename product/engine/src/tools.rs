use crate::config::DownloaderConfig;
use crate::paths::{exe_name, AppPaths};
use crate::{EngineError, Result};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Transport used to pull the ffmpeg archive down to a local file.
pub trait ArchiveFetcher: Send + Sync {
    fn fetch(&self, url: &str, destination: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpFetcher;

impl ArchiveFetcher for HttpFetcher {
    fn fetch(&self, url: &str, destination: &Path) -> Result<()> {
        let resp = ureq::get(url)
            .call()
            .map_err(|e| EngineError::FetchFailed(format!("download failed: {e}")))?;
        let status = resp.status();
        if status.as_u16() >= 400 {
            return Err(EngineError::FetchFailed(format!(
                "download failed (status={status})"
            )));
        }

        let mut reader = resp.into_body().into_reader();
        let mut file = std::fs::File::create(destination)?;
        std::io::copy(&mut reader, &mut file)?;
        file.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FfmpegToolsStatus {
    pub installed: bool,
    pub ffmpeg_path: String,
    pub ffmpeg_version: Option<String>,
}

pub fn ffmpeg_tools_status(paths: &AppPaths) -> FfmpegToolsStatus {
    let ffmpeg_path = paths.ffmpeg_bin_path();
    let installed = ffmpeg_path.exists();
    let program = if installed {
        ffmpeg_path.clone()
    } else {
        PathBuf::from("ffmpeg")
    };

    FfmpegToolsStatus {
        installed,
        ffmpeg_path: ffmpeg_path.to_string_lossy().to_string(),
        ffmpeg_version: tool_version_first_line(program),
    }
}

pub(crate) fn tool_version_first_line(program: impl AsRef<std::ffi::OsStr>) -> Option<String> {
    let output = crate::cmd::command(program).arg("-version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let first = text.lines().next()?.trim();
    if first.is_empty() {
        return None;
    }
    Some(first.to_string())
}

/// Downloads the configured ffmpeg archive, pulls the `ffmpeg` binary out of
/// it and places it at [`AppPaths::ffmpeg_bin_path`].
///
/// The archive is staged in the system temp directory and removed on every
/// exit path; nothing under the base dir is touched until extraction starts.
pub fn install_ffmpeg(
    paths: &AppPaths,
    config: &DownloaderConfig,
    fetcher: &dyn ArchiveFetcher,
) -> Result<PathBuf> {
    let url = config.ffmpeg_archive_url.trim();
    if url.is_empty() {
        return Err(EngineError::FetchFailed(
            "no ffmpeg archive url configured for this platform; set ffmpeg_archive_url or install ffmpeg on PATH"
                .to_string(),
        ));
    }

    let archive = std::env::temp_dir().join(format!("clipfetch-ffmpeg-{}.zip", uuid::Uuid::new_v4()));
    tracing::info!(url, archive = %archive.display(), "fetching ffmpeg archive");

    let result = fetch_verify_extract(paths, config, fetcher, url, &archive);
    if archive.exists() {
        let _ = std::fs::remove_file(&archive);
    }

    match &result {
        Ok(path) => tracing::info!(path = %path.display(), "ffmpeg installed"),
        Err(e) => tracing::warn!(error = %e, "ffmpeg install failed"),
    }
    result
}

fn fetch_verify_extract(
    paths: &AppPaths,
    config: &DownloaderConfig,
    fetcher: &dyn ArchiveFetcher,
    url: &str,
    archive: &Path,
) -> Result<PathBuf> {
    fetcher.fetch(url, archive).map_err(|e| match e {
        EngineError::FetchFailed(_) => e,
        other => EngineError::FetchFailed(other.to_string()),
    })?;

    if let Some(expected_hex) = config.ffmpeg_archive_sha256.as_deref() {
        let expected = expected_hex.trim().to_ascii_lowercase();
        let actual = hex::encode(sha256_file(archive)?);
        if actual != expected {
            return Err(EngineError::HashMismatch {
                path: archive.to_path_buf(),
                expected,
                actual,
            });
        }
    }

    let destination = paths.ffmpeg_bin_path();
    extract_entry_by_suffix(archive, &exe_name("ffmpeg"), &destination)?;
    Ok(destination)
}

/// Extracts the first file entry whose final path segment matches
/// `file_name` (case-insensitive) to `destination`.
pub(crate) fn extract_entry_by_suffix(
    zip_path: &Path,
    file_name: &str,
    destination: &Path,
) -> Result<()> {
    let file = std::fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| {
        EngineError::FetchFailed(format!(
            "failed to read zip archive {}: {e}",
            zip_path.to_string_lossy()
        ))
    })?;

    let wanted = file_name.to_ascii_lowercase();
    let mut found: Option<usize> = None;
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| EngineError::FetchFailed(format!("zip read failed: {e}")))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().replace('\\', "/").to_ascii_lowercase();
        let last = name.rsplit('/').next().unwrap_or(name.as_str());
        if last == wanted {
            found = Some(i);
            break;
        }
    }

    let index = found.ok_or_else(|| {
        EngineError::FetchFailed(format!("{file_name} not found in the downloaded archive"))
    })?;
    let mut entry = archive
        .by_index(index)
        .map_err(|e| EngineError::FetchFailed(format!("zip read failed: {e}")))?;

    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let staging = destination.with_extension("download");
    let placed = place_via_staging(&mut entry, &staging, destination);
    if placed.is_err() {
        let _ = std::fs::remove_file(&staging);
    }
    placed
}

/// Writes `reader` to `staging`, marks it executable and moves it over
/// `destination`. `staging` is gone on success; callers remove it on error.
fn place_via_staging(
    reader: &mut impl std::io::Read,
    staging: &Path,
    destination: &Path,
) -> Result<()> {
    {
        let mut out_file = std::fs::File::create(staging)?;
        std::io::copy(reader, &mut out_file)?;
        out_file.flush()?;
    }
    mark_executable(staging)?;

    if destination.exists() {
        let _ = std::fs::remove_file(destination);
    }
    if std::fs::rename(staging, destination).is_err() {
        std::fs::copy(staging, destination)?;
        let _ = std::fs::remove_file(staging);
    }
    Ok(())
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn sha256_file(path: &Path) -> Result<Vec<u8>> {
    use sha2::Digest;
    let mut file = std::fs::File::open(path)?;
    let mut hasher = sha2::Sha256::new();
    let mut buf = vec![0_u8; 1024 * 1024];
    loop {
        let n = std::io::Read::read(&mut file, buf.as_mut_slice())?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Builds a zip at `path` with the given `(name, contents)` entries.
    pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).expect("create zip");
        let mut writer = zip::ZipWriter::new(file);
        for (name, contents) in entries {
            writer
                .start_file(*name, zip::write::FileOptions::default())
                .expect("start file");
            writer.write_all(contents).expect("write entry");
        }
        writer.finish().expect("finish zip");
    }

    /// Serves a prebuilt archive by copying it into place.
    pub struct LocalZipFetcher {
        pub source: PathBuf,
    }

    impl ArchiveFetcher for LocalZipFetcher {
        fn fetch(&self, _url: &str, destination: &Path) -> Result<()> {
            std::fs::copy(&self.source, destination)?;
            Ok(())
        }
    }

    /// Writes a partial file, then fails. Clones share the recorded
    /// destination.
    #[derive(Clone, Default)]
    pub struct FailingFetcher {
        staged: std::sync::Arc<std::sync::Mutex<Option<PathBuf>>>,
    }

    impl FailingFetcher {
        /// Where the last fetch wrote its partial file.
        pub fn staged(&self) -> Option<PathBuf> {
            self.staged.lock().expect("staged lock").clone()
        }
    }

    impl ArchiveFetcher for FailingFetcher {
        fn fetch(&self, url: &str, destination: &Path) -> Result<()> {
            *self.staged.lock().expect("staged lock") = Some(destination.to_path_buf());
            // Leave a partial file behind the way an interrupted download would.
            std::fs::write(destination, b"partial")?;
            Err(EngineError::FetchFailed(format!("connection reset: {url}")))
        }
    }
}
