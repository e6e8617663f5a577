use std::path::{Path, PathBuf};

pub const BASE_DIR_ENV_VAR: &str = "CLIPFETCH_BASE_DIR";

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Base directory from the environment, falling back to the directory
    /// holding the running executable (where a portable `ffmpeg` copy lives).
    pub fn from_env_or_exe_dir() -> std::io::Result<Self> {
        if let Ok(v) = std::env::var(BASE_DIR_ENV_VAR) {
            let t = v.trim();
            if !t.is_empty() {
                return Ok(Self::new(PathBuf::from(t)));
            }
        }
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self::new(dir))
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir().join("downloader.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn batch_logs_dir(&self) -> PathBuf {
        self.logs_dir().join("batches")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.base_dir.join("tools")
    }

    pub fn ffmpeg_dir(&self) -> PathBuf {
        self.tools_dir().join("ffmpeg")
    }

    pub fn ffmpeg_bin_path(&self) -> PathBuf {
        self.ffmpeg_dir().join(exe_name("ffmpeg"))
    }

    pub fn bundled_ytdlp_path(&self) -> PathBuf {
        self.tools_dir().join("yt-dlp").join(exe_name("yt-dlp"))
    }

    pub fn default_download_dir(&self) -> PathBuf {
        self.base_dir.join("downloads")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.batch_logs_dir())?;
        std::fs::create_dir_all(self.ffmpeg_dir())?;
        Ok(())
    }
}

pub fn exe_name(stem: &str) -> String {
    if cfg!(windows) {
        format!("{stem}.exe")
    } else {
        stem.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_paths_live_under_tools_dir() {
        let paths = AppPaths::new(PathBuf::from("/opt/clipfetch"));
        assert!(paths.ffmpeg_bin_path().starts_with(paths.tools_dir()));
        assert!(paths.bundled_ytdlp_path().starts_with(paths.tools_dir()));
        assert_eq!(
            paths.ffmpeg_bin_path().file_name().and_then(|n| n.to_str()),
            Some(exe_name("ffmpeg").as_str())
        );
    }

    #[test]
    fn ensure_dirs_creates_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        paths.ensure_dirs().expect("ensure dirs");
        assert!(paths.config_dir().is_dir());
        assert!(paths.batch_logs_dir().is_dir());
        assert!(paths.ffmpeg_dir().is_dir());
    }
}
