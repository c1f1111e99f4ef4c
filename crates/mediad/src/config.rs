use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the media conversion service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Address the HTTP transport binds to
    pub host: String,
    /// Port the HTTP transport binds to
    pub port: u16,
    /// Directory where merged uploads are stored
    pub data_dir: PathBuf,
    /// Staging directory for in-flight chunk uploads
    pub temp_dir: PathBuf,
    /// Directory where conversion and split outputs land
    pub output_dir: PathBuf,
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ServiceConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        let base = home_dir().join(".mediad");
        Self {
            host: "127.0.0.1".to_string(),
            port: 28888,
            data_dir: base.join("data"),
            temp_dir: base.join("tmp"),
            output_dir: base.join("output"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // Try JSON first, then TOML
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    let file_config: ServiceConfig = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                    config = file_config;
                } else {
                    let file_config: ServiceConfig = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                    config = file_config;
                }
            }
        }

        Ok(config)
    }

    /// Create the data, staging, and output directories if they are missing
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.data_dir, &self.temp_dir, &self.output_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Locate an ffmpeg-suite binary: next to the service executable first,
/// then in a `bin/` subdirectory, falling back to PATH lookup.
pub fn find_tool(name: &str) -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            let candidates = [
                exe_dir.join(name),
                exe_dir.join(format!("{}.exe", name)),
                exe_dir.join("bin").join(name),
                exe_dir.join("bin").join(format!("{}.exe", name)),
            ];
            for candidate in candidates {
                if candidate.exists() {
                    return candidate;
                }
            }
        }
    }
    PathBuf::from(name)
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.port, 28888);
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.ffmpeg_bin, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let cfg = ServiceConfig::load_config(Some(Path::new("/nonexistent/config.json"))).unwrap();
        assert_eq!(cfg.port, ServiceConfig::default().port);
    }

    #[test]
    fn test_partial_json_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"port": 9000, "host": "0.0.0.0"}"#).unwrap();

        let cfg = ServiceConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.host, "0.0.0.0");
        // untouched fields fall back to defaults
        assert_eq!(cfg.ffmpeg_bin, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn test_toml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = 12345\nffmpeg_bin = \"/opt/ffmpeg/ffmpeg\"\n").unwrap();

        let cfg = ServiceConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.port, 12345);
        assert_eq!(cfg.ffmpeg_bin, PathBuf::from("/opt/ffmpeg/ffmpeg"));
    }
}
