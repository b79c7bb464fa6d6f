use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::PathBuf;

use platescan_core::vision::{DEFAULT_ENDPOINT, DEFAULT_MODEL, VisionConfig};

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "platescan").context("Could not determine home directory")?;
        Self::in_dir(proj_dirs.data_dir().to_path_buf())
    }

    /// Use `data_dir` for the database and key file, creating it if needed.
    pub fn in_dir(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let db_path = data_dir.join("platescan.db");

        Ok(Config { db_path, data_dir })
    }

    /// Load the server API key from disk, or generate a new one.
    ///
    /// Returns `(key, newly_created)`.
    pub fn load_or_create_api_key(&self) -> Result<(String, bool)> {
        use rand::Rng;
        use std::fmt::Write;

        let path = self.data_dir.join("api_key");

        if path.exists() {
            let key = std::fs::read_to_string(&path).context("Failed to read API key file")?;
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Ok((key, false));
            }
        }

        let bytes: [u8; 32] = rand::rng().random();
        let key = bytes
            .iter()
            .fold(String::with_capacity(64), |mut acc: String, b| {
                let _ = write!(acc, "{b:02x}");
                acc
            });
        std::fs::write(&path, &key).context("Failed to write API key file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set API key file permissions")?;
        }
        eprintln!("Generated new API key: {key}");
        eprintln!("Include in requests: Authorization: Bearer {key}");
        Ok((key, true))
    }
}

/// Vision service settings as collected from flags and environment.
#[derive(Debug, Clone, Default)]
pub struct VisionSettings {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
}

impl VisionSettings {
    #[must_use]
    pub fn into_config(self) -> VisionConfig {
        VisionConfig {
            model: self.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            endpoint: self
                .endpoint
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: self.api_key.filter(|k| !k.trim().is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::in_dir(dir.path().join("data")).unwrap();
        assert!(config.db_path.ends_with("platescan.db"));

        let (key, created) = config.load_or_create_api_key().unwrap();
        assert!(created);
        assert_eq!(key.len(), 64);

        let (again, created) = config.load_or_create_api_key().unwrap();
        assert!(!created);
        assert_eq!(again, key);
    }

    #[test]
    fn test_vision_settings_defaults() {
        let config = VisionSettings::default().into_config();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert!(config.is_stub());
    }

    #[test]
    fn test_blank_key_means_stub() {
        let config = VisionSettings {
            api_key: Some(" ".to_string()),
            endpoint: Some("http://localhost:9000/".to_string()),
            ..VisionSettings::default()
        }
        .into_config();
        assert!(config.api_key.is_none());
        assert_eq!(config.endpoint, "http://localhost:9000");
    }
}
