//! Configuration management for the upload server

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::upload::DEFAULT_CHUNK_SIZE;

/// Room for multipart boundaries and text fields on top of a chunk
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upload: UploadConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Directory of published artifacts
    pub upload_path: PathBuf,
    /// Directory of chunk staging areas
    pub temp_path: PathBuf,
    /// Public origin used to build artifact URLs, without trailing slash
    pub base_url: String,
    /// Route prefix the artifacts are served under
    pub file_server_path: String,
    /// Largest accepted file in bytes (0 = unlimited)
    pub max_file_size: u64,
    /// Largest accepted chunk in bytes (0 = unlimited)
    pub max_chunk_size: u64,
    /// Chunk size advertised to clients
    pub chunk_size: usize,
    /// Parallel chunk uploads advertised to clients
    pub concurrent: usize,
    /// Idle hours before a receiving session is swept (0 = never)
    pub session_ttl_hours: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL; in-memory stores are used when unset
    pub url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
            },
            upload: UploadConfig::default(),
            database: DatabaseConfig { url: None },
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig::with_root(PathBuf::from("./uploads"))
    }
}

impl UploadConfig {
    /// Defaults rooted at `upload_path`, with chunks under `<upload_path>/temp`
    pub fn with_root(upload_path: impl Into<PathBuf>) -> Self {
        let upload_path = upload_path.into();
        UploadConfig {
            temp_path: upload_path.join("temp"),
            upload_path,
            base_url: "http://localhost:8000".to_string(),
            file_server_path: "/files".to_string(),
            max_file_size: 0,
            max_chunk_size: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrent: 3,
            session_ttl_hours: crate::upload::SESSION_TTL_HOURS as u64,
        }
    }

    /// Request body limit for chunk uploads
    pub fn body_limit(&self) -> usize {
        let largest_chunk = if self.max_chunk_size > 0 {
            usize::try_from(self.max_chunk_size).unwrap_or(usize::MAX)
        } else {
            self.chunk_size.saturating_mul(2)
        };
        largest_chunk.saturating_add(MULTIPART_OVERHEAD)
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let upload_path = PathBuf::from(
            lookup("UPLOAD_PATH").unwrap_or_else(|| "./uploads".to_string()),
        );
        let defaults = UploadConfig::with_root(&upload_path);

        let temp_path = lookup("UPLOAD_TEMP_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.temp_path);

        let base_url = lookup("UPLOAD_BASE_URL")
            .unwrap_or(defaults.base_url)
            .trim_end_matches('/')
            .to_string();

        let file_server_path = lookup("UPLOAD_FILE_SERVER_PATH")
            .map(|p| normalize_route(&p))
            .unwrap_or(defaults.file_server_path);

        Ok(Config {
            server: ServerConfig {
                host: lookup("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                port: parse_var(&lookup, "SERVER_PORT", 8000)?,
            },
            upload: UploadConfig {
                upload_path,
                temp_path,
                base_url,
                file_server_path,
                max_file_size: parse_var(&lookup, "UPLOAD_MAX_FILE_SIZE", defaults.max_file_size)?,
                max_chunk_size: parse_var(&lookup, "UPLOAD_MAX_CHUNK_SIZE", defaults.max_chunk_size)?,
                chunk_size: parse_var(&lookup, "UPLOAD_CHUNK_SIZE", defaults.chunk_size)?,
                concurrent: parse_var(&lookup, "UPLOAD_CONCURRENT", defaults.concurrent)?,
                session_ttl_hours: parse_var(
                    &lookup,
                    "UPLOAD_SESSION_TTL_HOURS",
                    defaults.session_ttl_hours,
                )?,
            },
            database: DatabaseConfig {
                url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            },
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value,
        }),
    }
}

/// `files/` -> `/files`
fn normalize_route(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/files".to_string()
    } else {
        format!("/{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.upload.upload_path, PathBuf::from("./uploads"));
        assert_eq!(config.upload.temp_path, PathBuf::from("./uploads/temp"));
        assert_eq!(config.upload.chunk_size, 2 * 1024 * 1024);
        assert_eq!(config.upload.max_file_size, 0);
        assert_eq!(config.upload.session_ttl_hours, 24);
        assert!(config.database.url.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("UPLOAD_PATH", "/data"),
            ("UPLOAD_BASE_URL", "https://cdn.example.com/"),
            ("UPLOAD_FILE_SERVER_PATH", "static/"),
            ("UPLOAD_MAX_FILE_SIZE", "1048576"),
            ("DATABASE_URL", "sqlite:./uploads.db"),
        ]))
        .unwrap();

        assert_eq!(config.upload.temp_path, PathBuf::from("/data/temp"));
        assert_eq!(config.upload.base_url, "https://cdn.example.com");
        assert_eq!(config.upload.file_server_path, "/static");
        assert_eq!(config.upload.max_file_size, 1_048_576);
        assert_eq!(config.database.url.as_deref(), Some("sqlite:./uploads.db"));
    }

    #[test]
    fn test_invalid_number() {
        let result = Config::from_lookup(lookup(&[("SERVER_PORT", "eighty")]));
        assert!(matches!(result, Err(ConfigError::Invalid { ref key, .. }) if key == "SERVER_PORT"));
    }

    #[test]
    fn test_body_limit() {
        let mut upload = UploadConfig::default();
        assert_eq!(upload.body_limit(), 4 * 1024 * 1024 + MULTIPART_OVERHEAD);

        upload.max_chunk_size = 10;
        assert_eq!(upload.body_limit(), 10 + MULTIPART_OVERHEAD);
    }
}
