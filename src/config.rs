//! Configuration management for the TUS server

use std::env;
use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub tus: TusConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Protocol settings
#[derive(Debug, Clone, Deserialize)]
pub struct TusConfig {
    /// Path prefix uploads live under, e.g. `/files/`
    pub api_path: String,
    /// Maximum declared upload length in bytes (0 = unlimited)
    pub max_size: u64,
    /// Maximum request body accepted for a single chunk
    pub max_chunk_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub upload_dir: PathBuf,
    pub s3: S3Config,
    pub redis: RedisConfig,
    pub mongodb: MongoConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Filesystem,
    S3,
    Mongodb,
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: Option<String>,
    /// Key prefix for upload objects and their containers
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
    /// Seconds of inactivity before an upload expires
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MongoConfig {
    pub url: String,
    pub database: String,
    pub bucket: String,
    pub merge_on_complete: bool,
}

impl Default for TusConfig {
    fn default() -> Self {
        TusConfig {
            api_path: "/files/".to_string(),
            max_size: 50_000_000,
            max_chunk_size: 64 * 1024 * 1024,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            tus: TusConfig::default(),
            storage: StorageConfig {
                backend: StorageBackend::Filesystem,
                upload_dir: PathBuf::from("./uploads"),
                s3: S3Config {
                    endpoint: "http://localhost:9000".to_string(),
                    bucket: "uploads".to_string(),
                    access_key: "admin".to_string(),
                    secret_key: "password123".to_string(),
                    region: Some("us-east-1".to_string()),
                    prefix: "tus-temp".to_string(),
                },
                redis: RedisConfig {
                    url: "redis://127.0.0.1/".to_string(),
                    key_prefix: "tus".to_string(),
                    ttl_secs: 3600,
                },
                mongodb: MongoConfig {
                    url: "mongodb://localhost:27017".to_string(),
                    database: "uploads".to_string(),
                    bucket: "tus".to_string(),
                    merge_on_complete: true,
                },
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        let defaults = Config::default();

        let backend = match env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "filesystem".to_string())
            .to_lowercase()
            .as_str()
        {
            "s3" => StorageBackend::S3,
            "mongodb" | "gridfs" => StorageBackend::Mongodb,
            "redis" => StorageBackend::Redis,
            "memory" => StorageBackend::Memory,
            _ => StorageBackend::Filesystem,
        };

        // S3 credentials are only mandatory when S3 is the active backend
        let s3 = if backend == StorageBackend::S3 {
            S3Config {
                endpoint: env::var("S3_ENDPOINT")?,
                bucket: env::var("S3_BUCKET")?,
                access_key: env::var("S3_ACCESS_KEY")?,
                secret_key: env::var("S3_SECRET_KEY")?,
                region: env::var("S3_REGION").ok(),
                prefix: env::var("S3_PREFIX").unwrap_or(defaults.storage.s3.prefix),
            }
        } else {
            defaults.storage.s3
        };

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port),
            },
            tus: TusConfig {
                api_path: env::var("TUS_API_PATH").unwrap_or(defaults.tus.api_path),
                max_size: parse_var("TUS_MAX_SIZE", defaults.tus.max_size),
                max_chunk_size: parse_var("TUS_MAX_CHUNK_SIZE", defaults.tus.max_chunk_size),
            },
            storage: StorageConfig {
                backend,
                upload_dir: env::var("UPLOAD_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.upload_dir),
                s3,
                redis: RedisConfig {
                    url: env::var("REDIS_URL").unwrap_or(defaults.storage.redis.url),
                    key_prefix: env::var("REDIS_KEY_PREFIX").unwrap_or(defaults.storage.redis.key_prefix),
                    ttl_secs: parse_var("UPLOAD_TTL_SECS", defaults.storage.redis.ttl_secs),
                },
                mongodb: MongoConfig {
                    url: env::var("MONGODB_URL").unwrap_or(defaults.storage.mongodb.url),
                    database: env::var("MONGODB_DATABASE").unwrap_or(defaults.storage.mongodb.database),
                    bucket: env::var("MONGODB_BUCKET").unwrap_or(defaults.storage.mongodb.bucket),
                    merge_on_complete: parse_var(
                        "MONGODB_MERGE_ON_COMPLETE",
                        defaults.storage.mongodb.merge_on_complete,
                    ),
                },
            },
        })
    }
}

/// Read and parse a variable, falling back to `default` if unset or invalid
fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
