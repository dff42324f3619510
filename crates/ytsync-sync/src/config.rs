//! Runtime configuration: env settings, secrets and the channel registry.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;
use ytsync_core::{builtin_channels, ChannelSource};
use ytsync_storage::secrets::{SecretError, SecretSource};

pub const ENVIRONMENT_FILE: &str = "environment.env";
pub const CHANNEL_REGISTRY_FILE: &str = "channels.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be HH:MM (24h), got {value:?}")]
    InvalidTime { var: &'static str, value: String },
    #[error("{var} has invalid value {value:?}")]
    InvalidValue { var: &'static str, value: String },
    #[error("required secret {0} is not set")]
    MissingSecret(&'static str),
    #[error("PROJECT_ID must be set when secrets come from Secret Manager")]
    MissingProjectId,
    #[error("failed to load {path}: {source}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },
    #[error("failed to read {path}: {source}")]
    RegistryIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    RegistryParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("channel registry {0} lists no channels")]
    EmptyRegistry(PathBuf),
    #[error(transparent)]
    Secret(#[from] SecretError),
}

/// A wall-clock time of day in UTC, written `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyTime {
    hour: u8,
    minute: u8,
}

impl DailyTime {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    /// Six-field expression (`sec min hour dom mon dow`) as used by
    /// tokio-cron-scheduler.
    pub fn cron(&self) -> String {
        format!("0 {} {} * * *", self.minute, self.hour)
    }
}

impl fmt::Display for DailyTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for DailyTime {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s.trim().split_once(':').ok_or(())?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(());
        }
        let hour = h.parse().map_err(|_| ())?;
        let minute = m.parse().map_err(|_| ())?;
        Self::new(hour, minute).ok_or(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotBackend {
    Local,
    Gcs,
}

impl FromStr for SnapshotBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "gcs" => Ok(Self::Gcs),
            _ => Err(()),
        }
    }
}

/// Where secrets are read from, decided by [`load_environment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretBackend {
    Environment,
    SecretManager { project_id: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub snapshot_backend: SnapshotBackend,
    pub snapshot_dir: PathBuf,
    pub retrieval_at: DailyTime,
    pub processing_at: DailyTime,
    pub scheduler_enabled: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// `None` pages through the whole upload list.
    pub max_pages: Option<usize>,
    pub port: u16,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let snapshot_backend = match get("SNAPSHOT_BACKEND") {
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                var: "SNAPSHOT_BACKEND",
                value,
            })?,
            None if get("GOOGLE_CLOUD_PROJECT").is_some() => SnapshotBackend::Gcs,
            None => SnapshotBackend::Local,
        };

        let time = |var: &'static str, default: DailyTime| match get(var) {
            Some(value) => value
                .parse::<DailyTime>()
                .map_err(|_| ConfigError::InvalidTime { var, value }),
            None => Ok(default),
        };
        let number = |var: &'static str, default: u64| match get(var) {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue { var, value }),
            None => Ok(default),
        };

        let max_pages = match number("YOUTUBE_MAX_PAGES", 1)? {
            0 => None,
            n => Some(n as usize),
        };
        let port = number("PORT", 8080)?;
        let port = u16::try_from(port).map_err(|_| ConfigError::InvalidValue {
            var: "PORT",
            value: port.to_string(),
        })?;

        Ok(Self {
            snapshot_backend,
            snapshot_dir: get("SNAPSHOT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("Data")),
            retrieval_at: time("RETRIEVAL_AT", DailyTime { hour: 18, minute: 0 })?,
            processing_at: time("PROCESSING_AT", DailyTime { hour: 18, minute: 30 })?,
            scheduler_enabled: get("YTSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            user_agent: get("YTSYNC_USER_AGENT").unwrap_or_else(|| "ytsync/0.1".to_string()),
            http_timeout_secs: number("YTSYNC_HTTP_TIMEOUT_SECS", 20)?,
            max_pages,
            port,
            workspace_root: PathBuf::from("."),
        })
    }
}

/// Loads `environment.env` (and `.env`) when present. The presence of
/// `environment.env` means secrets live in the process environment;
/// otherwise they are read from Secret Manager and `PROJECT_ID` is required.
pub fn load_environment(workspace_root: &Path) -> Result<SecretBackend, ConfigError> {
    let env_file = workspace_root.join(ENVIRONMENT_FILE);
    let local = env_file.is_file();
    if local {
        dotenvy::from_path(&env_file).map_err(|source| ConfigError::EnvFile {
            path: env_file.clone(),
            source,
        })?;
    }
    let dot_env = workspace_root.join(".env");
    if dot_env.is_file() {
        dotenvy::from_path(&dot_env).map_err(|source| ConfigError::EnvFile {
            path: dot_env.clone(),
            source,
        })?;
    }

    secret_backend(local, std::env::var("PROJECT_ID").ok())
}

fn secret_backend(local: bool, project_id: Option<String>) -> Result<SecretBackend, ConfigError> {
    if local {
        return Ok(SecretBackend::Environment);
    }
    match project_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => Ok(SecretBackend::SecretManager {
            project_id: id.to_string(),
        }),
        _ => Err(ConfigError::MissingProjectId),
    }
}

/// How to reach Postgres. The split form is connected with explicit options
/// so passwords never need URL escaping.
#[derive(Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
    Url(String),
    Parts {
        user: String,
        password: String,
        database: String,
        host: Option<String>,
        /// Cloud SQL unix socket directory, `/cloudsql/<connection name>`.
        socket_dir: Option<String>,
    },
}

impl fmt::Debug for DatabaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(_) => f.write_str("DatabaseTarget::Url(<redacted>)"),
            Self::Parts {
                user,
                database,
                host,
                socket_dir,
                ..
            } => f
                .debug_struct("DatabaseTarget::Parts")
                .field("user", user)
                .field("password", &"<redacted>")
                .field("database", database)
                .field("host", host)
                .field("socket_dir", socket_dir)
                .finish(),
        }
    }
}

/// Secret-bearing settings.
#[derive(Clone)]
pub struct Credentials {
    pub youtube_api_key: String,
    pub bucket_name: Option<String>,
    pub database: DatabaseTarget,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("youtube_api_key", &"<redacted>")
            .field("bucket_name", &self.bucket_name)
            .field("database", &self.database)
            .finish()
    }
}

impl Credentials {
    /// The bucket name is only required when snapshots go to GCS.
    pub async fn resolve(
        secrets: &dyn SecretSource,
        backend: SnapshotBackend,
    ) -> Result<Self, ConfigError> {
        let youtube_api_key = required(secrets, "YOUTUBE_API_KEY").await?;
        let bucket_name = match backend {
            SnapshotBackend::Gcs => Some(required(secrets, "GCS_BUCKET_NAME").await?),
            SnapshotBackend::Local => secrets.secret("GCS_BUCKET_NAME").await?,
        };
        let database = resolve_database(secrets).await?;
        Ok(Self {
            youtube_api_key,
            bucket_name,
            database,
        })
    }
}

/// Database settings only, for commands that never touch the API or bucket.
pub async fn resolve_database(secrets: &dyn SecretSource) -> Result<DatabaseTarget, ConfigError> {
    if let Some(url) = secrets.secret("DATABASE_URL").await? {
        return Ok(DatabaseTarget::Url(url));
    }
    let user = required(secrets, "DB_USER").await?;
    let password = required(secrets, "DB_PASSWORD").await?;
    let database = required(secrets, "DB_NAME").await?;
    let socket_dir = secrets
        .secret("CLOUD_SQL_CONNECTION_NAME")
        .await?
        .map(|name| format!("/cloudsql/{name}"));
    let host = match socket_dir {
        Some(_) => None,
        None => Some(
            secrets
                .secret("DB_HOST")
                .await?
                .unwrap_or_else(|| "localhost".to_string()),
        ),
    };
    Ok(DatabaseTarget::Parts {
        user,
        password,
        database,
        host,
        socket_dir,
    })
}

async fn required(secrets: &dyn SecretSource, id: &'static str) -> Result<String, ConfigError> {
    secrets
        .secret(id)
        .await?
        .ok_or(ConfigError::MissingSecret(id))
}

#[derive(Debug, Deserialize)]
struct ChannelRegistry {
    channels: Vec<ChannelSource>,
}

/// `channels.yaml` in the workspace root when present, else the built-in list.
pub async fn load_channel_registry(workspace_root: &Path) -> Result<Vec<ChannelSource>, ConfigError> {
    let path = workspace_root.join(CHANNEL_REGISTRY_FILE);
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(builtin_channels()),
        Err(source) => return Err(ConfigError::RegistryIo { path, source }),
    };
    let registry: ChannelRegistry = serde_yaml::from_str(&text)
        .map_err(|source| ConfigError::RegistryParse {
            path: path.clone(),
            source,
        })?;
    if registry.channels.is_empty() {
        return Err(ConfigError::EmptyRegistry(path));
    }
    Ok(registry.channels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;

    struct MapSecrets(HashMap<&'static str, &'static str>);

    #[async_trait]
    impl SecretSource for MapSecrets {
        fn describe(&self) -> &'static str {
            "map"
        }

        async fn secret(&self, id: &str) -> Result<Option<String>, SecretError> {
            Ok(self.0.get(id).map(|v| v.to_string()))
        }
    }

    fn config_from(pairs: &[(&str, &str)]) -> Result<SyncConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn daily_time_parses_and_renders_cron() {
        let t: DailyTime = "18:30".parse().unwrap();
        assert_eq!(t.cron(), "0 30 18 * * *");
        assert_eq!(t.to_string(), "18:30");
        assert_eq!("7:05".parse::<DailyTime>().unwrap().to_string(), "07:05");
        for bad in ["24:00", "12:60", "1230", "12:5", "ab:cd", ""] {
            assert!(bad.parse::<DailyTime>().is_err(), "{bad}");
        }
    }

    #[test]
    fn defaults_apply_without_env() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.snapshot_backend, SnapshotBackend::Local);
        assert_eq!(config.snapshot_dir, PathBuf::from("Data"));
        assert_eq!(config.retrieval_at.to_string(), "18:00");
        assert_eq!(config.processing_at.to_string(), "18:30");
        assert_eq!(config.max_pages, Some(1));
        assert_eq!(config.port, 8080);
        assert!(!config.scheduler_enabled);
    }

    #[test]
    fn cloud_project_selects_gcs_and_zero_pages_means_unlimited() {
        let config = config_from(&[
            ("GOOGLE_CLOUD_PROJECT", "proj"),
            ("YOUTUBE_MAX_PAGES", "0"),
            ("PORT", "9090"),
        ])
        .unwrap();
        assert_eq!(config.snapshot_backend, SnapshotBackend::Gcs);
        assert_eq!(config.max_pages, None);
        assert_eq!(config.port, 9090);
    }

    #[test]
    fn malformed_settings_are_rejected() {
        assert!(matches!(
            config_from(&[("RETRIEVAL_AT", "6pm")]),
            Err(ConfigError::InvalidTime { var: "RETRIEVAL_AT", .. })
        ));
        assert!(matches!(
            config_from(&[("PORT", "70000")]),
            Err(ConfigError::InvalidValue { var: "PORT", .. })
        ));
        assert!(matches!(
            config_from(&[("SNAPSHOT_BACKEND", "s3")]),
            Err(ConfigError::InvalidValue { var: "SNAPSHOT_BACKEND", .. })
        ));
    }

    #[tokio::test]
    async fn credentials_assemble_cloud_sql_socket() {
        let secrets = MapSecrets(HashMap::from([
            ("YOUTUBE_API_KEY", "AIza-secret"),
            ("GCS_BUCKET_NAME", "bucket"),
            ("DB_USER", "svc"),
            ("DB_PASSWORD", "p@ss/word"),
            ("DB_NAME", "yt"),
            ("CLOUD_SQL_CONNECTION_NAME", "proj:region:inst"),
        ]));
        let creds = Credentials::resolve(&secrets, SnapshotBackend::Gcs)
            .await
            .unwrap();
        assert_eq!(creds.bucket_name.as_deref(), Some("bucket"));
        assert_eq!(
            creds.database,
            DatabaseTarget::Parts {
                user: "svc".into(),
                password: "p@ss/word".into(),
                database: "yt".into(),
                host: None,
                socket_dir: Some("/cloudsql/proj:region:inst".into()),
            }
        );

        let debug = format!("{creds:?}");
        assert!(!debug.contains("AIza-secret"));
        assert!(!debug.contains("p@ss/word"));
    }

    #[tokio::test]
    async fn missing_api_key_is_fatal() {
        let secrets = MapSecrets(HashMap::from([("DATABASE_URL", "postgres://x")]));
        let err = Credentials::resolve(&secrets, SnapshotBackend::Local)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingSecret("YOUTUBE_API_KEY")));
    }

    #[tokio::test]
    async fn gcs_backend_requires_bucket() {
        let secrets = MapSecrets(HashMap::from([
            ("YOUTUBE_API_KEY", "k"),
            ("DATABASE_URL", "postgres://x"),
        ]));
        let err = Credentials::resolve(&secrets, SnapshotBackend::Gcs)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingSecret("GCS_BUCKET_NAME")));
        assert!(Credentials::resolve(&secrets, SnapshotBackend::Local)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn registry_falls_back_to_builtin_channels() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_channel_registry(dir.path()).await.unwrap(), builtin_channels());

        tokio::fs::write(
            dir.path().join(CHANNEL_REGISTRY_FILE),
            "channels:\n  - channel_id: UC123\n    name: demo\n    title: Demo Channel\n",
        )
        .await
        .unwrap();
        let channels = load_channel_registry(dir.path()).await.unwrap();
        assert_eq!(channels, vec![ChannelSource::new("UC123", "demo", "Demo Channel")]);

        tokio::fs::write(dir.path().join(CHANNEL_REGISTRY_FILE), "channels: []\n")
            .await
            .unwrap();
        assert!(matches!(
            load_channel_registry(dir.path()).await,
            Err(ConfigError::EmptyRegistry(_))
        ));
    }

    #[test]
    fn environment_file_selects_local_secrets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(ENVIRONMENT_FILE),
            "YTSYNC_TEST_LOCAL_MARKER=from-environment-file\n",
        )
        .unwrap();

        assert_eq!(load_environment(dir.path()).unwrap(), SecretBackend::Environment);
        assert_eq!(
            std::env::var("YTSYNC_TEST_LOCAL_MARKER").unwrap(),
            "from-environment-file"
        );
    }

    #[test]
    fn project_id_from_dot_env_selects_secret_manager() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "PROJECT_ID=ytsync-test-project\n").unwrap();

        assert!(matches!(
            load_environment(dir.path()).unwrap(),
            SecretBackend::SecretManager { .. }
        ));
    }

    #[test]
    fn remote_secrets_without_project_id_is_an_error() {
        assert!(matches!(
            secret_backend(false, None),
            Err(ConfigError::MissingProjectId)
        ));
        assert!(matches!(
            secret_backend(false, Some("  ".into())),
            Err(ConfigError::MissingProjectId)
        ));
        assert_eq!(
            secret_backend(false, Some(" proj-1 ".into())).unwrap(),
            SecretBackend::SecretManager {
                project_id: "proj-1".into()
            }
        );
        assert_eq!(secret_backend(true, None).unwrap(), SecretBackend::Environment);
    }
}
