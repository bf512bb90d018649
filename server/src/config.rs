use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use krypton_misc::config::{expandenv, CommonConfig, PathSet};
use krypton_misc::dirs;
use krypton_proto::tls;
use serde::{Deserialize, Serialize};
use tokio_rustls::TlsAcceptor;

use crate::context::ServerContext;
use crate::db::config::DbConfig;
use crate::store::ClipboardStore;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_bind")]
    pub bind: String,

    #[serde(default = "ServerConfig::default_max_connections")]
    pub max_connections: usize,

    /// Sessions without any activity for longer than this are evicted by
    /// the stale sweeper. Clients must heartbeat more often than this.
    #[serde(default = "ServerConfig::default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    #[serde(default = "ServerConfig::default_password_hash_rounds")]
    pub password_hash_rounds: u32,

    #[serde(default)]
    pub db: DbConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub images: ImagesConfig,

    #[serde(default)]
    pub logs: LogsConfig,

    #[serde(skip)]
    pub connection_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: Self::default_bind(),
            max_connections: Self::default_max_connections(),
            connection_timeout_secs: Self::default_connection_timeout_secs(),
            password_hash_rounds: Self::default_password_hash_rounds(),
            db: DbConfig::default(),
            cleanup: CleanupConfig::default(),
            tls: TlsConfig::default(),
            images: ImagesConfig::default(),
            logs: LogsConfig::default(),
            connection_timeout_ms: Self::default_connection_timeout_secs() * 1000,
        }
    }
}

impl CommonConfig for ServerConfig {
    fn complete(&mut self, ps: &PathSet) -> Result<()> {
        if self.bind.is_empty() {
            bail!("bind is required");
        }

        if self.max_connections == 0 {
            bail!("max_connections must be greater than 0");
        }

        if self.connection_timeout_secs < Self::MIN_CONNECTION_TIMEOUT_SECS
            || self.connection_timeout_secs > Self::MAX_CONNECTION_TIMEOUT_SECS
        {
            bail!(
                "connection_timeout_secs must be in range [{}, {}]",
                Self::MIN_CONNECTION_TIMEOUT_SECS,
                Self::MAX_CONNECTION_TIMEOUT_SECS
            );
        }

        if self.password_hash_rounds < Self::MIN_PASSWORD_HASH_ROUNDS
            || self.password_hash_rounds > Self::MAX_PASSWORD_HASH_ROUNDS
        {
            bail!(
                "password_hash_rounds must be in range [{}, {}]",
                Self::MIN_PASSWORD_HASH_ROUNDS,
                Self::MAX_PASSWORD_HASH_ROUNDS
            );
        }

        self.db.complete(ps).context("db")?;
        self.cleanup.complete(ps).context("cleanup")?;
        self.tls.complete(ps).context("tls")?;
        self.images.complete(ps).context("images")?;
        self.logs.complete(ps).context("logs")?;

        self.connection_timeout_ms = self.connection_timeout_secs * 1000;

        Ok(())
    }
}

impl ServerConfig {
    const MIN_CONNECTION_TIMEOUT_SECS: u64 = 5;
    const MAX_CONNECTION_TIMEOUT_SECS: u64 = 60 * 60;

    const MIN_PASSWORD_HASH_ROUNDS: u32 = 10_000;
    const MAX_PASSWORD_HASH_ROUNDS: u32 = 10_000_000;

    pub fn build_ctx(&self) -> Result<Arc<ServerContext>> {
        let db = Arc::new(self.db.build().context("init database")?);

        let images_root = if self.images.external {
            Some(PathBuf::from(&self.images.root))
        } else {
            None
        };
        let store = ClipboardStore::new(db.clone(), images_root);

        let ctx = ServerContext {
            db,
            store,
            cfg: self.clone(),
        };
        Ok(Arc::new(ctx))
    }

    fn default_bind() -> String {
        String::from("0.0.0.0:6789")
    }

    fn default_max_connections() -> usize {
        1000
    }

    fn default_connection_timeout_secs() -> u64 {
        120
    }

    fn default_password_hash_rounds() -> u32 {
        100_000
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CleanupConfig {
    /// Periodic retention is off unless explicitly enabled.
    #[serde(default)]
    pub enable: bool,

    #[serde(default = "CleanupConfig::default_interval_hours")]
    pub interval_hours: u64,

    #[serde(default = "CleanupConfig::default_retention_days")]
    pub retention_days: u64,

    /// Separate retention for image entries, 0 disables it.
    #[serde(default)]
    pub image_retention_days: u64,

    #[serde(default = "CleanupConfig::default_warmup_secs")]
    pub warmup_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enable: false,
            interval_hours: Self::default_interval_hours(),
            retention_days: Self::default_retention_days(),
            image_retention_days: 0,
            warmup_secs: Self::default_warmup_secs(),
        }
    }
}

impl CommonConfig for CleanupConfig {
    fn complete(&mut self, _ps: &PathSet) -> Result<()> {
        if !self.enable {
            return Ok(());
        }
        if self.interval_hours == 0 {
            bail!("interval_hours must be greater than 0");
        }
        if self.retention_days == 0 {
            bail!("retention_days must be greater than 0");
        }
        if self.warmup_secs < Self::MIN_WARMUP_SECS {
            bail!("warmup_secs must be at least {}", Self::MIN_WARMUP_SECS);
        }
        Ok(())
    }
}

impl CleanupConfig {
    const MIN_WARMUP_SECS: u64 = 60;

    fn default_interval_hours() -> u64 {
        1
    }

    fn default_retention_days() -> u64 {
        30
    }

    fn default_warmup_secs() -> u64 {
        60
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enable: bool,

    /// Reject clients that try to speak plaintext past the hello.
    #[serde(default)]
    pub required: bool,

    /// PEM certificate chain, default {config}/pki/cert.pem.
    #[serde(default)]
    pub cert_path: String,

    /// PEM private key, default {config}/pki/key.pem.
    #[serde(default)]
    pub key_path: String,
}

impl CommonConfig for TlsConfig {
    fn complete(&mut self, ps: &PathSet) -> Result<()> {
        if !self.enable {
            if self.required {
                bail!("tls cannot be required when it is not enabled");
            }
            return Ok(());
        }

        self.cert_path = expandenv("cert_path", &self.cert_path)?;
        if self.cert_path.is_empty() {
            self.cert_path = format!("{}", ps.pki_path.join("cert.pem").display());
        }
        self.key_path = expandenv("key_path", &self.key_path)?;
        if self.key_path.is_empty() {
            self.key_path = format!("{}", ps.pki_path.join("key.pem").display());
        }
        Ok(())
    }
}

impl TlsConfig {
    pub fn build_acceptor(&self) -> Result<Option<TlsAcceptor>> {
        if !self.enable {
            return Ok(None);
        }
        let acceptor = tls::build_acceptor(
            &PathBuf::from(&self.cert_path),
            &PathBuf::from(&self.key_path),
        )?;
        Ok(Some(acceptor))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ImagesConfig {
    /// Store image bytes on the filesystem instead of in the database.
    #[serde(default)]
    pub external: bool,

    /// Storage root, default {data}. Blobs land under
    /// {root}/images/{user_id}/{uuid}.png.
    #[serde(default)]
    pub root: String,
}

impl CommonConfig for ImagesConfig {
    fn complete(&mut self, ps: &PathSet) -> Result<()> {
        if !self.external {
            return Ok(());
        }
        self.root = expandenv("root", &self.root)?;
        if self.root.is_empty() {
            self.root = format!("{}", ps.data_path.display());
        }
        dirs::ensure_dir_exists(&PathBuf::from(&self.root).join("images"))
            .context("ensure images dir")?;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogsConfig {
    #[serde(default = "LogsConfig::default_level")]
    pub level: String,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl CommonConfig for LogsConfig {
    fn complete(&mut self, _ps: &PathSet) -> Result<()> {
        match self.level.as_str() {
            "error" | "info" | "debug" | "trace" => Ok(()),
            _ => bail!("unknown log level '{}'", self.level),
        }
    }
}

impl LogsConfig {
    fn default_level() -> String {
        String::from("info")
    }
}
