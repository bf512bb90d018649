use std::path::PathBuf;
use std::{env, fs, io};

use anyhow::{bail, Context, Result};
use clap::Args;
use log::warn;
use serde::de::DeserializeOwned;

use crate::dirs::{ensure_dir_exists, home_dir, is_root};

pub struct PathSet {
    pub config_path: PathBuf,
    pub data_path: PathBuf,
    pub pki_path: PathBuf,
}

impl PathSet {
    pub fn new(config_path: Option<PathBuf>, data_path: Option<PathBuf>) -> Result<Self> {
        // Determine config path
        let config_path = if let Some(path) = config_path {
            path
        } else if let Ok(path) = env::var("KRYPTON_CONFIG") {
            PathBuf::from(path)
        } else if is_root() {
            PathBuf::from("/etc/krypton")
        } else {
            home_dir()?.join(".config").join("krypton")
        };

        // Determine data path
        let data_path = if let Some(path) = data_path {
            path
        } else if let Ok(path) = env::var("KRYPTON_DATA") {
            PathBuf::from(path)
        } else if is_root() {
            PathBuf::from("/var/lib/krypton")
        } else {
            home_dir()?.join(".local").join("share").join("krypton")
        };

        // PKI path is always under config path
        let pki_path = config_path.join("pki");

        ensure_dir_exists(&config_path)
            .with_context(|| format!("ensure config directory: {}", config_path.display()))?;
        ensure_dir_exists(&data_path)
            .with_context(|| format!("ensure data directory: {}", data_path.display()))?;
        ensure_dir_exists(&pki_path)
            .with_context(|| format!("ensure pki directory: {}", pki_path.display()))?;

        Ok(Self {
            config_path,
            data_path,
            pki_path,
        })
    }

    pub fn load_config<T>(&self, name: &str) -> Result<T>
    where
        T: CommonConfig + DeserializeOwned + Default,
    {
        let path = self.config_path.join(format!("{name}.toml"));
        let mut cfg: T = match fs::read_to_string(&path) {
            Ok(s) => toml::from_str(&s).context("parse config toml")?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!("Config file for {name} not found, using defaults");
                T::default()
            }
            Err(err) => {
                return Err(err).context(format!("read config file: {}", path.display()));
            }
        };

        cfg.complete(self).context("validate config")?;
        Ok(cfg)
    }
}

pub trait CommonConfig {
    fn complete(&mut self, ps: &PathSet) -> Result<()>;
}

#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Config directory, containing `<name>.toml` files. Defaults to
    /// ~/.config/krypton, or /etc/krypton when running as root.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Data directory. Defaults to ~/.local/share/krypton, or
    /// /var/lib/krypton when running as root.
    #[arg(long)]
    pub data: Option<PathBuf>,
}

impl ConfigArgs {
    pub fn build_path_set(&self) -> Result<PathSet> {
        PathSet::new(self.config.clone(), self.data.clone())
    }

    pub fn load<T>(&self, name: &str) -> Result<T>
    where
        T: CommonConfig + DeserializeOwned + Default,
    {
        let ps = self.build_path_set()?;
        ps.load_config(name)
    }
}

/// See: [`shellexpand::full`].
pub fn expandenv(name: &str, s: impl AsRef<str>) -> Result<String> {
    let s =
        shellexpand::full(s.as_ref()).with_context(|| format!("expand env value for '{name}'"))?;
    Ok(s.to_string())
}
