use super::{DeviceConfig, Profile};
use crate::mqtt::config::ConnectionConfig;
use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/carlink";
const CONNECTION_CONFIG_FILE: &str = "connection_config.toml";
const DEVICE_CONFIG_FILE: &str = "device_config.toml";
pub const DEFAULT_PROFILE: &str = "default";

pub struct ProfileStore {
    root: PathBuf,
}

impl ProfileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at `~/.config/carlink`
    pub fn in_home_dir() -> Self {
        let mut root = get_home_dir();
        root.push(CONFIG_DIR);
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn profile_dir(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(eyre!("Invalid profile name: {:?}", name));
        }
        Ok(self.root.join(name))
    }

    /// Creates the default profile on first run
    pub async fn ensure_default_profile(&self) -> Result<()> {
        let dir = self.profile_dir(DEFAULT_PROFILE)?;
        if tokio::fs::try_exists(&dir)
            .await
            .map_err(|e| eyre!("Failed to check if default profile exists: {}", e))?
        {
            return Ok(());
        }

        info!("Creating default profile in {}", dir.display());
        self.save(DEFAULT_PROFILE, &Profile::default()).await
    }

    pub async fn save(&self, name: &str, profile: &Profile) -> Result<()> {
        let dir = self.profile_dir(name)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| eyre!("Failed to create profile directory: {}", e))?;

        write_toml(&dir.join(CONNECTION_CONFIG_FILE), &profile.connection).await?;
        write_toml(&dir.join(DEVICE_CONFIG_FILE), &profile.device).await?;

        info!("Profile {} saved successfully", name);
        Ok(())
    }

    pub async fn load(&self, name: &str) -> Result<Profile> {
        let dir = self.profile_dir(name)?;
        if !tokio::fs::try_exists(&dir)
            .await
            .map_err(|e| eyre!("Failed to check if profile directory exists: {}", e))?
        {
            return Err(eyre!("Profile directory does not exist: {}", name));
        }

        let connection: ConnectionConfig =
            read_toml_or_default(&dir.join(CONNECTION_CONFIG_FILE), name).await?;
        let device: DeviceConfig =
            read_toml_or_default(&dir.join(DEVICE_CONFIG_FILE), name).await?;

        connection
            .validate()
            .map_err(|e| eyre!("Profile {} has unusable connection settings: {}", name, e))?;

        debug!("Loaded profile {}", name);
        Ok(Profile { device, connection })
    }

    /// Names of all profile directories, sorted
    pub async fn list(&self) -> Result<Vec<String>> {
        if !tokio::fs::try_exists(&self.root)
            .await
            .map_err(|e| eyre!("Failed to check if config directory exists: {}", e))?
        {
            debug!("Config directory does not exist, no profiles available");
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| eyre!("Failed to read config directory: {}", e))?;

        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| eyre!("Failed to read directory entry: {}", e))?
        {
            let path = entry.path();
            let is_dir = tokio::fs::metadata(&path)
                .await
                .map_err(|e| eyre!("Failed to get metadata for {}: {}", path.display(), e))?
                .is_dir();
            if !is_dir {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }

        names.sort();
        Ok(names)
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let dir = self.profile_dir(name)?;
        if !tokio::fs::try_exists(&dir)
            .await
            .map_err(|e| eyre!("Failed to check if profile directory exists: {}", e))?
        {
            return Err(eyre!("Profile directory does not exist: {}", name));
        }

        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| eyre!("Failed to delete profile directory: {}", e))?;
        info!("Profile {} deleted successfully", name);
        Ok(())
    }
}

async fn write_toml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = toml::to_string_pretty(value)
        .map_err(|e| eyre!("Failed to serialize {}: {}", path.display(), e))?;
    tokio::fs::write(path, content)
        .await
        .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))
}

async fn read_toml_or_default<T: DeserializeOwned + Default>(
    path: &Path,
    profile: &str,
) -> Result<T> {
    if !tokio::fs::try_exists(path)
        .await
        .map_err(|e| eyre!("Failed to check if {} exists: {}", path.display(), e))?
    {
        warn!(
            "{} does not exist for profile {}, using default",
            path.display(),
            profile
        );
        return Ok(T::default());
    }

    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?;
    toml::from_str(&content).map_err(|e| eyre!("Failed to parse {}: {}", path.display(), e))
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
