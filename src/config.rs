//! Configuration management for the HID host service.
//!
//! This module handles loading and saving configuration from disk,
//! including the devices to connect at start-up and the pairing answers
//! given by the agent.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{HidHostError, Result};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   #[serde(default)]
   pub devices: Vec<KnownDevice>,

   /// Adapter to use; the session default adapter when unset.
   #[serde(default)]
   pub adapter: Option<String>,

   #[serde(default = "default_max_connections")]
   pub max_connections: usize,

   #[serde(default = "default_pin_code")]
   pub pin_code: String,

   #[serde(default = "default_true")]
   pub auto_accept_confirmation: bool,

   /// Accept device-initiated control and interrupt channels.
   #[serde(default = "default_true")]
   pub listen: bool,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: u64,
}

/// A HID device the service connects to on start-up.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct KnownDevice {
   pub address: String,
   #[serde(default)]
   pub name: String,
}

const fn default_max_connections() -> usize {
   1
}

fn default_pin_code() -> String {
   "0000".to_string()
}

const fn default_true() -> bool {
   true
}

const fn default_connect_timeout() -> u64 {
   10
}

impl Default for Config {
   fn default() -> Self {
      Self {
         devices: vec![],
         adapter: None,
         max_connections: default_max_connections(),
         pin_code: default_pin_code(),
         auto_accept_confirmation: true,
         listen: true,
         connect_timeout_sec: default_connect_timeout(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(hidhost_home) = env::var("HIDHOST_HOME") {
         PathBuf::from(hidhost_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(HidHostError::ConfigDirNotFound);
      };

      Ok(config_dir.join("hidhost").join("config.toml"))
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_sec)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_missing_file_creates_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("hidhost").join("config.toml");

      let config = Config::load_from(&path).unwrap();
      assert!(path.exists());
      assert_eq!(config.max_connections, 1);
      assert_eq!(config.pin_code, "0000");
      assert!(config.listen);
      assert!(config.devices.is_empty());
   }

   #[test]
   fn test_partial_file_fills_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(
         &path,
         "pin_code = \"1234\"\n\n[[devices]]\naddress = \"00:1B:DC:08:E2:5C\"\nname = \"Keyboard\"\n",
      )
      .unwrap();

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config.pin_code, "1234");
      assert_eq!(config.connect_timeout(), Duration::from_secs(10));
      assert_eq!(config.devices.len(), 1);
      assert_eq!(config.devices[0].name, "Keyboard");
   }

   #[test]
   fn test_save_and_reload() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");

      let mut config = Config::default();
      config.max_connections = 4;
      config.adapter = Some("hci1".into());
      config.save_to(&path).unwrap();

      let loaded = Config::load_from(&path).unwrap();
      assert_eq!(loaded.max_connections, 4);
      assert_eq!(loaded.adapter.as_deref(), Some("hci1"));
   }
}
