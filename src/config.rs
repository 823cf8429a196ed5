use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the web app is served from (e.g. "https://app.taskpilot.io")
  #[serde(default = "default_origin")]
  pub origin: String,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub notifications: NotificationDefaults,
  #[serde(default)]
  pub lifecycle: LifecycleConfig,
  /// Where the offline database and logs live (defaults to $XDG_DATA_HOME/taskpilot)
  pub data_dir: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: default_origin(),
      cache: CacheConfig::default(),
      api: ApiConfig::default(),
      sync: SyncConfig::default(),
      notifications: NotificationDefaults::default(),
      lifecycle: LifecycleConfig::default(),
      data_dir: None,
    }
  }
}

fn default_origin() -> String {
  "http://localhost:8080".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Partition name prefix, e.g. "taskpilot" -> "taskpilot-static-v2.0"
  pub prefix: String,
  /// Current partition version tag
  pub version: String,
  /// Assets seeded into the static partition at install time
  pub static_assets: Vec<String>,
  /// Document served to navigations when offline and uncached
  pub offline_page: String,
  /// URL schemes that are never intercepted (without the trailing "://")
  pub excluded_schemes: Vec<String>,
  /// Liveness check path suffix
  pub health_path: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "taskpilot".to_string(),
      version: "v2.0".to_string(),
      static_assets: [
        "/",
        "/index.html",
        "/manifest.json",
        "/icons/icon-192.png",
        "/icons/apple-touch-icon.png",
        "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.4.0/css/all.min.css",
        "https://fonts.googleapis.com/css2?family=Inter:wght@300;400;500;600;700&family=Space+Grotesk:wght@400;500;600;700&display=swap",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      offline_page: "/index.html".to_string(),
      excluded_schemes: vec!["chrome-extension".to_string()],
      health_path: "/sw-health".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub tasks_endpoint: String,
  pub notes_endpoint: String,
  /// Per-request network timeout in seconds
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      tasks_endpoint: "/api/tasks".to_string(),
      notes_endpoint: "/api/notes".to_string(),
      timeout_secs: 10,
    }
  }
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Read-only resources re-fetched on the periodic refresh signal
  pub refresh_resources: Vec<String>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      refresh_resources: vec!["/api/weekly-tasks".to_string(), "/api/stats".to_string()],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub url: String,
}

impl Default for NotificationDefaults {
  fn default() -> Self {
    Self {
      title: "TaskPilot".to_string(),
      body: "Stay on track with your tasks!".to_string(),
      icon: "/icons/icon-192.png".to_string(),
      badge: "/icons/icon-96.png".to_string(),
      url: "/".to_string(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
  /// Skip the waiting phase and activate as soon as install completes
  pub activate_immediately: bool,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./taskpilot.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/taskpilot/config.yaml
  ///
  /// Falls back to built-in defaults when no file exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("taskpilot.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("taskpilot").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.cache.version.trim().is_empty() {
      return Err(eyre!("cache.version must not be empty"));
    }
    Ok(config)
  }

  /// Resolve the data directory, falling back to the platform default.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("taskpilot"))
  }
}
