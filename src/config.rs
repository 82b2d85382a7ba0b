use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow};
use directories_next::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};

use crate::runner::RetryPolicy;

pub const CONFIG_DIR_ENV: &str = "DRIVE_AUDIT_PROVISIONER_CONFIG_DIR";
pub const VERSION: &str = "1";

pub const DEFAULT_TOOL_NAME: &str = "Pawa-IT-Drive-Audit";
pub const DEFAULT_TOOL_NAME_FRIENDLY: &str = "Pawa IT Drive Audit Tool";
pub const DEFAULT_DELEGATION_URL_TEMPLATE: &str = "https://admin.google.com/ac/owl/domainwidedelegation?overwriteClientId=true&clientIdToAdd={client_id}&clientScopeToAdd={scopes}";
pub const DEFAULT_SINK_ENDPOINT: &str =
    "https://us-central1-test-driveaudit-development.cloudfunctions.net/function-2";
pub const DEFAULT_BUCKET_NAME: &str = "test-driveaudit-development-creds";
pub const DEFAULT_LOG_FILE: &str = "create_service_account.log";

/// Immutable description of what a provisioning run creates.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// GCP identifiers derive from this name; keep it to letters, digits and hyphens.
    pub tool_name: String,
    pub tool_name_friendly: String,
    /// APIs to enable. The first entry doubles as the terms-of-service probe, so
    /// `admin.googleapis.com` must come first when it is included.
    pub apis: Vec<String>,
    pub scopes: Vec<String>,
    pub delegation_url_template: String,
    pub retry: RetryDefaults,
    /// Directory for the staged key file; the home directory when unset.
    pub key_dir: Option<PathBuf>,
    pub sink: SinkConfig,
    pub log_file: PathBuf,
    pub offer_cloudshell_download: bool,
    pub continue_without_authorization: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryDefaults {
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SinkConfig {
    pub endpoint: String,
    pub bucket_name: String,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            tool_name: DEFAULT_TOOL_NAME.to_string(),
            tool_name_friendly: DEFAULT_TOOL_NAME_FRIENDLY.to_string(),
            apis: default_apis(),
            scopes: default_scopes(),
            delegation_url_template: DEFAULT_DELEGATION_URL_TEMPLATE.to_string(),
            retry: RetryDefaults::default(),
            key_dir: None,
            sink: SinkConfig::default(),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            offer_cloudshell_download: false,
            continue_without_authorization: false,
        }
    }
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_secs: 5,
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_SINK_ENDPOINT.to_string(),
            bucket_name: DEFAULT_BUCKET_NAME.to_string(),
        }
    }
}

impl RetryDefaults {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_secs(self.retry_delay_secs))
    }
}

impl ProvisionerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if crate::naming::tool_slug(&self.tool_name).is_empty() {
            return Err(anyhow!(
                "tool_name {:?} has no letters or digits to build identifiers from",
                self.tool_name
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be at least 1"));
        }
        if !self.delegation_url_template.contains("{client_id}")
            || !self.delegation_url_template.contains("{scopes}")
        {
            return Err(anyhow!(
                "delegation_url_template must contain {{client_id}} and {{scopes}}"
            ));
        }
        Ok(())
    }

    pub fn resolved_key_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.key_dir {
            return Ok(dir.clone());
        }
        let dirs = BaseDirs::new().ok_or_else(|| anyhow!("unable to determine home directory"))?;
        Ok(dirs.home_dir().to_path_buf())
    }

    pub fn user_agent(&self) -> String {
        format!("{}_create_service_account_v{VERSION}", self.tool_name)
    }
}

fn default_apis() -> Vec<String> {
    [
        "admin.googleapis.com",
        "contacts.googleapis.com",
        "gmail.googleapis.com",
        "drive.googleapis.com",
        "driveactivity.googleapis.com",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_scopes() -> Vec<String> {
    [
        "https://www.googleapis.com/auth/drive",
        "https://www.googleapis.com/auth/drive.activity.readonly",
        "https://www.googleapis.com/auth/admin.directory.user",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Loads the configuration from `explicit`, or from the default location when
/// it exists, falling back to built-in defaults.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<ProvisionerConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let path = config_path()?;
            if !path.exists() {
                return Ok(ProvisionerConfig::default());
            }
            path
        }
    };
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config: ProvisionerConfig = serde_yaml_bw::from_str(&contents)
        .with_context(|| format!("parse config {}", path.display()))?;
    Ok(config)
}

pub fn save_config(config: &ProvisionerConfig, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_yaml_bw::to_string(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn config_path() -> anyhow::Result<PathBuf> {
    if let Ok(value) = std::env::var(CONFIG_DIR_ENV) {
        return Ok(Path::new(&value).join("config.yaml"));
    }
    let dirs = ProjectDirs::from("", "pawait", "drive-audit-provisioner")
        .ok_or_else(|| anyhow!("unable to determine config directory"))?;
    Ok(dirs.config_dir().join("config.yaml"))
}
