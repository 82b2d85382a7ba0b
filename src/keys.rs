//! Service account key lifecycle: issue, stage to disk, erase.
//!
//! The staged key file exists only between [`KeyLifecycleManager::stage`] and
//! [`KeyLifecycleManager::destroy`]. `destroy` consumes the [`KeyMaterial`], and
//! dropping an undestroyed `KeyMaterial` erases the file, so the key never
//! outlives the run whichever path the pipeline takes.

use std::fs::{self, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::{ProvisionError, ProvisionResult};
use crate::gcloud;
use crate::resources::ServiceAccountIdentity;
use crate::runner::CommandRunner;

const IAM_ENDPOINT: &str = "https://iam.googleapis.com/v1";
const ERASE_PATTERNS: [u8; 3] = [0x00, 0xFF, 0x00];

/// Requests a new key for a service account.
///
/// Returns the key in its transport encoding (base64 `privateKeyData`).
#[async_trait]
pub trait KeyIssuer: Send + Sync {
    async fn issue(&self, account: &ServiceAccountIdentity) -> ProvisionResult<String>;
}

/// Issues keys through the IAM REST API with the operator's gcloud credentials.
pub struct IamKeyIssuer {
    runner: CommandRunner,
    user_agent: String,
}

impl IamKeyIssuer {
    pub fn new(runner: CommandRunner, user_agent: impl Into<String>) -> Self {
        Self {
            runner,
            user_agent: user_agent.into(),
        }
    }
}

#[async_trait]
impl KeyIssuer for IamKeyIssuer {
    async fn issue(&self, account: &ServiceAccountIdentity) -> ProvisionResult<String> {
        let policy = self.runner.defaults();
        let token = self
            .runner
            .run(&gcloud::print_access_token(), policy.requiring_output())
            .await?;
        let token = Zeroizing::new(token.trimmed_stdout().to_string());
        let url = format!(
            "{IAM_ENDPOINT}/projects/{}/serviceAccounts/{}/keys",
            account.project_id, account.email
        );

        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            debug!(attempt, url = %url, "requesting service account key");
            let request_url = url.clone();
            let request_token = token.clone();
            let user_agent = self.user_agent.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                request_key(&request_url, &request_token, &user_agent)
            })
            .await
            .map_err(|err| anyhow!("key request task failed: {err}"))
            .and_then(|result| result);
            match outcome {
                Ok(encoded) => return Ok(encoded),
                Err(err) if attempt < max_attempts => {
                    debug!(attempt, error = %format!("{err:#}"), "key request failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(policy.retry_delay).await;
                }
                Err(err) => return Err(ProvisionError::KeyIssuance(err)),
            }
        }
    }
}

fn request_key(url: &str, token: &str, user_agent: &str) -> anyhow::Result<String> {
    let body = json!({
        "privateKeyType": "TYPE_GOOGLE_CREDENTIALS_FILE",
        "keyAlgorithm": "KEY_ALG_RSA_2048",
    });
    let mut response = ureq::post(url)
        .header("Authorization", &format!("Bearer {token}"))
        .header("User-Agent", user_agent)
        .header("Content-Type", "application/json")
        .send_json(&body)
        .context("create key request")?;
    let key: Value = response
        .body_mut()
        .read_json()
        .context("decode create key response")?;
    key.get("privateKeyData")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("create key response has no privateKeyData"))
}

/// Decoded key bytes and the file they are staged in.
pub struct KeyMaterial {
    bytes: Zeroizing<Vec<u8>>,
    path: PathBuf,
    erased: bool,
}

impl KeyMaterial {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The key as the JSON object a credentials file contains.
    pub fn key_json(&self) -> anyhow::Result<Value> {
        serde_json::from_slice(&self.bytes).context("key material is not JSON")
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("path", &self.path)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        if self.erased {
            return;
        }
        self.erased = true;
        if let Err(err) = secure_erase(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to erase staged key");
        }
    }
}

pub struct KeyLifecycleManager {
    issuer: Arc<dyn KeyIssuer>,
    key_path: PathBuf,
}

impl KeyLifecycleManager {
    pub fn new(issuer: Arc<dyn KeyIssuer>, key_path: PathBuf) -> Self {
        Self { issuer, key_path }
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub async fn stage(&self, account: &ServiceAccountIdentity) -> ProvisionResult<KeyMaterial> {
        info!("Creating service account key...");
        let encoded = Zeroizing::new(self.issuer.issue(account).await?);
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|err| ProvisionError::KeyIssuance(anyhow!("decode privateKeyData: {err}")))?,
        );
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(_)) => {}
            _ => {
                return Err(ProvisionError::KeyIssuance(anyhow!(
                    "decoded key is not a JSON credentials file"
                )));
            }
        }

        let material = KeyMaterial {
            bytes,
            path: self.key_path.clone(),
            erased: false,
        };
        write_private_file(&material.path, material.bytes()).map_err(|err| {
            ProvisionError::Other(anyhow!(
                "write key file {}: {err}",
                material.path.display()
            ))
        })?;
        debug!(path = %material.path.display(), "staged service account key");
        info!("Service account key successfully created \u{2705}");
        Ok(material)
    }

    pub fn destroy(&self, mut material: KeyMaterial) -> ProvisionResult<()> {
        material.erased = true;
        secure_erase(&material.path).map_err(|source| ProvisionError::KeyErase {
            path: material.path.display().to_string(),
            source,
        })?;
        debug!(path = %material.path.display(), "erased service account key");
        Ok(())
    }
}

fn write_private_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Overwrites the file in place several times, truncates it, then unlinks it.
/// A missing file is already erased.
pub fn secure_erase(path: &Path) -> io::Result<()> {
    let len = match fs::metadata(path) {
        Ok(metadata) => metadata.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    let mut file = OpenOptions::new().write(true).open(path)?;
    for pattern in ERASE_PATTERNS {
        let block = [pattern; 4096];
        file.seek(SeekFrom::Start(0))?;
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(block.len() as u64) as usize;
            file.write_all(&block[..n])?;
            remaining -= n as u64;
        }
        file.sync_all()?;
    }
    file.set_len(0)?;
    file.sync_all()?;
    drop(file);
    fs::remove_file(path)
}
