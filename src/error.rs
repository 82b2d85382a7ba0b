use thiserror::Error;

/// Failures that end a provisioning run.
///
/// Every variant maps to a process exit status through [`ProvisionError::exit_code`];
/// the binary exits with that status only after scoped cleanup has run.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("command `{command}` failed with exit code {exit_code}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("operator prompt failed: {0}")]
    Prompt(#[source] anyhow::Error),
    #[error("unexpected response from `{command}`: {reason}")]
    UnexpectedOutput { command: String, reason: String },
    #[error("service account key issuance failed: {0}")]
    KeyIssuance(#[source] anyhow::Error),
    #[error("key persistence failed: {0}")]
    KeyPersistence(#[source] anyhow::Error),
    #[error("key file {path} could not be erased: {source}")]
    KeyErase {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProvisionError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ProvisionError::CommandFailed { exit_code, .. } if *exit_code != 0 => *exit_code,
            _ => 1,
        }
    }

    pub fn command_failed(command: &str, exit_code: i32, stderr: &str) -> Self {
        ProvisionError::CommandFailed {
            command: command.to_string(),
            exit_code,
            stderr: stderr.to_string(),
        }
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;
