//! Terms-of-service gate on the first API-enable call.
//!
//! The probe enables the first configured API once. A failure carrying the
//! `UREQ_TOS_NOT_ACCEPTED` marker blocks on the operator, who accepts the
//! agreement in a browser and asks for another probe. There is no attempt limit:
//! the loop ends only when the probe succeeds, the operator cancels, or the probe
//! fails for an unrelated reason.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{ProvisionError, ProvisionResult};
use crate::gcloud;
use crate::prompt::OperatorPrompt;
use crate::runner::CommandRunner;

pub const TOS_NOT_ACCEPTED_MARKER: &str = "UREQ_TOS_NOT_ACCEPTED";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TermsAgreement {
    /// Google APIs Terms of Service.
    Universal,
    /// Google Apps Admin APIs Terms of Service.
    AppsAdmin,
}

impl TermsAgreement {
    pub fn detect(stderr: &str) -> Option<Self> {
        if stderr.contains("universal") {
            Some(TermsAgreement::Universal)
        } else if stderr.contains("appsadmin") {
            Some(TermsAgreement::AppsAdmin)
        } else {
            None
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            TermsAgreement::Universal => "Google APIs Terms of Service",
            TermsAgreement::AppsAdmin => "Google Apps Admin APIs Terms of Service",
        }
    }

    pub fn acceptance_url(self) -> &'static str {
        match self {
            TermsAgreement::Universal => "https://console.developers.google.com/terms/universal",
            TermsAgreement::AppsAdmin => "https://console.developers.google.com/terms/appsadmin",
        }
    }

    pub fn instructions(self) -> String {
        format!(
            "You must first accept the {}. You can accept the terms of service by clicking {} and clicking 'Accept'.\n",
            self.title(),
            self.acceptance_url()
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TermsState {
    Probing,
    BlockedOnTerms(Option<TermsAgreement>),
    Accepted,
    Aborted,
}

pub struct TosRecoveryLoop {
    runner: CommandRunner,
    prompt: Arc<dyn OperatorPrompt>,
}

impl TosRecoveryLoop {
    pub fn new(runner: CommandRunner, prompt: Arc<dyn OperatorPrompt>) -> Self {
        Self { runner, prompt }
    }

    /// Returns [`TermsState::Accepted`] or [`TermsState::Aborted`]; every other
    /// probe failure is fatal.
    pub async fn verify(&self, project_id: &str, probe_api: Option<&str>) -> ProvisionResult<TermsState> {
        info!("Verifying acceptance of Terms of service...");
        let Some(api) = probe_api else {
            info!("Terms of service acceptance verified \u{2705}");
            return Ok(TermsState::Accepted);
        };
        let command = gcloud::enable_service(project_id, api);
        let policy = self.runner.defaults().single_attempt().suppressing_errors();
        let mut state = TermsState::Probing;
        loop {
            state = match state {
                TermsState::Probing => {
                    let result = self.runner.run(&command, policy).await?;
                    if result.exit_code == 0 {
                        TermsState::Accepted
                    } else if result.stderr.contains(TOS_NOT_ACCEPTED_MARKER) {
                        TermsState::BlockedOnTerms(TermsAgreement::detect(&result.stderr))
                    } else {
                        debug!(stderr = %result.stderr.trim(), "terms of service probe stderr");
                        tracing::error!(exit_code = result.exit_code, "terms of service probe failed");
                        return Err(ProvisionError::command_failed(
                            &command,
                            result.exit_code,
                            &result.stderr,
                        ));
                    }
                }
                TermsState::BlockedOnTerms(agreement) => {
                    match agreement {
                        Some(agreement) => {
                            debug!("{} not accepted", agreement.title());
                            self.prompt.notify(&agreement.instructions());
                        }
                        None => {
                            debug!("terms of service not accepted for an unrecognised agreement");
                            self.prompt.notify(
                                "You must first accept the terms of service for this API in the Cloud Console.\n",
                            );
                        }
                    }
                    let retry = self
                        .prompt
                        .confirm(
                            "If you've accepted the terms of service, press Enter to try again or 'n' to cancel:",
                        )
                        .map_err(ProvisionError::Prompt)?;
                    if retry {
                        TermsState::Probing
                    } else {
                        TermsState::Aborted
                    }
                }
                TermsState::Accepted => {
                    info!("Terms of service acceptance verified \u{2705}");
                    return Ok(TermsState::Accepted);
                }
                TermsState::Aborted => {
                    info!("Terms of service not accepted, cancelling");
                    return Ok(TermsState::Aborted);
                }
            };
        }
    }
}
