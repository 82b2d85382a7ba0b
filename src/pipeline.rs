//! The provisioning pipeline.
//!
//! Steps run in a fixed order; only API enablement fans out. Expected conflicts
//! (project or service account already present) fall back to fetching the
//! existing resource, operator cancellations end the run cleanly, and every other
//! failure is returned as a [`ProvisionError`] carrying the exit status the
//! process should end with. Once a key is staged it is destroyed before the run
//! returns, whether or not it reached the sink.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::apis::ApiEnablementCoordinator;
use crate::config::ProvisionerConfig;
use crate::delegation;
use crate::error::{ProvisionError, ProvisionResult};
use crate::gcloud;
use crate::keys::{KeyIssuer, KeyLifecycleManager, KeyMaterial};
use crate::naming;
use crate::prompt::{self, OperatorPrompt};
use crate::resources::{ProjectIdentity, ServiceAccountIdentity};
use crate::runner::{CommandRunner, RetryPolicy};
use crate::sink::KeySink;
use crate::terms::{TermsState, TosRecoveryLoop};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    CreateProject,
    VerifyTerms,
    EnableApis,
    CreateServiceAccount,
    AuthorizeServiceAccount,
    CreateKey,
    PersistKey,
    DestroyKey,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureMode {
    /// Exhausted retries end the run.
    Fatal,
    /// An "already exists" failure falls back to fetching the resource.
    Recoverable,
    /// Blocks on the operator, who may cancel.
    OperatorGated,
}

impl Step {
    pub const ORDER: [Step; 8] = [
        Step::CreateProject,
        Step::VerifyTerms,
        Step::EnableApis,
        Step::CreateServiceAccount,
        Step::AuthorizeServiceAccount,
        Step::CreateKey,
        Step::PersistKey,
        Step::DestroyKey,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Step::CreateProject => "create project",
            Step::VerifyTerms => "verify terms of service",
            Step::EnableApis => "enable APIs",
            Step::CreateServiceAccount => "create service account",
            Step::AuthorizeServiceAccount => "authorize service account",
            Step::CreateKey => "create service account key",
            Step::PersistKey => "persist key",
            Step::DestroyKey => "destroy local key",
        }
    }

    pub fn failure_mode(self) -> FailureMode {
        match self {
            Step::CreateProject | Step::CreateServiceAccount => FailureMode::Recoverable,
            Step::VerifyTerms | Step::AuthorizeServiceAccount => FailureMode::OperatorGated,
            Step::EnableApis | Step::CreateKey | Step::PersistKey | Step::DestroyKey => {
                FailureMode::Fatal
            }
        }
    }

    /// Policy for the step's primary command.
    pub fn retry_policy(self, defaults: RetryPolicy) -> RetryPolicy {
        match self {
            Step::VerifyTerms => defaults.single_attempt().suppressing_errors(),
            _ if self.failure_mode() == FailureMode::Recoverable => defaults.suppressing_errors(),
            _ => defaults,
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Aborted { step: Step },
    Fatal { step: Step, exit_code: i32 },
}

impl JobOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            JobOutcome::Completed | JobOutcome::Aborted { .. } => 0,
            JobOutcome::Fatal { exit_code, .. } => *exit_code,
        }
    }
}

/// The single in-flight provisioning run.
#[derive(Clone, Debug)]
pub struct ProvisioningJob {
    pub domain: String,
    pub project_id: String,
    pub project_display_name: String,
    pub service_account_name: String,
    pub started_at: DateTime<Local>,
    pub current_step: Option<Step>,
    pub completed: Vec<Step>,
    pub outcome: Option<JobOutcome>,
}

impl ProvisioningJob {
    pub fn new(
        domain: &str,
        config: &ProvisionerConfig,
        started_at: DateTime<Local>,
        project_id: Option<String>,
    ) -> Self {
        let project_id =
            project_id.unwrap_or_else(|| naming::project_id(&config.tool_name, &started_at));
        Self {
            domain: domain.trim().to_string(),
            project_id,
            project_display_name: naming::project_display_name(&config.tool_name, &started_at),
            service_account_name: naming::service_account_name(&config.tool_name),
            started_at,
            current_step: None,
            completed: Vec::new(),
            outcome: None,
        }
    }

    fn enter(&mut self, step: Step) {
        self.current_step = Some(step);
    }

    fn complete(&mut self, step: Step) {
        self.completed.push(step);
    }

    fn abort(&mut self, step: Step) {
        self.outcome = Some(JobOutcome::Aborted { step });
    }

    fn fail(&mut self, exit_code: i32) {
        let step = self.current_step.unwrap_or(Step::CreateProject);
        self.outcome = Some(JobOutcome::Fatal { step, exit_code });
    }
}

/// What a run produced, for the operator summary.
#[derive(Clone, Debug, Default)]
pub struct ProvisioningReport {
    pub project: Option<ProjectIdentity>,
    pub service_account: Option<ServiceAccountIdentity>,
    pub authorize_url: Option<String>,
    pub authorized: bool,
    pub key_path: Option<PathBuf>,
    pub persisted_as: Option<String>,
}

pub struct ProvisioningPipeline {
    config: Arc<ProvisionerConfig>,
    runner: CommandRunner,
    prompt: Arc<dyn OperatorPrompt>,
    issuer: Arc<dyn KeyIssuer>,
    sink: Arc<dyn KeySink>,
    key_dir: PathBuf,
}

impl ProvisioningPipeline {
    pub fn new(
        config: Arc<ProvisionerConfig>,
        runner: CommandRunner,
        prompt: Arc<dyn OperatorPrompt>,
        issuer: Arc<dyn KeyIssuer>,
        sink: Arc<dyn KeySink>,
    ) -> anyhow::Result<Self> {
        let key_dir = config.resolved_key_dir()?;
        Ok(Self {
            config,
            runner,
            prompt,
            issuer,
            sink,
            key_dir,
        })
    }

    /// Drives `job` to a terminal outcome. The job records the outcome on every
    /// path, including failures.
    pub async fn run(&self, job: &mut ProvisioningJob) -> ProvisionResult<ProvisioningReport> {
        let mut report = ProvisioningReport::default();
        match self.execute(job, &mut report).await {
            Ok(()) => {
                if job.outcome.is_none() {
                    job.outcome = Some(JobOutcome::Completed);
                    info!("Done! \u{2705}");
                }
                Ok(report)
            }
            Err(err) => {
                job.fail(err.exit_code());
                debug!(step = ?job.current_step, error = ?err, "provisioning failed");
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        job: &mut ProvisioningJob,
        report: &mut ProvisioningReport,
    ) -> ProvisionResult<()> {
        job.enter(Step::CreateProject);
        let project = self.create_project(job).await?;
        let project_id = project.project_id.clone();
        report.project = Some(project);
        job.complete(Step::CreateProject);

        job.enter(Step::VerifyTerms);
        let terms = TosRecoveryLoop::new(self.runner.clone(), self.prompt.clone());
        let probe = self.config.apis.first().map(String::as_str);
        if terms.verify(&project_id, probe).await? == TermsState::Aborted {
            job.abort(Step::VerifyTerms);
            return Ok(());
        }
        job.complete(Step::VerifyTerms);

        job.enter(Step::EnableApis);
        let remaining = self.config.apis.get(1..).unwrap_or_default();
        ApiEnablementCoordinator::new(self.runner.clone())
            .enable(&project_id, remaining)
            .await?;
        job.complete(Step::EnableApis);

        job.enter(Step::CreateServiceAccount);
        let account = self.create_service_account(job, &project_id).await?;
        report.service_account = Some(account.clone());
        job.complete(Step::CreateServiceAccount);

        job.enter(Step::AuthorizeServiceAccount);
        let url = delegation::authorize_url(
            &self.config.delegation_url_template,
            &account.unique_id,
            &self.config.scopes,
        );
        report.authorize_url = Some(url.clone());
        report.authorized = self.authorize_service_account(&url)?;
        if !report.authorized {
            if !self.config.continue_without_authorization {
                info!("Service account not authorized, cancelling before a key is issued");
                job.abort(Step::AuthorizeServiceAccount);
                return Ok(());
            }
            warn!(url = %url, "continuing without domain-wide delegation; authorize the client later");
        }
        job.complete(Step::AuthorizeServiceAccount);

        job.enter(Step::CreateKey);
        let key_path =
            naming::key_file_path(&self.key_dir, &self.config.tool_name, &job.started_at);
        let keys = KeyLifecycleManager::new(self.issuer.clone(), key_path);
        let material = keys.stage(&account).await?;
        report.key_path = Some(material.path().to_path_buf());
        job.complete(Step::CreateKey);

        job.enter(Step::PersistKey);
        let delivered = self.deliver_key(job, &material).await;
        info!("Deleting local service account key...");
        let destroyed = keys.destroy(material);
        match delivered {
            Ok(file_name) => report.persisted_as = Some(file_name),
            Err(err) => {
                if let Err(erase_err) = destroyed {
                    error!(error = %erase_err, "local key could not be erased");
                }
                return Err(err);
            }
        }
        job.complete(Step::PersistKey);

        job.enter(Step::DestroyKey);
        destroyed?;
        info!("Local service account key deleted \u{2705}");
        job.complete(Step::DestroyKey);
        Ok(())
    }

    async fn create_project(&self, job: &ProvisioningJob) -> ProvisionResult<ProjectIdentity> {
        info!("Creating project...");
        let command = gcloud::create_project(&job.project_id, &job.project_display_name);
        let policy = Step::CreateProject.retry_policy(self.runner.defaults());
        let result = self.runner.run(&command, policy).await?;
        if result.exit_code != 0 {
            if !gcloud::is_already_exists(&result.stderr) {
                debug!(stderr = %result.stderr.trim(), "creation stderr");
                error!(command = %command, exit_code = result.exit_code, "Failed to execute command");
                return Err(ProvisionError::command_failed(
                    &command,
                    result.exit_code,
                    &result.stderr,
                ));
            }
            info!("Project {} already exists, using it", job.project_id);
        }
        let project: ProjectIdentity = self
            .describe(&gcloud::describe_project(&job.project_id))
            .await?;
        info!("{} successfully created \u{2705}", project.project_id);
        Ok(project)
    }

    async fn create_service_account(
        &self,
        job: &ProvisioningJob,
        project_id: &str,
    ) -> ProvisionResult<ServiceAccountIdentity> {
        info!("Creating service account...");
        let display_name = naming::service_account_display_name(&self.config.tool_name);
        let command =
            gcloud::create_service_account(project_id, &job.service_account_name, &display_name);
        let policy = Step::CreateServiceAccount.retry_policy(self.runner.defaults());
        let result = self.runner.run(&command, policy).await?;
        if result.exit_code != 0 {
            if !gcloud::is_already_exists(&result.stderr) {
                debug!(stderr = %result.stderr.trim(), "creation stderr");
                error!(command = %command, exit_code = result.exit_code, "Failed to execute command");
                return Err(ProvisionError::command_failed(
                    &command,
                    result.exit_code,
                    &result.stderr,
                ));
            }
            info!(
                "Service account {} already exists, fetching it",
                job.service_account_name
            );
        }
        let email = naming::service_account_email(&job.service_account_name, project_id);
        let account: ServiceAccountIdentity = self
            .describe(&gcloud::describe_service_account(project_id, &email))
            .await?;
        info!("{} successfully created \u{2705}", job.service_account_name);
        Ok(account)
    }

    /// `false` when the operator cancels at the delegation prompt.
    fn authorize_service_account(&self, url: &str) -> ProvisionResult<bool> {
        let message = format!(
            "If you've accepted the terms of service, click on the link below {url}\npress Enter to continue or 'n' to cancel:"
        );
        self.prompt.confirm(&message).map_err(ProvisionError::Prompt)
    }

    /// Optional Cloud Shell download, then upload to the sink. Returns the name
    /// the key was stored under.
    async fn deliver_key(
        &self,
        job: &ProvisioningJob,
        material: &KeyMaterial,
    ) -> ProvisionResult<String> {
        if self.config.offer_cloudshell_download {
            let answer = self
                .prompt
                .ask("Press y to download the key file:")
                .map_err(ProvisionError::Prompt)?;
            if prompt::is_yes(&answer) {
                let path = material.path().display().to_string();
                self.runner
                    .run_default(&gcloud::cloudshell_download(&path))
                    .await?;
            }
        }

        let policy = Step::PersistKey
            .retry_policy(self.runner.defaults())
            .requiring_output();
        let accounts = self.runner.run(&gcloud::active_account(), policy).await?;
        let admin_email = accounts
            .stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default()
            .to_string();
        if naming::email_domain(&admin_email)
            .is_some_and(|domain| !domain.eq_ignore_ascii_case(&job.domain))
        {
            warn!(
                admin = %admin_email,
                domain = %job.domain,
                "active account does not belong to the target domain"
            );
        }
        let file_name = naming::sink_file_name(&admin_email).map_err(ProvisionError::KeyPersistence)?;
        let key = material.key_json().map_err(ProvisionError::KeyPersistence)?;
        self.sink
            .persist(&file_name, key)
            .await
            .map_err(ProvisionError::KeyPersistence)?;
        info!("Service account key stored as {file_name} \u{2705}");
        Ok(file_name)
    }

    async fn describe<T: DeserializeOwned>(&self, command: &str) -> ProvisionResult<T> {
        let policy = self.runner.defaults().requiring_output();
        let result = self.runner.run(command, policy).await?;
        serde_json::from_str(&result.stdout).map_err(|err| ProvisionError::UnexpectedOutput {
            command: command.to_string(),
            reason: err.to_string(),
        })
    }
}

pub fn welcome_banner(config: &ProvisionerConfig) -> String {
    format!(
        "Welcome! This script will create and authorize the resources that are necessary to use {}. \
         The following steps will be performed on your behalf:\n\n\
         1. Create a Google Cloud Platform project\n\
         2. Enable APIs\n\
         3. Create a service account\n\
         4. Authorize the service account\n\
         5. Create a service account key\n\n",
        config.tool_name_friendly
    )
}
