use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use tokio::runtime::Runtime;

use crate::api_check::{self, ApiStatus};
use crate::config::{self, ProvisionerConfig};
use crate::delegation;
use crate::keys::IamKeyIssuer;
use crate::operator_log;
use crate::pipeline::{self, JobOutcome, ProvisioningJob, ProvisioningPipeline, ProvisioningReport};
use crate::prompt::ConsolePrompt;
use crate::runner::CommandRunner;
use crate::sink::HttpKeySink;

#[derive(Parser)]
#[command(name = "drive-audit-provisioner")]
#[command(
    about = "Provision the Google Cloud project, service account and delegated key for Drive Audit",
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        help = "Configuration file (defaults to the per-user config directory)."
    )]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Provision(ProvisionArgs),
    AuthUrl(AuthUrlArgs),
    CheckApi(CheckApiArgs),
    Config(ConfigArgs),
}

/// Per-run overrides of individual configuration fields.
#[derive(Args, Clone, Debug, Default)]
struct ConfigOverrides {
    #[arg(long, help = "Directory the key file is staged in.")]
    key_dir: Option<PathBuf>,
    #[arg(long, help = "Key storage function URL.")]
    sink_endpoint: Option<String>,
    #[arg(long, help = "Bucket the key storage function writes to.")]
    bucket: Option<String>,
    #[arg(long)]
    max_attempts: Option<u32>,
    #[arg(long)]
    retry_delay_secs: Option<u64>,
    #[arg(long, help = "Debug log file.")]
    log_file: Option<PathBuf>,
}

impl ConfigOverrides {
    fn apply(self, config: &mut ProvisionerConfig) {
        if let Some(dir) = self.key_dir {
            config.key_dir = Some(dir);
        }
        if let Some(endpoint) = self.sink_endpoint {
            config.sink.endpoint = endpoint;
        }
        if let Some(bucket) = self.bucket {
            config.sink.bucket_name = bucket;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.retry.max_attempts = max_attempts;
        }
        if let Some(delay) = self.retry_delay_secs {
            config.retry.retry_delay_secs = delay;
        }
        if let Some(log_file) = self.log_file {
            config.log_file = log_file;
        }
    }
}

#[derive(Parser)]
#[command(
    about = "Create the project, enable APIs, create and authorize the service account, then issue and store its key.",
    after_help = "Main options:\n  --domain <DOMAIN>\n\nOptional options:\n  --project-id <ID> (reuse or pin the project)\n  --key-dir <PATH>\n  --sink-endpoint <URL>\n  --bucket <NAME>\n  --max-attempts <N>\n  --retry-delay-secs <N>\n  --log-file <PATH>"
)]
struct ProvisionArgs {
    #[arg(long, help = "Workspace domain the service account is provisioned for.")]
    domain: String,
    #[arg(long, help = "Project id to create or reuse instead of a generated one.")]
    project_id: Option<String>,
    #[command(flatten)]
    overrides: ConfigOverrides,
}

#[derive(Parser)]
#[command(about = "Print the domain-wide delegation URL for a service account client id.")]
struct AuthUrlArgs {
    #[arg(long)]
    client_id: String,
}

#[derive(Parser)]
#[command(about = "Call a Google API with an access token and report whether it is usable.")]
struct CheckApiArgs {
    #[arg(long)]
    url: String,
    #[arg(long)]
    access_token: String,
}

#[derive(Parser)]
#[command(about = "Print the effective configuration as YAML.")]
struct ConfigArgs {
    #[arg(long, help = "Also write it to the configuration file.")]
    save: bool,
    #[command(flatten)]
    overrides: ConfigOverrides,
}

impl Cli {
    pub fn run(self) -> anyhow::Result<()> {
        let mut config = config::load_config(self.config.as_deref())?;
        match self.command {
            Command::Provision(args) => {
                args.overrides.clone().apply(&mut config);
                config.validate()?;
                args.run(config)
            }
            Command::AuthUrl(args) => args.run(&config),
            Command::CheckApi(args) => args.run(&config),
            Command::Config(args) => {
                let save = args.save;
                args.overrides.apply(&mut config);
                config.validate()?;
                print!("{}", serde_yaml_bw::to_string(&config)?);
                if save {
                    let path = match self.config {
                        Some(path) => path,
                        None => config::config_path()?,
                    };
                    config::save_config(&config, &path)?;
                    eprintln!("Saved configuration to {}", path.display());
                }
                Ok(())
            }
        }
    }
}

impl ProvisionArgs {
    fn run(self, config: ProvisionerConfig) -> anyhow::Result<()> {
        operator_log::init(&config.log_file)?;
        let config = Arc::new(config);
        print!("{}", pipeline::welcome_banner(&config));

        let runner = CommandRunner::shell(config.retry.policy());
        let pipeline = ProvisioningPipeline::new(
            config.clone(),
            runner.clone(),
            Arc::new(ConsolePrompt),
            Arc::new(IamKeyIssuer::new(runner, config.user_agent())),
            Arc::new(HttpKeySink::new(config.sink.clone())),
        )?;
        let mut job = ProvisioningJob::new(&self.domain, &config, Local::now(), self.project_id);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build tokio runtime")?;
        let result = runtime.block_on(pipeline.run(&mut job));
        shutdown(runtime);

        match result {
            Ok(report) => {
                print_summary(&job, &report);
                Ok(())
            }
            Err(err) => {
                eprintln!("Provisioning failed: {err}");
                eprintln!("See {} for details.", config.log_file.display());
                std::process::exit(err.exit_code());
            }
        }
    }
}

fn shutdown(runtime: Runtime) {
    runtime.shutdown_timeout(std::time::Duration::from_secs(1));
}

fn print_summary(job: &ProvisioningJob, report: &ProvisioningReport) {
    match &job.outcome {
        Some(JobOutcome::Aborted { step }) => {
            println!("Cancelled during \"{step}\"; nothing further was created.");
            if let Some(url) = &report.authorize_url {
                println!("Delegation URL: {url}");
            }
        }
        Some(JobOutcome::Completed) | None => {
            if let Some(project) = &report.project {
                println!("Project: {}", project.project_id);
            }
            if let Some(account) = &report.service_account {
                println!("Service account: {}", account.email);
            }
            if let Some(name) = &report.persisted_as {
                println!("Key stored as: {name}");
            }
            if !report.authorized
                && let Some(url) = &report.authorize_url
            {
                println!("Authorize the service account before use: {url}");
            }
        }
        Some(JobOutcome::Fatal { step, exit_code }) => {
            println!("Failed during \"{step}\" (exit code {exit_code}).");
        }
    }
}

impl AuthUrlArgs {
    fn run(self, config: &ProvisionerConfig) -> anyhow::Result<()> {
        println!(
            "{}",
            delegation::authorize_url(
                &config.delegation_url_template,
                &self.client_id,
                &config.scopes
            )
        );
        Ok(())
    }
}

impl CheckApiArgs {
    fn run(self, config: &ProvisionerConfig) -> anyhow::Result<()> {
        let response =
            api_check::execute_api_request(&self.url, &self.access_token, &config.user_agent());
        let status = match api_check::classify(response.as_deref()) {
            ApiStatus::Available => "ok",
            ApiStatus::ApiDisabled => "api disabled",
            ApiStatus::ServiceDisabled => "service disabled",
        };
        println!("{status}");
        Ok(())
    }
}
