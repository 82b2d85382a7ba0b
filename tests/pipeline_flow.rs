mod support;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone};
use drive_audit_provisioner::config::ProvisionerConfig;
use drive_audit_provisioner::error::ProvisionError;
use drive_audit_provisioner::keys::KeyIssuer;
use drive_audit_provisioner::naming;
use drive_audit_provisioner::pipeline::{
    JobOutcome, ProvisioningJob, ProvisioningPipeline, Step,
};
use drive_audit_provisioner::prompt::OperatorPrompt;
use drive_audit_provisioner::sink::KeySink;
use drive_audit_provisioner::terms::TOS_NOT_ACCEPTED_MARKER;

use support::{
    FailingSink, FakeIssuer, RecordingSink, ScriptedExecutor, ScriptedPrompt, fail, ok,
    project_json, runner, sample_key, service_account_json,
};

const PROJECT: &str = "pawa-it-drive-audit-1760000000";
const CLIENT_ID: &str = "104291";
const SINK_FILE: &str = "example.com-service-account-key.json";

fn started_at() -> DateTime<Local> {
    Local.timestamp_opt(1_760_000_000, 0).unwrap()
}

fn config_in(dir: &tempfile::TempDir) -> ProvisionerConfig {
    ProvisionerConfig {
        key_dir: Some(dir.path().to_path_buf()),
        ..ProvisionerConfig::default()
    }
}

fn key_path(config: &ProvisionerConfig) -> PathBuf {
    naming::key_file_path(
        config.key_dir.as_deref().unwrap(),
        &config.tool_name,
        &started_at(),
    )
}

fn healthy_gcloud() -> ScriptedExecutor {
    ScriptedExecutor::default()
        .on("projects create", vec![ok("")])
        .on("projects describe", vec![ok(&project_json(PROJECT))])
        .on("service-accounts create", vec![ok("")])
        .on(
            "service-accounts describe",
            vec![ok(&service_account_json(PROJECT, CLIENT_ID))],
        )
        .on("auth list", vec![ok("admin@example.com\n")])
}

fn pipeline(
    config: &ProvisionerConfig,
    executor: &Arc<ScriptedExecutor>,
    prompt: Arc<dyn OperatorPrompt>,
    issuer: Arc<dyn KeyIssuer>,
    sink: Arc<dyn KeySink>,
) -> ProvisioningPipeline {
    ProvisioningPipeline::new(
        Arc::new(config.clone()),
        runner(executor.clone()),
        prompt,
        issuer,
        sink,
    )
    .unwrap()
}

fn job(config: &ProvisionerConfig, project_id: Option<&str>) -> ProvisioningJob {
    ProvisioningJob::new(
        "example.com",
        config,
        started_at(),
        project_id.map(str::to_string),
    )
}

fn position(calls: &[String], needle: &str) -> usize {
    calls
        .iter()
        .position(|call| call.contains(needle))
        .unwrap_or_else(|| panic!("no call containing {needle:?}"))
}

#[tokio::test(start_paused = true)]
async fn fresh_run_provisions_stores_and_erases_the_key() {
    let temp = tempfile::tempdir().unwrap();
    let config = config_in(&temp);
    let executor = Arc::new(healthy_gcloud());
    let issuer = Arc::new(FakeIssuer::default());
    let sink = RecordingSink::watching(key_path(&config));
    let pipeline = pipeline(
        &config,
        &executor,
        ScriptedPrompt::answering(&[""]),
        issuer.clone(),
        sink.clone(),
    );
    let mut job = job(&config, None);

    let report = pipeline.run(&mut job).await.unwrap();

    assert_eq!(job.outcome, Some(JobOutcome::Completed));
    assert_eq!(job.completed, Step::ORDER.to_vec());
    assert_eq!(report.project.unwrap().project_id, PROJECT);
    assert_eq!(report.service_account.unwrap().unique_id, CLIENT_ID);
    assert!(report.authorized);
    let url = report.authorize_url.unwrap();
    assert!(url.contains("clientIdToAdd=104291"));
    assert!(url.contains("https%3A%2F%2Fwww.googleapis.com%2Fauth%2Fdrive%2C"));

    assert_eq!(issuer.issued(), 1);
    assert!(sink.saw_key_file());
    assert_eq!(
        sink.stored(),
        vec![(SINK_FILE.to_string(), sample_key(CLIENT_ID))]
    );
    assert_eq!(report.persisted_as.as_deref(), Some(SINK_FILE));
    assert!(!key_path(&config).exists());

    let calls = executor.calls();
    assert_eq!(
        calls[0],
        format!(
            "gcloud projects create {PROJECT} --name Pawa-IT-Drive-Audit-{} --set-as-default",
            started_at().format("%Y-%m-%d")
        )
    );
    // The probe is the only enable call for the first API.
    assert_eq!(executor.count("services enable admin.googleapis.com"), 1);
    for api in [
        "contacts.googleapis.com",
        "gmail.googleapis.com",
        "drive.googleapis.com",
        "driveactivity.googleapis.com",
    ] {
        assert_eq!(executor.count(&format!("services enable {api} --project {PROJECT}")), 1);
        assert!(position(&calls, api) < position(&calls, "service-accounts create"));
    }
    assert!(
        position(&calls, "services enable admin.googleapis.com")
            < position(&calls, "services enable gmail.googleapis.com")
    );
}

#[tokio::test(start_paused = true)]
async fn rerun_against_existing_resources_falls_back_to_fetching_them() {
    let temp = tempfile::tempdir().unwrap();
    let config = config_in(&temp);
    let executor = Arc::new(
        ScriptedExecutor::default()
            .on(
                "projects create",
                vec![fail(
                    1,
                    "ERROR: (gcloud.projects.create) Resource in projects [x] is the subject of a conflict: Requested entity already exists",
                )],
            )
            .on(
                "service-accounts create",
                vec![fail(
                    1,
                    "ERROR: (gcloud.iam.service-accounts.create) ALREADY_EXISTS: Service account already exists within project.",
                )],
            )
            .on("projects describe", vec![ok(&project_json(PROJECT))])
            .on(
                "service-accounts describe",
                vec![ok(&service_account_json(PROJECT, CLIENT_ID))],
            )
            .on("auth list", vec![ok("admin@example.com\n")]),
    );
    let issuer = Arc::new(FakeIssuer::default());
    let sink = RecordingSink::watching(key_path(&config));
    let pipeline = pipeline(
        &config,
        &executor,
        ScriptedPrompt::answering(&[""]),
        issuer.clone(),
        sink.clone(),
    );
    let mut job = job(&config, Some(PROJECT));

    let report = pipeline.run(&mut job).await.unwrap();

    assert_eq!(job.outcome, Some(JobOutcome::Completed));
    assert_eq!(report.project.unwrap().project_number.as_deref(), Some("123456789012"));
    assert_eq!(
        report.service_account.unwrap().email,
        format!("pawa-it-drive-audit-service-account@{PROJECT}.iam.gserviceaccount.com")
    );
    assert_eq!(executor.count("projects create"), 3);
    assert_eq!(executor.count("projects describe"), 1);
    assert_eq!(executor.count("service-accounts describe"), 1);
    assert_eq!(issuer.issued(), 1);
    assert_eq!(sink.stored().len(), 1);
    assert!(!key_path(&config).exists());
}

#[tokio::test(start_paused = true)]
async fn unrelated_project_failure_is_fatal_with_gcloud_exit_code() {
    let temp = tempfile::tempdir().unwrap();
    let config = config_in(&temp);
    let executor = Arc::new(
        ScriptedExecutor::default().on(
            "projects create",
            vec![fail(2, "ERROR: (gcloud.projects.create) PERMISSION_DENIED")],
        ),
    );
    let issuer = Arc::new(FakeIssuer::default());
    let pipeline = pipeline(
        &config,
        &executor,
        ScriptedPrompt::answering(&[]),
        issuer.clone(),
        RecordingSink::watching(key_path(&config)),
    );
    let mut job = job(&config, None);

    let err = pipeline.run(&mut job).await.unwrap_err();

    assert_eq!(err.exit_code(), 2);
    assert_eq!(
        job.outcome,
        Some(JobOutcome::Fatal {
            step: Step::CreateProject,
            exit_code: 2
        })
    );
    assert_eq!(executor.count("projects describe"), 0);
    assert_eq!(issuer.issued(), 0);
}

#[tokio::test(start_paused = true)]
async fn declined_terms_end_the_run_before_any_api_is_enabled() {
    let temp = tempfile::tempdir().unwrap();
    let config = config_in(&temp);
    let executor = Arc::new(healthy_gcloud().on(
        "services enable admin.googleapis.com",
        vec![fail(
            1,
            &format!("FAILED_PRECONDITION: {TOS_NOT_ACCEPTED_MARKER} terms/universal"),
        )],
    ));
    let issuer = Arc::new(FakeIssuer::default());
    let pipeline = pipeline(
        &config,
        &executor,
        ScriptedPrompt::answering(&["n"]),
        issuer.clone(),
        RecordingSink::watching(key_path(&config)),
    );
    let mut job = job(&config, None);

    pipeline.run(&mut job).await.unwrap();

    assert_eq!(
        job.outcome,
        Some(JobOutcome::Aborted {
            step: Step::VerifyTerms
        })
    );
    assert_eq!(job.outcome.as_ref().unwrap().exit_code(), 0);
    assert_eq!(executor.count("services enable"), 1);
    assert_eq!(executor.count("service-accounts create"), 0);
    assert_eq!(issuer.issued(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_api_enablement_stops_before_the_service_account() {
    let temp = tempfile::tempdir().unwrap();
    let config = config_in(&temp);
    let executor = Arc::new(
        ScriptedExecutor::default()
            .on("drive.googleapis.com", vec![fail(3, "ERROR: quota exceeded")])
            .on("projects describe", vec![ok(&project_json(PROJECT))]),
    );
    let issuer = Arc::new(FakeIssuer::default());
    let pipeline = pipeline(
        &config,
        &executor,
        ScriptedPrompt::answering(&[]),
        issuer.clone(),
        RecordingSink::watching(key_path(&config)),
    );
    let mut job = job(&config, None);

    let err = pipeline.run(&mut job).await.unwrap_err();

    assert_eq!(err.exit_code(), 3);
    assert_eq!(
        job.outcome,
        Some(JobOutcome::Fatal {
            step: Step::EnableApis,
            exit_code: 3
        })
    );
    assert_eq!(executor.count("service-accounts create"), 0);
    assert_eq!(issuer.issued(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_authorization_issues_no_key() {
    let temp = tempfile::tempdir().unwrap();
    let config = config_in(&temp);
    let executor = Arc::new(healthy_gcloud());
    let issuer = Arc::new(FakeIssuer::default());
    let prompt = ScriptedPrompt::answering(&["n"]);
    let pipeline = pipeline(
        &config,
        &executor,
        prompt.clone(),
        issuer.clone(),
        RecordingSink::watching(key_path(&config)),
    );
    let mut job = job(&config, None);

    let report = pipeline.run(&mut job).await.unwrap();

    assert_eq!(
        job.outcome,
        Some(JobOutcome::Aborted {
            step: Step::AuthorizeServiceAccount
        })
    );
    assert!(!report.authorized);
    let url = report.authorize_url.unwrap();
    assert!(prompt.asked()[0].contains(&url));
    assert_eq!(issuer.issued(), 0);
    assert!(!key_path(&config).exists());
}

#[tokio::test(start_paused = true)]
async fn unauthorized_run_can_continue_when_configured() {
    let temp = tempfile::tempdir().unwrap();
    let config = ProvisionerConfig {
        continue_without_authorization: true,
        ..config_in(&temp)
    };
    let executor = Arc::new(healthy_gcloud());
    let issuer = Arc::new(FakeIssuer::default());
    let sink = RecordingSink::watching(key_path(&config));
    let pipeline = pipeline(
        &config,
        &executor,
        ScriptedPrompt::answering(&["n"]),
        issuer.clone(),
        sink.clone(),
    );
    let mut job = job(&config, None);

    let report = pipeline.run(&mut job).await.unwrap();

    assert_eq!(job.outcome, Some(JobOutcome::Completed));
    assert!(!report.authorized);
    assert_eq!(issuer.issued(), 1);
    assert_eq!(sink.stored().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn sink_failure_is_fatal_after_the_key_is_erased() {
    let temp = tempfile::tempdir().unwrap();
    let config = config_in(&temp);
    let executor = Arc::new(healthy_gcloud());
    let issuer = Arc::new(FakeIssuer::default());
    let pipeline = pipeline(
        &config,
        &executor,
        ScriptedPrompt::answering(&[""]),
        issuer.clone(),
        Arc::new(FailingSink),
    );
    let mut job = job(&config, None);

    let err = pipeline.run(&mut job).await.unwrap_err();

    assert!(matches!(err, ProvisionError::KeyPersistence(_)));
    assert_eq!(err.exit_code(), 1);
    assert_eq!(
        job.outcome,
        Some(JobOutcome::Fatal {
            step: Step::PersistKey,
            exit_code: 1
        })
    );
    assert_eq!(issuer.issued(), 1);
    assert!(!key_path(&config).exists());
    assert!(std::fs::read_dir(temp.path()).unwrap().next().is_none());
}

#[tokio::test(start_paused = true)]
async fn missing_admin_account_still_erases_the_key() {
    let temp = tempfile::tempdir().unwrap();
    let config = config_in(&temp);
    let executor = Arc::new(
        ScriptedExecutor::default()
            .on("auth list", vec![ok("")])
            .on("projects describe", vec![ok(&project_json(PROJECT))])
            .on(
                "service-accounts describe",
                vec![ok(&service_account_json(PROJECT, CLIENT_ID))],
            ),
    );
    let sink = RecordingSink::watching(key_path(&config));
    let pipeline = pipeline(
        &config,
        &executor,
        ScriptedPrompt::answering(&[""]),
        Arc::new(FakeIssuer::default()),
        sink.clone(),
    );
    let mut job = job(&config, None);

    let err = pipeline.run(&mut job).await.unwrap_err();

    assert!(matches!(err, ProvisionError::CommandFailed { .. }));
    assert_eq!(executor.count("auth list"), 3);
    assert!(sink.stored().is_empty());
    assert!(!key_path(&config).exists());
}

#[tokio::test(start_paused = true)]
async fn cloudshell_download_runs_inside_the_key_window() {
    let temp = tempfile::tempdir().unwrap();
    let config = ProvisionerConfig {
        offer_cloudshell_download: true,
        ..config_in(&temp)
    };
    let executor = Arc::new(healthy_gcloud());
    let sink = RecordingSink::watching(key_path(&config));
    let pipeline = pipeline(
        &config,
        &executor,
        ScriptedPrompt::answering(&["", "Y"]),
        Arc::new(FakeIssuer::default()),
        sink.clone(),
    );
    let mut job = job(&config, None);

    pipeline.run(&mut job).await.unwrap();

    let calls = executor.calls();
    let download = calls
        .iter()
        .find(|call| call.starts_with("cloudshell download"))
        .unwrap();
    assert!(download.contains(&key_path(&config).display().to_string()));
    assert!(position(&calls, "cloudshell download") < position(&calls, "auth list"));
    assert!(sink.saw_key_file());
    assert!(!key_path(&config).exists());
}
