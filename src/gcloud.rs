use shell_words::quote;

/// Markers gcloud prints when a resource with the requested id already exists.
pub const ALREADY_EXISTS_MARKERS: [&str; 3] = ["already exists", "ALREADY_EXISTS", "already in use"];

pub fn is_already_exists(stderr: &str) -> bool {
    ALREADY_EXISTS_MARKERS
        .iter()
        .any(|marker| stderr.contains(marker))
}

pub fn create_project(project_id: &str, display_name: &str) -> String {
    format!(
        "gcloud projects create {} --name {} --set-as-default",
        quote(project_id),
        quote(display_name)
    )
}

pub fn describe_project(project_id: &str) -> String {
    format!("gcloud projects describe {} --format=json", quote(project_id))
}

pub fn enable_service(project_id: &str, api: &str) -> String {
    format!(
        "gcloud services enable {} --project {}",
        quote(api),
        quote(project_id)
    )
}

pub fn create_service_account(project_id: &str, name: &str, display_name: &str) -> String {
    format!(
        "gcloud iam service-accounts create {} --display-name {} --project {}",
        quote(name),
        quote(display_name),
        quote(project_id)
    )
}

pub fn describe_service_account(project_id: &str, email: &str) -> String {
    format!(
        "gcloud iam service-accounts describe {} --project {} --format=json",
        quote(email),
        quote(project_id)
    )
}

pub fn active_account() -> String {
    "gcloud auth list --filter=status:ACTIVE --format=\"value(account)\"".to_string()
}

pub fn print_access_token() -> String {
    "gcloud auth print-access-token".to_string()
}

pub fn cloudshell_download(path: &str) -> String {
    format!("cloudshell download {}", quote(path))
}
