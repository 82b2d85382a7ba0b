use serde::{Deserialize, Serialize};

/// Project as reported by `gcloud projects describe --format=json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectIdentity {
    pub project_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub project_number: Option<String>,
}

/// Service account as reported by `gcloud iam service-accounts describe --format=json`.
///
/// Produced once by the creation step and only read afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountIdentity {
    pub email: String,
    pub unique_id: String,
    pub project_id: String,
}
