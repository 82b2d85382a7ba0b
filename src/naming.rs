use std::path::{Path, PathBuf};

use anyhow::anyhow;
use chrono::{DateTime, TimeZone};

/// GCP rejects project ids longer than this.
pub const PROJECT_ID_MAX_LEN: usize = 30;

pub const KEY_TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Lowercase form of the tool name restricted to letters, digits and single hyphens.
pub fn tool_slug(tool_name: &str) -> String {
    let mut slug = String::with_capacity(tool_name.len());
    for ch in tool_name.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            slug.push(ch);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// `<slug>-<unix seconds>`, shortening the slug so the id stays within
/// [`PROJECT_ID_MAX_LEN`].
pub fn project_id<Tz: TimeZone>(tool_name: &str, started_at: &DateTime<Tz>) -> String {
    let suffix = started_at.timestamp().to_string();
    let budget = PROJECT_ID_MAX_LEN.saturating_sub(suffix.len() + 1);
    let slug = tool_slug(tool_name);
    let prefix: String = slug.chars().take(budget).collect();
    format!("{}-{suffix}", prefix.trim_end_matches('-'))
}

pub fn project_display_name<Tz: TimeZone>(tool_name: &str, started_at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{tool_name}-{}", started_at.format("%Y-%m-%d"))
}

pub fn service_account_name(tool_name: &str) -> String {
    format!("{}-service-account", tool_slug(tool_name))
}

pub fn service_account_display_name(tool_name: &str) -> String {
    format!("{tool_name} Service Account")
}

pub fn service_account_email(account_name: &str, project_id: &str) -> String {
    format!("{account_name}@{project_id}.iam.gserviceaccount.com")
}

pub fn key_file_path<Tz: TimeZone>(
    key_dir: &Path,
    tool_name: &str,
    started_at: &DateTime<Tz>,
) -> PathBuf
where
    Tz::Offset: std::fmt::Display,
{
    key_dir.join(format!(
        "{}-service-account-key-{}.json",
        tool_name.to_lowercase(),
        started_at.format(KEY_TIMESTAMP_FORMAT)
    ))
}

/// Name of the key object in remote storage, keyed by the admin's email domain.
pub fn sink_file_name(admin_email: &str) -> anyhow::Result<String> {
    let domain = email_domain(admin_email)
        .ok_or_else(|| anyhow!("active account {admin_email:?} is not an email address"))?;
    Ok(format!("{domain}-service-account-key.json"))
}

pub fn email_domain(email: &str) -> Option<&str> {
    let (_, domain) = email.trim().split_once('@')?;
    if domain.is_empty() { None } else { Some(domain) }
}
