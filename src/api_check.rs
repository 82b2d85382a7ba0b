use std::collections::HashSet;
use std::sync::LazyLock;

use anyhow::Context;
use serde_json::Value;
use tracing::{debug, error};

static SERVICE_DISABLED_REASONS: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| HashSet::from(["notACalendarUser", "notFound", "authError"]));

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiStatus {
    Available,
    ApiDisabled,
    ServiceDisabled,
}

pub fn classify(raw_api_response: Option<&str>) -> ApiStatus {
    if is_api_disabled(raw_api_response) {
        ApiStatus::ApiDisabled
    } else if is_service_disabled(raw_api_response) {
        ApiStatus::ServiceDisabled
    } else {
        ApiStatus::Available
    }
}

/// A missing response counts as disabled.
pub fn is_api_disabled(raw_api_response: Option<&str>) -> bool {
    let Some(raw) = raw_api_response else {
        return true;
    };
    error_message(raw).is_some_and(|message| message.contains("it is disabled"))
}

/// A missing response counts as disabled.
pub fn is_service_disabled(raw_api_response: Option<&str>) -> bool {
    let Some(raw) = raw_api_response else {
        return true;
    };
    let Ok(response) = serde_json::from_str::<Value>(raw) else {
        return false;
    };
    let reason = response
        .pointer("/error/errors/0/reason")
        .and_then(Value::as_str);
    if reason.is_some_and(|reason| SERVICE_DISABLED_REASONS.contains(reason)) {
        return true;
    }
    response
        .pointer("/error/message")
        .and_then(Value::as_str)
        .is_some_and(|message| message.contains("service not enabled"))
}

fn error_message(raw: &str) -> Option<String> {
    let response: Value = serde_json::from_str(raw).ok()?;
    response
        .pointer("/error/message")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// GET `url` with a bearer token. Returns the body for any HTTP status, `None`
/// when the request could not be made.
pub fn execute_api_request(url: &str, token: &str, user_agent: &str) -> Option<String> {
    debug!(url, "executing API request");
    let response = ureq::get(url)
        .config()
        .http_status_as_error(false)
        .build()
        .header("Authorization", &format!("Bearer {token}"))
        .header("Content-Type", "application/json")
        .header("User-Agent", user_agent)
        .call();
    match response {
        Ok(mut resp) => match resp.body_mut().read_to_string().context("read API response") {
            Ok(body) => {
                debug!(body = %body, "API response");
                Some(body)
            }
            Err(err) => {
                error!("Failed to execute API request: {err:#}");
                None
            }
        },
        Err(err) => {
            error!("Failed to execute API request: {err}");
            None
        }
    }
}
