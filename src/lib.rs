pub mod api_check;
pub mod apis;
pub mod cli;
pub mod config;
pub mod delegation;
pub mod error;
pub mod gcloud;
pub mod keys;
pub mod naming;
pub mod operator_log;
pub mod pipeline;
pub mod prompt;
pub mod resources;
pub mod runner;
pub mod sink;
pub mod terms;
