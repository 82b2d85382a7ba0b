use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::error::{ProvisionError, ProvisionResult};
use crate::gcloud;
use crate::runner::CommandRunner;

/// Enables independent APIs concurrently.
///
/// All enable calls are dispatched before any of them is awaited. The batch is
/// all-or-nothing: the first fatal failure aborts the calls still in flight and
/// is returned as-is.
pub struct ApiEnablementCoordinator {
    runner: CommandRunner,
}

impl ApiEnablementCoordinator {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }

    pub async fn enable(&self, project_id: &str, apis: &[String]) -> ProvisionResult<()> {
        info!("Enabling APIs...");
        let mut calls = JoinSet::new();
        for api in apis {
            let runner = self.runner.clone();
            let command = gcloud::enable_service(project_id, api);
            let api = api.clone();
            calls.spawn(async move {
                let policy = runner.defaults();
                runner.run(&command, policy).await.map(|_| api)
            });
        }
        debug!(dispatched = calls.len(), "api enable calls in flight");

        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok(Ok(api)) => debug!(api = %api, "api enabled"),
                Ok(Err(err)) => {
                    calls.abort_all();
                    return Err(err);
                }
                Err(join_err) => {
                    calls.abort_all();
                    return Err(ProvisionError::Other(anyhow::anyhow!(
                        "api enable task failed: {join_err}"
                    )));
                }
            }
        }
        info!("APIs successfully enabled \u{2705}");
        Ok(())
    }
}
