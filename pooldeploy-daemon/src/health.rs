//! Periodic pool health check. Reports drift, never remediates.

use pooldeploy_core::{ApplicationName, PoolState};
use serde::Serialize;

use crate::coordinator::DeploymentCoordinator;

/// An idle application whose pool is not running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolDrift {
    pub application: ApplicationName,
    pub pool: String,
    pub state: PoolState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Query the pool of every enabled application that has no deployment in
/// flight. A pool mid-deployment is expected to be stopped, so it is left out.
pub async fn check_pools(coordinator: &DeploymentCoordinator) -> Vec<PoolDrift> {
    let pools = coordinator.executor().pools();
    let mut drift = Vec::new();
    for app in coordinator.applications() {
        if !app.enabled || coordinator.is_active(&app.name) {
            continue;
        }
        let (state, error) = match pools.state(&app.pool_name).await {
            Ok(PoolState::Started) => continue,
            Ok(state) => (state, None),
            Err(err) => (PoolState::Unknown, Some(err.to_string())),
        };
        tracing::warn!(
            application = %app.name,
            pool = %app.pool_name,
            %state,
            error = error.as_deref().unwrap_or(""),
            "pool is not running",
        );
        drift.push(PoolDrift {
            application: app.name.clone(),
            pool: app.pool_name.clone(),
            state,
            error,
        });
    }
    drift
}
