use chrono::{DateTime, Utc};
use rocket::http::Status;
use rocket::response::status;
use rocket::serde::json::Json;
use rocket::serde::{Deserialize, Serialize};
use rocket::{Route, State, get, post, routes};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use crate::lock::{LeaseError, with_sync_lease};
use crate::sync::{AccountSync, SyncOutcome};

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[get("/health")]
pub fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
    })
}

#[derive(Deserialize, Serialize)]
pub struct SyncRequest {
    pub owner: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Managed state of the sync route.
pub struct SyncState {
    pub syncer: Arc<dyn AccountSync>,
    pub shutdown: watch::Receiver<bool>,
}

type SyncResponse = Result<Json<SyncOutcome>, status::Custom<Json<ErrorResponse>>>;

fn rejection(status: Status, error: String) -> status::Custom<Json<ErrorResponse>> {
    status::Custom(status, Json(ErrorResponse { error }))
}

#[post("/accounts/<account_id>/sync", format = "json", data = "<request>")]
pub async fn sync_account(
    account_id: i64,
    request: Json<SyncRequest>,
    pool: &State<SqlitePool>,
    state: &State<SyncState>,
) -> SyncResponse {
    info!(account_id, "Sync requested");

    let outcome = with_sync_lease(
        pool.inner(),
        account_id,
        state
            .syncer
            .sync_account(account_id, &request.owner, state.shutdown.clone()),
    )
    .await;

    match outcome {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e @ LeaseError::Busy { .. }) => Err(rejection(Status::Conflict, e.to_string())),
        Err(LeaseError::Persistence(e)) => {
            error!(account_id, "Failed to take sync lease: {e}");
            Err(rejection(
                Status::InternalServerError,
                "Could not start the sync, please try again later".to_string(),
            ))
        }
    }
}

// Route Configuration
pub fn routes() -> Vec<Route> {
    routes![health, sync_account]
}
