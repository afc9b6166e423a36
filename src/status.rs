use chrono::{DateTime, Utc};
use rocket::{catch, get, http::Status, serde::json::Json, Request};
use serde::Serialize;

/// JSON body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct Health {
    status: &'static str,
    timestamp: DateTime<Utc>,
}

#[get("/")]
pub fn index() -> &'static str {
    concat!(
        "prrelay ",
        env!("CARGO_PKG_VERSION"),
        " is running, GitHub webhooks go to POST /webhook"
    )
}

#[get("/health")]
pub fn health() -> Json<Health> {
    Json(Health {
        status: "healthy",
        timestamp: Utc::now(),
    })
}

#[catch(401)]
pub fn unauthorized() -> Json<ErrorBody> {
    Json(ErrorBody {
        error: "invalid or missing webhook signature".to_owned(),
    })
}

#[catch(default)]
pub fn default_catcher(status: Status, _request: &Request<'_>) -> (Status, Json<ErrorBody>) {
    let error = status.reason().unwrap_or("unknown error").to_lowercase();
    (status, Json(ErrorBody { error }))
}
