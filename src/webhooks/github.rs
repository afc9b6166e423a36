use std::{convert::Infallible, fmt};

use rocket::{
    http::Status,
    request::{FromRequest, Outcome},
    response::{self, Responder},
    serde::json::Json,
    Request, State,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

pub mod events;
use events::{is_relayed_action, EventAction, PingEvent, PullRequestEvent};

mod signing;
use signing::SignedGitHubPayload;

use crate::{
    config::RelayConfig,
    forwarder::Forwarder,
    github::GitHubClient,
    relay::{relay_pull_request, RelayError, RelayReport},
    status::ErrorBody,
};

const X_GITHUB_EVENT: &str = "X-GitHub-Event";
const X_GITHUB_DELIVERY: &str = "X-GitHub-Delivery";

const EVENT_IGNORED: &str = "Event ignored";
const ACTION_IGNORED: &str = "Action ignored";
const PROCESSED: &str = "Webhook processed successfully";

#[rocket::post("/webhook", data = "<payload>")]
pub async fn github_webhook(
    event: GitHubEventType,
    delivery: DeliveryId,
    payload: SignedGitHubPayload,
    config: &State<RelayConfig>,
    github: &State<GitHubClient>,
    forwarder: &State<Forwarder>,
) -> Result<Json<WebhookResponse>, WebhookError> {
    info!("received {} event (delivery {})", event, delivery);

    match event {
        GitHubEventType::PullRequest => {}
        GitHubEventType::Ping => {
            match serde_json::from_slice::<PingEvent>(&payload.0) {
                Ok(ping) => info!("pinged by hook {:?}: {}", ping.hook_id, ping.zen),
                Err(e) => debug!("couldn't parse ping payload: {}", e),
            }
            return Ok(Json(WebhookResponse::ignored(EVENT_IGNORED)));
        }
        _ => {
            debug!("ignoring {} event", event);
            return Ok(Json(WebhookResponse::ignored(EVENT_IGNORED)));
        }
    }

    let action = serde_json::from_slice::<EventAction>(&payload.0)
        .map_err(|source| WebhookError::InvalidPayload {
            event: "pull_request",
            source,
        })?
        .action;
    match action.as_deref() {
        Some(action) if is_relayed_action(action) => {}
        other => {
            debug!("ignoring pull_request action {:?}", other);
            return Ok(Json(WebhookResponse::ignored(ACTION_IGNORED)));
        }
    }

    let event: PullRequestEvent =
        serde_json::from_slice(&payload.0).map_err(|source| WebhookError::InvalidPayload {
            event: "pull_request",
            source,
        })?;
    info!(
        "{} {} in {} (sent by {})",
        event.action, event.pull_request, event.repository.full_name, event.sender.login
    );

    let report = relay_pull_request(&event, delivery.0, github, forwarder, config).await?;
    Ok(Json(WebhookResponse::processed(report)))
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    downstream_status: Option<u16>,
}

impl WebhookResponse {
    fn ignored(message: &'static str) -> Self {
        Self {
            message,
            files: None,
            downstream_status: None,
        }
    }

    fn processed(report: RelayReport) -> Self {
        Self {
            message: PROCESSED,
            files: Some(report.files),
            downstream_status: Some(report.downstream_status),
        }
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid {event} payload: {source}")]
    InvalidPayload {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl<'r> Responder<'r, 'static> for WebhookError {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        let status = match self {
            WebhookError::InvalidPayload { .. } => Status::BadRequest,
            WebhookError::Relay(_) => Status::InternalServerError,
        };

        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .respond_to(request)
    }
}

/// Value of the `X-GitHub-Event` header. Deliveries without one are treated like any other event
/// the relay doesn't handle.
#[derive(Debug, PartialEq, Eq)]
pub enum GitHubEventType {
    PullRequest,
    Ping,
    Other(String),
    Missing,
}

impl From<&str> for GitHubEventType {
    fn from(event_type: &str) -> Self {
        match event_type {
            "pull_request" => Self::PullRequest,
            "ping" => Self::Ping,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for GitHubEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PullRequest => f.write_str("pull_request"),
            Self::Ping => f.write_str("ping"),
            Self::Other(other) => f.write_str(other),
            Self::Missing => f.write_str("<missing>"),
        }
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for GitHubEventType {
    type Error = Infallible;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let event_types = request.headers().get(X_GITHUB_EVENT).collect::<Vec<_>>();
        match event_types.as_slice() {
            [event_type] => Outcome::Success(GitHubEventType::from(*event_type)),
            _ => {
                debug!(
                    "expected exactly one {} header, got {}",
                    X_GITHUB_EVENT,
                    event_types.len()
                );
                Outcome::Success(GitHubEventType::Missing)
            }
        }
    }
}

/// Value of the `X-GitHub-Delivery` header, GitHub keeps it when redelivering.
#[derive(Debug)]
pub struct DeliveryId(pub Option<String>);

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_deref().unwrap_or("unknown"))
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for DeliveryId {
    type Error = Infallible;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let delivery = request.headers().get_one(X_GITHUB_DELIVERY);
        Outcome::Success(DeliveryId(delivery.map(str::to_owned)))
    }
}
