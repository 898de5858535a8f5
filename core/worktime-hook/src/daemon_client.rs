//! One-shot HTTP delivery of activity events to the worktime daemon.
//!
//! A single attempt per event, bounded end to end by the agent's global
//! timeout (connect, send and read all count against it). No retries: the
//! caller falls back to the local log on any failure.

use std::time::Duration;
use worktime_protocol::{ActivityAck, ActivityEvent, ACTIVITY_PATH};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("Daemon did not answer within the deadline")]
    Timeout,

    #[error("Daemon refused the connection")]
    ConnectionRefused,

    #[error("Daemon returned server error status {0}")]
    ServerError(u16),

    #[error("Daemon rejected the event with status {0}")]
    ClientError(u16),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Daemon response was not an acknowledgement: {0}")]
    InvalidResponse(String),
}

/// Anything that can hand an event to the aggregation service.
pub trait Deliver {
    fn send(&self, event: &ActivityEvent) -> Result<ActivityAck, DeliveryError>;
}

pub struct DeliveryClient {
    agent: ureq::Agent,
    endpoint: String,
}

impl DeliveryClient {
    /// `deadline` bounds each `send` in full.
    pub fn new(base_url: &str, deadline: Duration) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(deadline))
            .build()
            .new_agent();
        Self {
            agent,
            endpoint: activity_endpoint(base_url),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Deliver for DeliveryClient {
    fn send(&self, event: &ActivityEvent) -> Result<ActivityAck, DeliveryError> {
        let body = serde_json::to_string(&event.to_request())
            .map_err(|err| DeliveryError::Transport(format!("Failed to encode event: {}", err)))?;

        let mut response = self
            .agent
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .send(body)
            .map_err(classify_error)?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(classify_status(status));
        }

        let text = response
            .body_mut()
            .read_to_string()
            .map_err(classify_error)?;
        serde_json::from_str::<ActivityAck>(&text)
            .map_err(|err| DeliveryError::InvalidResponse(err.to_string()))
    }
}

fn activity_endpoint(base_url: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), ACTIVITY_PATH)
}

fn classify_status(status: u16) -> DeliveryError {
    if status >= 500 {
        DeliveryError::ServerError(status)
    } else {
        DeliveryError::ClientError(status)
    }
}

fn classify_error(err: ureq::Error) -> DeliveryError {
    match err {
        ureq::Error::StatusCode(status) => classify_status(status),
        ureq::Error::Timeout(_) => DeliveryError::Timeout,
        ureq::Error::ConnectionFailed => DeliveryError::ConnectionRefused,
        ureq::Error::Io(io) => match io.kind() {
            std::io::ErrorKind::ConnectionRefused => DeliveryError::ConnectionRefused,
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => DeliveryError::Timeout,
            _ => DeliveryError::Transport(io.to_string()),
        },
        other => DeliveryError::Transport(other.to_string()),
    }
}
