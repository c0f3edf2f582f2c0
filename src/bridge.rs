//! Valve actuator bridge.
//!
//! - `HttpValveBridge`: blocking `ureq` client for the hardware gateway that
//!   drives the irrigation valves.
//! - `LogOnlyActuator`: dry-run stand-in used when no gateway is configured.
//!
//! Requests carry the schedule entry id so the gateway can drop duplicates
//! produced by retries.

use crate::dosing::ControllerId;
use http::StatusCode;
use log::{info, warn};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::thread;
use std::time::Duration;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(10);
const JITTER_MAX_MS: u64 = 250;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispenseCommand {
    #[serde(skip)]
    pub controller_id: ControllerId,
    pub schedule_entry_id: i64,
    pub liters: Decimal,
    pub duration_seconds: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DispenseReceipt {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub accepted: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug)]
pub enum BridgeError {
    Transport(String),
    Http { status: u16, message: String },
    Json(serde_path_to_error::Error<serde_json::Error>),
    /// The gateway answered but refused the command.
    Refused(String),
}

impl core::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BridgeError::Transport(s) => write!(f, "transport error: {}", s),
            BridgeError::Http { status, message } => write!(f, "http {}: {}", status, message),
            BridgeError::Json(e) => write!(f, "json error at {}: {}", e.path(), e.inner()),
            BridgeError::Refused(s) => write!(f, "dispense refused: {}", s),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<serde_path_to_error::Error<serde_json::Error>> for BridgeError {
    fn from(value: serde_path_to_error::Error<serde_json::Error>) -> Self {
        BridgeError::Json(value)
    }
}

impl BridgeError {
    /// Transport failures, 5xx and 429 may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Transport(_) => true,
            BridgeError::Http { status, .. } => StatusCode::from_u16(*status)
                .map(|s| s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS)
                .unwrap_or(false),
            BridgeError::Json(_) | BridgeError::Refused(_) => false,
        }
    }
}

/// Physically dispenses water for an authorized schedule entry.
pub trait ValveActuator {
    fn name(&self) -> &'static str;
    fn dispense(&self, cmd: &DispenseCommand) -> Result<DispenseReceipt, BridgeError>;
}

pub struct HttpValveBridge {
    agent: ureq::Agent,
    base_url: String,
    token: Option<String>,
    max_retries: NonZeroU32,
}

impl HttpValveBridge {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration, max_retries: NonZeroU32) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        HttpValveBridge {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            max_retries,
        }
    }

    fn url(&self, controller_id: ControllerId) -> String {
        format!("{}/controllers/{}/dispense", self.base_url, controller_id.0)
    }

    fn post_once(&self, cmd: &DispenseCommand) -> Result<DispenseReceipt, BridgeError> {
        let mut req = self
            .agent
            .post(&self.url(cmd.controller_id))
            .header("Accept", "application/json");
        if let Some(token) = &self.token {
            req = req.header("Authorization", &format!("Bearer {}", token));
        }

        let mut resp = req.send_json(cmd).map_err(|e| BridgeError::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .body_mut()
            .read_to_string()
            .map_err(|e| BridgeError::Transport(e.to_string()))?;

        if !status.is_success() {
            let message = if body.trim().is_empty() {
                String::from("<no body>")
            } else {
                body
            };
            return Err(BridgeError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let receipt = decode_receipt(&body)?;
        if !receipt.accepted {
            return Err(BridgeError::Refused(
                receipt.message.unwrap_or_else(|| "no reason given".to_string()),
            ));
        }
        Ok(receipt)
    }
}

impl ValveActuator for HttpValveBridge {
    fn name(&self) -> &'static str {
        "http"
    }

    fn dispense(&self, cmd: &DispenseCommand) -> Result<DispenseReceipt, BridgeError> {
        let mut rng = rand::rng();
        let mut attempt: u32 = 1;
        loop {
            match self.post_once(cmd) {
                Ok(receipt) => return Ok(receipt),
                Err(e) if e.is_retryable() && attempt < self.max_retries.get() => {
                    let delay = backoff_delay(attempt, &mut rng);
                    warn!(
                        "Bridge: dispense for entry {} failed (attempt {}/{}): {}; retrying in {} ms",
                        cmd.schedule_entry_id,
                        attempt,
                        self.max_retries,
                        e,
                        delay.as_millis()
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct LogOnlyActuator;

impl ValveActuator for LogOnlyActuator {
    fn name(&self) -> &'static str {
        "log-only"
    }

    fn dispense(&self, cmd: &DispenseCommand) -> Result<DispenseReceipt, BridgeError> {
        info!(
            "Dry run: controller {} would dispense {} l over {} s (entry {})",
            cmd.controller_id.0, cmd.liters, cmd.duration_seconds, cmd.schedule_entry_id
        );
        Ok(DispenseReceipt {
            job_id: None,
            accepted: true,
            message: Some("dry run".to_string()),
        })
    }
}

fn decode_receipt(body: &str) -> Result<DispenseReceipt, BridgeError> {
    let de = &mut serde_json::Deserializer::from_str(body);
    Ok(serde_path_to_error::deserialize(de)?)
}

/// Exponential backoff with random jitter; `attempt` starts at 1.
fn backoff_delay(attempt: u32, rng: &mut impl Rng) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = BACKOFF_BASE.saturating_mul(1u32 << exp).min(BACKOFF_MAX);
    base + Duration::from_millis(rng.random_range(0..=JITTER_MAX_MS))
}
