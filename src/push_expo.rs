// ===============================
// src/push_expo.rs
// ===============================
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::push::{is_expo_push_token, PushError, PushGateway, PushMessage};

/// Expo push service (`POST /--/api/v2/push/send`), one message per request.
pub struct ExpoPush {
    http: reqwest::Client,
    url: String,
    access_token: Option<String>,
}

impl ExpoPush {
    pub fn new(url: String, access_token: Option<String>) -> Self {
        Self { http: reqwest::Client::new(), url, access_token }
    }
}

#[derive(Debug, Deserialize)]
struct TicketResponse {
    #[serde(default)]
    data: Vec<Ticket>,
    #[serde(default)]
    errors: Vec<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Ticket {
    status: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

/// Turns the ticket body into the per-token outcome; returns the ticket id on success.
fn ticket_outcome(body: &str) -> Result<Option<String>, PushError> {
    let resp: TicketResponse =
        serde_json::from_str(body).map_err(|e| PushError::Rejected(format!("unreadable ticket: {e}")))?;
    if let Some(err) = resp.errors.first() {
        let code = err.code.as_deref().unwrap_or("error");
        return Err(PushError::Rejected(format!("{code}: {}", err.message)));
    }
    let ticket = resp
        .data
        .into_iter()
        .next()
        .ok_or_else(|| PushError::Rejected("empty ticket list".into()))?;
    if ticket.status != "ok" {
        let reason = ticket
            .details
            .as_ref()
            .and_then(|d| d.get("error"))
            .and_then(|e| e.as_str())
            .map(str::to_string)
            .or(ticket.message)
            .unwrap_or(ticket.status);
        return Err(PushError::Rejected(reason));
    }
    Ok(ticket.id)
}

#[async_trait]
impl PushGateway for ExpoPush {
    async fn send(&self, msg: &PushMessage) -> Result<(), PushError> {
        if !is_expo_push_token(&msg.to) {
            return Err(PushError::InvalidToken(msg.to.clone()));
        }
        let mut req = self.http.post(&self.url).json(&[msg]);
        if let Some(token) = &self.access_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(PushError::Rejected(format!("{}: {}", status.as_u16(), body)));
        }
        let ticket = ticket_outcome(&body)?;
        debug!(to = %msg.to, ticket = ?ticket, "push accepted");
        Ok(())
    }
}
