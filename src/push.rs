// ===============================
// src/push.rs (push gateway)
// ===============================
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PushMessage {
    pub to: String,
    pub sound: &'static str,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    pub priority: &'static str,
}

impl PushMessage {
    pub fn new(to: String, title: &str, body: &str, data: serde_json::Value) -> Self {
        Self {
            to,
            sound: "default",
            title: title.to_string(),
            body: body.to_string(),
            data,
            priority: "high",
        }
    }
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("invalid push token {0}")]
    InvalidToken(String),
    #[error("delivery rejected: {0}")]
    Rejected(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("push timed out")]
    Timeout,
}

impl PushError {
    pub fn label(&self) -> &'static str {
        match self {
            PushError::InvalidToken(_) => "invalid_token",
            PushError::Rejected(_) => "rejected",
            PushError::Http(_) => "http",
            PushError::Timeout => "timeout",
        }
    }
}

/// Best-effort delivery of one titled message to one device token.
#[async_trait]
pub trait PushGateway: Send + Sync + 'static {
    async fn send(&self, msg: &PushMessage) -> Result<(), PushError>;
}

/// Expo accepts `ExponentPushToken[...]`, `ExpoPushToken[...]` or a bare UUID.
pub fn is_expo_push_token(token: &str) -> bool {
    let bracketed = (token.starts_with("ExponentPushToken[") || token.starts_with("ExpoPushToken["))
        && token.ends_with(']');
    bracketed || is_uuid_like(token)
}

fn is_uuid_like(token: &str) -> bool {
    let groups: Vec<&str> = token.split('-').collect();
    groups.len() == 5
        && groups.iter().zip([8usize, 4, 4, 4, 12]).all(|(g, len)| {
            g.len() == len && g.chars().all(|c| c.is_ascii_alphanumeric())
        })
}

/// Validates tokens and logs instead of delivering.
#[derive(Debug, Default)]
pub struct LogPush {
    sent: Mutex<Vec<PushMessage>>,
}

impl LogPush {
    pub fn new() -> Self { Self::default() }

    #[cfg(test)]
    pub fn sent(&self) -> Vec<PushMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl PushGateway for LogPush {
    async fn send(&self, msg: &PushMessage) -> Result<(), PushError> {
        if !is_expo_push_token(&msg.to) {
            return Err(PushError::InvalidToken(msg.to.clone()));
        }
        info!(to = %msg.to, title = %msg.title, "push (log only)");
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(msg.clone());
        Ok(())
    }
}
