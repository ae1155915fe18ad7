//! The hand-off between pollers and ingesters.
//!
//! Pollers publish through [`Publisher`]; the shipped implementation POSTs
//! the message to the SNS-compatible gateway named by `AWS_SNS_TOPIC_ARN`.
//! Ingesters receive deliveries as the SNS event JSON shape
//! (`{"Records":[{"Sns":{"Message":…}}]}`) over HTTP POST.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("cannot publish message: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("publish rejected with status {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: &str) -> Result<(), PublishError>;
}

pub struct SnsHttpPublisher {
    client: reqwest::Client,
    topic: String,
}

impl SnsHttpPublisher {
    pub fn new(client: reqwest::Client, topic: String) -> Self {
        Self { client, topic }
    }
}

#[async_trait]
impl Publisher for SnsHttpPublisher {
    async fn publish(&self, message: &str) -> Result<(), PublishError> {
        let response = self
            .client
            .post(&self.topic)
            .header("Content-Type", "application/json")
            .body(message.to_string())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PublishError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Records published messages; stands in for the bus in tests.
#[derive(Default)]
pub struct RecordingPublisher {
    pub messages: Mutex<Vec<String>>,
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, message: &str) -> Result<(), PublishError> {
        self.messages
            .lock()
            .expect("recording publisher lock")
            .push(message.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnsEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<SnsEventRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnsEventRecord {
    #[serde(rename = "Sns")]
    pub sns: SnsMessage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnsMessage {
    #[serde(rename = "Message", default)]
    pub message: String,
}

impl SnsEvent {
    /// Convenience constructor used by tests and local tooling.
    pub fn with_messages(messages: Vec<String>) -> Self {
        SnsEvent {
            records: messages
                .into_iter()
                .map(|message| SnsEventRecord {
                    sns: SnsMessage { message },
                })
                .collect(),
        }
    }
}
