// src/connection/recovery.rs
use std::time::Duration;

use log::debug;

use crate::config::RecoverySettings;
use crate::error::ChannelError;
use crate::message::Message;

/// Client for the gap-recovery fallback channel: "give me all messages
/// since sequence N" over HTTP. The server may return the batch unordered;
/// the merge step sorts it.
#[derive(Debug, Clone)]
pub struct RecoveryClient {
    http: reqwest::Client,
    base_url: String,
}

impl RecoveryClient {
    /// Constructs a RecoveryClient from your config
    pub fn new_from_settings(settings: &RecoverySettings) -> Result<Self, ChannelError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.fetch_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch every message with a sequence number greater than `since`.
    pub async fn fetch_since(&self, since: u64) -> Result<Vec<Message>, ChannelError> {
        let url = format!("{}/messages", self.base_url);
        debug!("Fetching missed messages from {} (since {})", url, since);

        let batch = self
            .http
            .get(&url)
            .query(&[("since", since)])
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<Message>>()
            .await?;

        Ok(batch)
    }
}
