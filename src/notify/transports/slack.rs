//! `slack://` transport: an incoming-webhook URL encoded as
//! `slack://hooks.slack.com/services/T000/B000/XXX` is reassembled into the
//! real `https://` webhook URL.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use url::Url;

use crate::notify::{Level, NotifyError, Notifier};

pub struct SlackTransport {
    webhook_url: String,
    client: Client,
}

impl SlackTransport {
    pub fn from_url(url: &Url) -> Result<Self, NotifyError> {
        let host = url
            .host_str()
            .ok_or_else(|| NotifyError::MalformedUrl(url.to_string(), "missing host".into()))?;
        let webhook_url = format!("https://{host}{}", url.path());
        Ok(Self {
            webhook_url,
            client: Client::new(),
        })
    }
}

#[async_trait]
impl Notifier for SlackTransport {
    async fn send(&self, _level: Level, message: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&json!({ "text": message }))
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifyError::Transport(format!(
                "slack webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "slack"
    }
}
