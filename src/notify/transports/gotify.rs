//! `gotify://` transport: `gotify://host/path?token=XXX` maps to a POST
//! against `https://host/path/message?token=XXX`.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use url::Url;

use crate::notify::{Level, NotifyError, Notifier};

pub struct GotifyTransport {
    base_url: String,
    token: String,
    client: Client,
}

impl GotifyTransport {
    pub fn from_url(url: &Url) -> Result<Self, NotifyError> {
        let host = url
            .host_str()
            .ok_or_else(|| NotifyError::MalformedUrl(url.to_string(), "missing host".into()))?;
        let token = url
            .query_pairs()
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.to_string())
            .ok_or_else(|| NotifyError::MalformedUrl(url.to_string(), "missing token query param".into()))?;

        Ok(Self {
            base_url: format!("https://{host}{}", url.path()),
            token,
            client: Client::new(),
        })
    }
}

#[async_trait]
impl Notifier for GotifyTransport {
    async fn send(&self, level: Level, message: &str) -> Result<(), NotifyError> {
        let priority = match level {
            Level::Error => 8,
            Level::Warn => 5,
            Level::Info => 3,
            Level::Debug => 1,
        };

        let response = self
            .client
            .post(format!("{}/message", self.base_url))
            .query(&[("token", self.token.as_str())])
            .json(&json!({ "title": "containerwatch", "message": message, "priority": priority }))
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifyError::Transport(format!(
                "gotify returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "gotify"
    }
}
