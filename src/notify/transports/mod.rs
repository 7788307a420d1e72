//! Concrete transports, registered by URL scheme. Mirrors the daemon's
//! treatment of backup destinations as an open trait registry: adding a new
//! transport means adding a module and a match arm here, nothing else.

pub mod gotify;
pub mod slack;

use std::sync::Arc;

use url::Url;

use super::{NotifyError, Notifier};

pub fn from_url(raw: &str) -> Result<Arc<dyn Notifier>, NotifyError> {
    let url = Url::parse(raw).map_err(|e| NotifyError::MalformedUrl(raw.to_string(), e.to_string()))?;

    match url.scheme() {
        "slack" => Ok(Arc::new(slack::SlackTransport::from_url(&url)?)),
        "gotify" => Ok(Arc::new(gotify::GotifyTransport::from_url(&url)?)),
        other => Err(NotifyError::UnknownScheme(other.to_string())),
    }
}
