//! Bearer-token acquisition via the standard registry challenge:
//! `Www-Authenticate: Bearer realm="...",service="...",scope="..."`.

use std::collections::HashMap;

use reqwest::Client;

use super::errors::ResolverError;

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Per-registry config file lookup isn't implemented; only the
    /// environment fallback is. Anonymous pulls return `None`.
    pub fn from_env(registry: &str) -> Option<Self> {
        let user = std::env::var(format!("REPO_USER_{}", env_key(registry)))
            .or_else(|_| std::env::var("REPO_USER"))
            .ok()?;
        let pass = std::env::var(format!("REPO_PASS_{}", env_key(registry)))
            .or_else(|_| std::env::var("REPO_PASS"))
            .unwrap_or_default();
        Some(Self {
            username: user,
            password: pass,
        })
    }
}

fn env_key(registry: &str) -> String {
    registry
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

struct Challenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

fn parse_challenge(header: &str) -> Option<Challenge> {
    let rest = header.strip_prefix("Bearer ")?;
    let mut fields: HashMap<String, String> = HashMap::new();
    for part in split_challenge_params(rest) {
        if let Some((k, v)) = part.split_once('=') {
            fields.insert(k.trim().to_string(), v.trim().trim_matches('"').to_string());
        }
    }
    Some(Challenge {
        realm: fields.remove("realm")?,
        service: fields.remove("service"),
        scope: fields.remove("scope"),
    })
}

/// Splits `a="x,y",b="z"` on top-level commas, respecting quoted segments.
fn split_challenge_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts
}

/// Exchanges an anonymous `Www-Authenticate` challenge for a bearer token,
/// attaching basic credentials to the token request when present.
pub async fn fetch_token(
    client: &Client,
    header: &str,
    credentials: Option<&Credentials>,
) -> Result<String, ResolverError> {
    let challenge = parse_challenge(header)
        .ok_or_else(|| ResolverError::AuthFailed("malformed Www-Authenticate header".into()))?;

    let mut request = client.get(&challenge.realm);
    if let Some(service) = &challenge.service {
        request = request.query(&[("service", service)]);
    }
    if let Some(scope) = &challenge.scope {
        request = request.query(&[("scope", scope)]);
    }
    if let Some(creds) = credentials {
        request = request.basic_auth(&creds.username, Some(&creds.password));
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(ResolverError::AuthFailed(format!(
            "token endpoint returned {}",
            response.status()
        )));
    }

    #[derive(serde::Deserialize)]
    struct TokenResponse {
        token: Option<String>,
        access_token: Option<String>,
    }

    let body: TokenResponse = response
        .json()
        .await
        .map_err(|e| ResolverError::AuthFailed(e.to_string()))?;

    body.token
        .or(body.access_token)
        .ok_or_else(|| ResolverError::AuthFailed("token response missing token field".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_challenge_with_quoted_commas() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull""#;
        let challenge = parse_challenge(header).unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(challenge.scope.as_deref(), Some("repository:library/nginx:pull"));
    }
}
