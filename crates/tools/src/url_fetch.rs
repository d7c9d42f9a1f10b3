/*
 * 5D Labs Agent Platform - Task Controller
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Download a URL context into the workload
//!
//! Credentials come from the environment. A bearer token wins over basic
//! auth, which wins over an `Authorization` header passed in `URL_HEADERS`.

use crate::error::{Result, ToolError};
use crate::Env;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    None,
    Bearer(String),
    Basic { username: String, password: String },
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Self::Basic { username, .. } => write!(f, "Basic({username}, <redacted>)"),
        }
    }
}

impl Auth {
    fn describe(&self, headers: &BTreeMap<String, String>) -> &'static str {
        match self {
            Self::Bearer(_) => "bearer token",
            Self::Basic { .. } => "basic",
            Self::None if headers.keys().any(|k| k.eq_ignore_ascii_case("authorization")) => {
                "custom header"
            }
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UrlFetchConfig {
    pub url: String,
    pub target: PathBuf,
    pub headers: BTreeMap<String, String>,
    pub timeout: Duration,
    pub insecure: bool,
    pub auth: Auth,
}

impl UrlFetchConfig {
    pub fn from_env(env: &impl Env) -> Result<Self> {
        let url = env.require("URL_SOURCE")?;
        let target = PathBuf::from(env.require("URL_TARGET")?);

        let headers = match env.non_empty("URL_HEADERS") {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| ToolError::invalid("URL_HEADERS", e.to_string()))?,
            None => BTreeMap::new(),
        };

        let timeout = match env.non_empty("URL_TIMEOUT") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map_err(|e| ToolError::invalid("URL_TIMEOUT", e.to_string()))?,
            None => DEFAULT_TIMEOUT_SECONDS,
        };

        let insecure = env
            .get("URL_INSECURE")
            .is_some_and(|v| v == "true" || v == "1");

        let auth = match (
            env.non_empty("URL_AUTH_TOKEN"),
            env.non_empty("URL_AUTH_USERNAME"),
            env.non_empty("URL_AUTH_PASSWORD"),
        ) {
            (Some(token), _, _) => Auth::Bearer(token),
            (None, Some(username), Some(password)) => Auth::Basic { username, password },
            _ => Auth::None,
        };

        Ok(Self {
            url,
            target,
            headers,
            timeout: Duration::from_secs(timeout),
            insecure,
            auth,
        })
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ToolError::invalid("URL_HEADERS", format!("header {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ToolError::invalid("URL_HEADERS", format!("value of {name}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// `url-fetch` entry point; returns the number of bytes written
pub async fn run(config: &UrlFetchConfig) -> Result<u64> {
    info!(
        url = %config.url,
        target = %config.target.display(),
        timeout_seconds = config.timeout.as_secs(),
        auth = config.auth.describe(&config.headers),
        "Fetching URL context"
    );
    if config.insecure {
        warn!("TLS certificate verification disabled");
    }

    let client = reqwest::Client::builder()
        .timeout(config.timeout)
        .danger_accept_invalid_certs(config.insecure)
        .build()?;

    let mut headers = header_map(&config.headers)?;
    let request = client.get(&config.url);
    let request = match &config.auth {
        Auth::Bearer(token) => {
            headers.remove(AUTHORIZATION);
            request.headers(headers).bearer_auth(token)
        }
        Auth::Basic { username, password } => {
            headers.remove(AUTHORIZATION);
            request.headers(headers).basic_auth(username, Some(password))
        }
        Auth::None => request.headers(headers),
    };

    let mut response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ToolError::HttpStatus {
            url: config.url.clone(),
            status: status.as_u16(),
            body,
        });
    }

    if let Some(parent) = config.target.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(&config.target).await?;
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    info!(bytes = written, target = %config.target.display(), "URL context written");
    Ok(written)
}
