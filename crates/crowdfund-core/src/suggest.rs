//! Description suggestions from the text-generation proxy.
//!
//! The proxy takes `{title, goal}` and answers `{description}` on success or
//! `{error}` otherwise. Every outcome other than a non-empty description is
//! a soft failure: it is logged and yields no suggestion.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::ClientConfig,
    error::ClientError,
    http::{post_json, HttpUrl},
};

pub const DEFAULT_GOAL: &str = "100";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuggestionRequest {
    pub title: String,
    /// Display amount as typed; an empty goal is sent as `"100"`.
    pub goal: String,
}

impl SuggestionRequest {
    pub fn new(title: &str, goal: Option<&str>) -> Self {
        let goal = goal.map(str::trim).filter(|g| !g.is_empty());
        Self {
            title: title.trim().to_string(),
            goal: goal.unwrap_or(DEFAULT_GOAL).to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
struct SuggestionReply {
    description: Option<String>,
    error: Option<Value>,
}

pub trait SuggestTransport: Send + Sync {
    fn post(&self, request: &SuggestionRequest) -> Result<Value, ClientError>;
}

/// Plain-HTTP proxy endpoint.
pub struct HttpSuggestProxy {
    url: HttpUrl,
    timeout: Duration,
}

impl HttpSuggestProxy {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            url: HttpUrl::parse(url)?,
            timeout,
        })
    }

    /// Built from `suggest_url`; `None` when no proxy is configured.
    pub fn from_config(config: &ClientConfig) -> Result<Option<Self>, ClientError> {
        config
            .suggest_url
            .as_deref()
            .map(|url| Self::new(url, config.timeout()))
            .transpose()
    }
}

impl SuggestTransport for HttpSuggestProxy {
    fn post(&self, request: &SuggestionRequest) -> Result<Value, ClientError> {
        let body = serde_json::to_value(request)
            .map_err(|e| ClientError::InvalidInput(format!("suggestion request: {e}")))?;
        let response = post_json(&self.url, &body, self.timeout)?;
        // error bodies still carry `{error}`; status alone is not decisive
        response.json().map_err(|err| match response.status {
            200..=299 => err,
            status => ClientError::Remote(format!("proxy answered HTTP {status}")),
        })
    }
}

pub struct SuggestionClient {
    transport: Arc<dyn SuggestTransport>,
    quiet: bool,
}

impl SuggestionClient {
    pub fn new(transport: Arc<dyn SuggestTransport>) -> Self {
        Self {
            transport,
            quiet: false,
        }
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn try_suggest(&self, request: &SuggestionRequest) -> Result<String, ClientError> {
        if request.title.is_empty() {
            return Err(ClientError::InvalidInput(
                "a title is needed for a suggestion".into(),
            ));
        }
        let value = self.transport.post(request)?;
        let reply: SuggestionReply = serde_json::from_value(value).unwrap_or_default();
        match (reply.description, reply.error) {
            (Some(description), _) if !description.trim().is_empty() => {
                Ok(description.trim().to_string())
            }
            (_, Some(Value::String(error))) => Err(ClientError::Remote(error)),
            (_, Some(error)) => Err(ClientError::Remote(error.to_string())),
            _ => Err(ClientError::Remote("proxy returned no description".into())),
        }
    }

    pub fn suggest(&self, request: &SuggestionRequest) -> Option<String> {
        match self.try_suggest(request) {
            Ok(description) => Some(description),
            Err(err) => {
                if !self.quiet {
                    eprintln!("warn: suggestion for {:?} failed: {err}", request.title);
                }
                None
            }
        }
    }
}
