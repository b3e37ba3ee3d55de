//! HTTP request executor.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};

use floe_core::error::ActionError;
use floe_core::playbook::types::ToolKind;

use crate::context::ToolContext;
use crate::error::ToolError;
use crate::registry::Tool;
use crate::result::ToolResult;

/// HTTP method.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
#[allow(clippy::upper_case_acronyms)]
pub enum HttpMethod {
    #[default]
    GET,
    POST,
    PUT,
    PATCH,
    DELETE,
    HEAD,
    OPTIONS,
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::GET => Method::GET,
            HttpMethod::POST => Method::POST,
            HttpMethod::PUT => Method::PUT,
            HttpMethod::PATCH => Method::PATCH,
            HttpMethod::DELETE => Method::DELETE,
            HttpMethod::HEAD => Method::HEAD,
            HttpMethod::OPTIONS => Method::OPTIONS,
        }
    }
}

/// Auth applied to the request, built from resolved credential fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HttpAuth {
    Bearer { token: String },
    Basic { username: String, password: String },
    ApiKey { header: String, key: String },
}

/// HTTP executor arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpArgs {
    /// URL to request.
    pub url: String,

    /// HTTP method (default GET).
    #[serde(default)]
    pub method: HttpMethod,

    /// Query parameters.
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,

    /// Request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// JSON request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,

    /// Raw request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    /// Authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<HttpAuth>,

    /// Per-request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// HTTP request executor.
pub struct HttpTool {
    client: reqwest::Client,
}

impl HttpTool {
    /// Create a new HTTP executor.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Create an executor over a custom client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build_request(&self, args: &HttpArgs) -> reqwest::RequestBuilder {
        let mut request = self.client.request(args.method.into(), &args.url);

        if !args.params.is_empty() {
            let params: Vec<(String, String)> = args
                .params
                .iter()
                .map(|(k, v)| {
                    let value = match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), value)
                })
                .collect();
            request = request.query(&params);
        }

        for (key, value) in &args.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        if let Some(json) = &args.json {
            request = request.json(json);
        } else if let Some(body) = &args.body {
            request = request.body(body.clone());
        }

        match &args.auth {
            Some(HttpAuth::Bearer { token }) => {
                request = request.bearer_auth(token);
            }
            Some(HttpAuth::Basic { username, password }) => {
                request = request.basic_auth(username, Some(password));
            }
            Some(HttpAuth::ApiKey { header, key }) => {
                request = request.header(header.as_str(), key.as_str());
            }
            None => {}
        }

        if let Some(timeout) = args.timeout {
            request = request.timeout(Duration::from_secs(timeout));
        }

        request
    }
}

impl Default for HttpTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Http
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let args: HttpArgs = serde_json::from_value(args.clone())
            .map_err(|e| ToolError::Configuration(format!("http args: {}", e)))?;

        let start = std::time::Instant::now();
        let request = self.build_request(&args);

        let response = tokio::select! {
            response = request.send() => response?,
            _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
        };

        let status_code = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();

        // JSON responses become structured data; anything else stays text.
        let body: serde_json::Value =
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let meta = serde_json::json!({
            "status_code": status_code,
            "elapsed_ms": elapsed_ms,
        });

        if (200..300).contains(&status_code) {
            Ok(ToolResult::success(body).with_meta(meta))
        } else {
            let error = ActionError::dependency(format!("HTTP {} from {}", status_code, args.url))
                .with_status(status_code);
            Ok(ToolResult::failure(error).with_data(body).with_meta(meta))
        }
    }
}
