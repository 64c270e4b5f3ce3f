//! HTTP client for the primary scroll API.
//!
//! Each call is one `POST {base_url}/scroll/quake_service` authenticated by
//! the `X-QuakeToken` header:
//!
//! ```json
//! {"query": "...", "size": 1000, "ignore_cache": false, "latest": true,
//!  "pagination_id": "..."}
//! ```
//!
//! `pagination_id` is omitted on the first request. The response envelope is
//! `{code, message, data: [...], meta: {pagination_id}}`.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::QuakeConfig;
use crate::error::FetchError;
use crate::traits::{ScrollPage, ScrollSource};

pub struct QuakeClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl QuakeClient {
    pub fn new(config: &QuakeConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/scroll/quake_service", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
        })
    }
}

/// Build the JSON body for one scroll request.
pub fn scroll_request_body(query: &str, size: usize, cursor: Option<&str>) -> Value {
    let mut body = json!({
        "query": query,
        "size": size,
        "ignore_cache": false,
        "latest": true,
    });
    if let Some(cursor) = cursor {
        body["pagination_id"] = Value::String(cursor.to_string());
    }
    body
}

/// Decode a scroll response envelope.
///
/// A non-numeric `code` is reported as `-1` so it can never pass as
/// success.
pub fn parse_scroll_page(body: &Value) -> Result<ScrollPage, FetchError> {
    if !body.is_object() {
        return Err(FetchError::Decode("response is not a JSON object".to_string()));
    }

    let code = match body.get("code") {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(-1),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(-1),
        Some(_) => -1,
        None => return Err(FetchError::Decode("response has no code".to_string())),
    };
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let data = match body.get("data") {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(_) if code != 0 => Vec::new(),
        Some(_) => return Err(FetchError::Decode("data is not an array".to_string())),
    };

    let cursor = body
        .pointer("/meta/pagination_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(ScrollPage {
        code,
        message,
        data,
        cursor,
    })
}

#[async_trait]
impl ScrollSource for QuakeClient {
    async fn scroll(
        &self,
        query: &str,
        size: usize,
        cursor: Option<&str>,
    ) -> Result<ScrollPage, FetchError> {
        if self.api_key.trim().is_empty() {
            return Err(FetchError::Config(
                "quake.api_key is not set (or QUAKE_API_KEY)".to_string(),
            ));
        }

        let resp = self
            .client
            .post(&self.endpoint)
            .header("X-QuakeToken", &self.api_key)
            .json(&scroll_request_body(query, size, cursor))
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: text.chars().take(500).collect(),
            });
        }

        let body: Value =
            serde_json::from_str(&text).map_err(|e| FetchError::Decode(e.to_string()))?;
        parse_scroll_page(&body)
    }
}
