use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use url::Url;

use super::{AccessToken, Transport};
use crate::sync::{RemoteError, RemoteRequest, Verb};

/// HTTP transport for a values-style REST API
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
  value_input_option: String,
}

impl HttpTransport {
  /// `base_url` addresses the document, e.g.
  /// `https://sheets.googleapis.com/v4/spreadsheets/<id>`.
  pub fn new(base_url: &str, value_input_option: &str) -> Result<Self> {
    let base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid remote URL {}: {}", base_url, e))?;
    if base_url.cannot_be_a_base() {
      return Err(eyre!("Remote URL {} cannot be used as a base", base_url));
    }

    let client = reqwest::Client::builder()
      .user_agent(concat!("sheetsync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      value_input_option: value_input_option.to_string(),
    })
  }

  /// Map a request onto its endpoint.
  fn endpoint(&self, request: &RemoteRequest) -> Result<Url, RemoteError> {
    let last_segment = match request.verb {
      Verb::Read | Verb::Update => request.resource.clone(),
      Verb::Append => format!("{}:append", request.resource),
      Verb::Clear => format!("{}:clear", request.resource),
    };

    let mut url = self.base_url.clone();
    url
      .path_segments_mut()
      .map_err(|_| RemoteError::Network(format!("invalid base URL {}", self.base_url)))?
      .pop_if_empty()
      .push("values")
      .push(&last_segment);

    if matches!(request.verb, Verb::Append | Verb::Update) {
      url
        .query_pairs_mut()
        .append_pair("valueInputOption", &self.value_input_option);
    }

    Ok(url)
  }

  fn method(verb: Verb) -> Method {
    match verb {
      Verb::Read => Method::GET,
      Verb::Append | Verb::Clear => Method::POST,
      Verb::Update => Method::PUT,
    }
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn execute(&self, request: &RemoteRequest, token: &AccessToken) -> Result<Value, RemoteError> {
    let url = self.endpoint(request)?;
    let mut builder = self
      .client
      .request(Self::method(request.verb), url)
      .bearer_auth(token.as_str());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    } else if request.verb == Verb::Clear {
      builder = builder.json(&serde_json::json!({}));
    }

    let response = builder
      .send()
      .await
      .map_err(|e| RemoteError::Network(e.to_string()))?;

    let status = response.status();
    let text = response
      .text()
      .await
      .map_err(|e| RemoteError::Network(format!("Failed to read response body: {}", e)))?;

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
      return Err(RemoteError::Unauthorized {
        status: status.as_u16(),
        message: text,
      });
    }
    if !status.is_success() {
      return Err(RemoteError::Status {
        status: status.as_u16(),
        message: text,
      });
    }

    let body: Value = if text.trim().is_empty() {
      Value::Null
    } else {
      serde_json::from_str(&text).map_err(|e| RemoteError::Decode(e.to_string()))?
    };

    Ok(match request.verb {
      // A range with no data comes back without a `values` field
      Verb::Read => body
        .get("values")
        .cloned()
        .unwrap_or_else(|| Value::Array(Vec::new())),
      _ => body,
    })
  }
}
