//! Where telemetry batches go.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::time::Duration;
use url::Url;

use super::event::TelemetryEvent;

/// Receiver of telemetry batches, normally a collector endpoint.
pub trait TelemetrySink: Send + Sync {
  /// Deliver the whole batch in one call. An error leaves the batch queued.
  fn send_batch<'a>(&'a self, events: &'a [TelemetryEvent]) -> BoxFuture<'a, Result<()>>;
}

#[derive(Serialize)]
struct BatchBody<'a> {
  events: &'a [TelemetryEvent],
}

/// Posts batches as JSON to a collector URL.
#[derive(Clone)]
pub struct HttpTelemetrySink {
  client: reqwest::Client,
  endpoint: Url,
  token: Option<String>,
}

impl HttpTelemetrySink {
  pub fn new(endpoint: Url, timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create telemetry client: {}", e))?;

    Ok(Self {
      client,
      endpoint,
      token: None,
    })
  }

  /// Authenticate with a bearer token.
  pub fn with_token(mut self, token: Option<String>) -> Self {
    self.token = token;
    self
  }
}

impl TelemetrySink for HttpTelemetrySink {
  fn send_batch<'a>(&'a self, events: &'a [TelemetryEvent]) -> BoxFuture<'a, Result<()>> {
    async move {
      let mut request = self
        .client
        .post(self.endpoint.clone())
        .json(&BatchBody { events });
      if let Some(token) = &self.token {
        request = request.bearer_auth(token);
      }

      request
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|e| eyre!("Failed to send {} telemetry events: {}", events.len(), e))?;
      Ok(())
    }
    .boxed()
  }
}
