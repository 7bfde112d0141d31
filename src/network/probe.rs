//! Raw connectivity probes.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use std::time::Duration;
use url::Url;

/// One observation from a connectivity probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReading {
  /// A network interface is up
  pub is_connected: bool,
  /// Whether the internet is reachable through it; `None` if not yet known
  pub is_internet_reachable: Option<bool>,
}

impl ProbeReading {
  pub fn online() -> Self {
    Self {
      is_connected: true,
      is_internet_reachable: Some(true),
    }
  }

  pub fn offline() -> Self {
    Self {
      is_connected: false,
      is_internet_reachable: Some(false),
    }
  }

  /// Interface up, reachability still unknown. Counts as connected.
  pub fn unverified() -> Self {
    Self {
      is_connected: true,
      is_internet_reachable: None,
    }
  }

  /// Connected unless reachability is known to be false.
  pub fn is_online(&self) -> bool {
    self.is_connected && self.is_internet_reachable != Some(false)
  }
}

/// Something that can be asked "are we online?" on demand.
pub trait ConnectivityProbe: Send + Sync {
  fn probe(&self) -> BoxFuture<'_, Result<ProbeReading>>;
}

/// Probes connectivity with a lightweight HTTP request.
///
/// A connection failure means no usable interface; any other failure (timeout,
/// captive portal error status) means an interface without internet.
#[derive(Clone)]
pub struct HttpProbe {
  client: reqwest::Client,
  url: Url,
}

impl HttpProbe {
  pub fn new(url: Url, timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create probe client: {}", e))?;

    Ok(Self { client, url })
  }

  pub fn url(&self) -> &Url {
    &self.url
  }
}

impl ConnectivityProbe for HttpProbe {
  fn probe(&self) -> BoxFuture<'_, Result<ProbeReading>> {
    async move {
      match self.client.head(self.url.clone()).send().await {
        Ok(response) if response.status().is_success() || response.status().is_redirection() => {
          Ok(ProbeReading::online())
        }
        Ok(response) => {
          tracing::debug!(status = %response.status(), url = %self.url, "probe got error status");
          Ok(ProbeReading {
            is_connected: true,
            is_internet_reachable: Some(false),
          })
        }
        Err(e) if e.is_connect() => Ok(ProbeReading::offline()),
        Err(e) if e.is_timeout() => Ok(ProbeReading {
          is_connected: true,
          is_internet_reachable: Some(false),
        }),
        Err(e) => Err(eyre!("Probe request to {} failed: {}", self.url, e)),
      }
    }
    .boxed()
  }
}
