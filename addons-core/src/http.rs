//! Blocking HTTP GET probes for endpoints exposed by addons.

use std::time::Duration;

use reqwest::blocking::Client;
use tracing::debug;

use crate::{
    error::{AddonError, Result},
    poll::Check,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| AddonError::Http {
                url: "<client>".into(),
                source,
            })?;
        Ok(Self { client })
    }

    /// Single GET. Connection and body read failures are transient
    /// [`AddonError::Http`] errors.
    pub fn get(&self, url: &str) -> Result<HttpResponse> {
        let http_err = |source| AddonError::Http {
            url: url.to_string(),
            source,
        };
        let response = self.client.get(url).send().map_err(http_err)?;
        let status = response.status().as_u16();
        let body = response.text().map_err(http_err)?;
        debug!(%url, status, bytes = body.len(), "http probe");
        Ok(HttpResponse { status, body })
    }

    /// Ready when the status matches and, if given, the body contains
    /// `contains`.
    pub fn check(
        &self,
        url: &str,
        expected_status: u16,
        contains: Option<&str>,
    ) -> Result<Check<HttpResponse>> {
        let response = self.get(url)?;
        let ready = response.status == expected_status
            && contains.is_none_or(|needle| response.body.contains(needle));
        Ok(if ready {
            Check::Ready(response)
        } else {
            Check::Pending
        })
    }
}
