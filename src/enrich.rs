//! Enrichment service client
//!
//! Sends a record's capture value to the external scoring service and
//! decodes the results. One short-lived POST per record: the request body is
//! plain text, the connection is not kept alive, and both the connect and the
//! whole round-trip are bounded so a stalled service cannot wedge a worker.

use crate::config::EnricherConfig;
use crate::record::EnrichmentResult;
use crate::Result;
use reqwest::header::{CONNECTION, CONTENT_TYPE};
use std::time::Duration;

/// Bound on the whole enrichment round-trip
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on establishing the connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for the enrichment service
pub struct EnrichClient {
    http: reqwest::Client,
    endpoint: String,
}

impl EnrichClient {
    /// Build the client from configuration
    ///
    /// The query string is appended verbatim to the base URL. Certificate
    /// checks are relaxed only when the deployment opts in.
    pub fn new(config: &EnricherConfig, accept_invalid_certs: bool) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(0);
        if accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(Self {
            http: builder.build()?,
            endpoint: format!("{}{}", config.url, config.query),
        })
    }

    /// Enrich one capture value
    ///
    /// Returns the service's usable results: entries with empty result text
    /// are dropped and HTML entities in the surviving text are decoded.
    /// Transport and decode failures surface as errors for the caller to
    /// treat as a per-record miss.
    pub async fn enrich(&self, capture: &str) -> Result<Vec<EnrichmentResult>> {
        let response = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "text/plain")
            .header(CONNECTION, "close")
            .body(capture.to_string())
            .send()
            .await?
            .error_for_status()?;

        let results: Vec<EnrichmentResult> = response.json().await?;
        Ok(clean_results(results))
    }
}

/// Decode HTML entities and drop entries with no result text
fn clean_results(results: Vec<EnrichmentResult>) -> Vec<EnrichmentResult> {
    results
        .into_iter()
        .map(|mut r| {
            r.result = html_escape::decode_html_entities(&r.result).into_owned();
            r
        })
        .filter(|r| !r.result.is_empty())
        .collect()
}
