use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{ServiceResolver, UpstreamError};

/// GET-and-decode client for named upstream services.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    resolver: Arc<dyn ServiceResolver>,
}

impl HttpClient {
    pub fn new(resolver: Arc<dyn ServiceResolver>, connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;

        Ok(Self { client, resolver })
    }

    /// Resolves `service`, requests `segments` below its base URL and decodes
    /// the body as JSON. Non-2xx responses are errors.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        service: &str,
        segments: &[&str],
    ) -> Result<T, UpstreamError> {
        let base = self.resolver.resolve(service)?;
        let url = build_url(&base, segments);

        debug!(service, url = %url, "GET");
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

fn build_url(base: &str, segments: &[&str]) -> String {
    let path: Vec<String> = segments
        .iter()
        .map(|s| urlencoding::encode(s).to_string())
        .collect();

    format!("{}/{}", base.trim_end_matches('/'), path.join("/"))
}
