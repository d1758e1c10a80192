use crate::error::{Error, Result};
use reqwest::{Client, Response, header};
use std::time::Duration;
use tracing::{debug, warn};

/// Budget for a complete non-streaming exchange.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Budget for the first response of a streaming exchange. The body itself is unbounded.
pub const STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// JSON POST helper with bearer auth. Never retries: that is the caller's call.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::transport(e.to_string()))?;
        Ok(Self { client })
    }

    /// POST and read the whole body, within [`REQUEST_TIMEOUT`].
    pub async fn post_json(&self, url: &str, body: &str, bearer: &str) -> Result<String> {
        let resp = self
            .request(url, body, bearer)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        Ok(resp.text().await?)
    }

    /// POST and hand back the live response for incremental reads.
    ///
    /// Only the wait for the response head is bounded by
    /// [`STREAM_CONNECT_TIMEOUT`]; the caller owns the body from there on.
    pub async fn post_stream(&self, url: &str, body: &str, bearer: &str) -> Result<Response> {
        let send = self
            .request(url, body, bearer)
            .header(header::ACCEPT, "text/event-stream")
            .send();
        let resp = tokio::time::timeout(STREAM_CONNECT_TIMEOUT, send)
            .await
            .map_err(|_| {
                Error::transport(format!(
                    "no response within {}s",
                    STREAM_CONNECT_TIMEOUT.as_secs()
                ))
            })??;
        check_status(resp).await
    }

    fn request(&self, url: &str, body: &str, bearer: &str) -> reqwest::RequestBuilder {
        debug!(url, bytes = body.len(), "POST");
        self.client
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
            .body(body.to_string())
    }
}

/// Turn any non-2xx response into [`Error::Remote`] with the body kept verbatim.
async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), "API returned error");
    Err(Error::remote(status.as_u16(), body))
}
