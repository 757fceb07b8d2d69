//! Contains a remote implementation using HTTP to talk to the service under test.

use std::time::Duration;

/// The parts of an HTTP response the scenario checks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// The response body, decoded as text.
    pub body: String,
}

/// A remote implementation using HTTP to talk to the service under test.
///
/// All virtual users share one instance, and with it one connection pool.
#[derive(Clone, Debug)]
pub struct HttpRemote {
    client: reqwest::Client,
}

impl HttpRemote {
    /// Creates a new `HttpRemote` whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("loadtest/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self { client })
    }

    /// Issues a GET request and reads the full response body.
    ///
    /// Non-success statuses are returned as regular responses. Only transport failures, including
    /// timeouts and errors while reading the body, are returned as errors.
    pub async fn get(&self, url: &str) -> reqwest::Result<Response> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        Ok(Response { status, body })
    }
}
