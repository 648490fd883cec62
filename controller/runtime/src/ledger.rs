//! Client for the payment ledger.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{http, Request, StatusCode};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use thiserror::Error;
use tracing::debug;

/// Deducts amounts from balances.
#[async_trait::async_trait]
pub trait Spend: Clone + Send + Sync + 'static {
    async fn spend(&self, id: &str, amount: u64) -> Result<(), Error>;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("ledger denied spend: {0}")]
    Denied(String),

    #[error("invalid ledger request: {0}")]
    Request(#[from] http::Error),

    #[error("ledger request failed: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),

    #[error("failed to read ledger response: {0}")]
    Body(#[from] hyper::Error),
}

#[derive(Clone, Debug)]
pub struct Ledger {
    url: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

// === impl Ledger ===

impl Ledger {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn spend_uri(&self, id: &str) -> String {
        format!("{}/balances/{}:spend", self.url, id)
    }
}

#[async_trait::async_trait]
impl Spend for Ledger {
    async fn spend(&self, id: &str, amount: u64) -> Result<(), Error> {
        let req = Request::builder()
            .method(http::Method::POST)
            .uri(self.spend_uri(id))
            .header(http::header::CONTENT_TYPE, "text/plain")
            .body(Full::new(Bytes::from(amount.to_string())))?;

        let rsp = self.client.request(req).await?;
        let status = rsp.status();
        if status == StatusCode::OK {
            debug!(%id, amount, "Spent");
            return Ok(());
        }

        let body = rsp.into_body().collect().await?.to_bytes();
        let reason = String::from_utf8_lossy(&body).trim().to_string();
        if reason.is_empty() {
            return Err(Error::Denied(status.to_string()));
        }
        Err(Error::Denied(reason))
    }
}
