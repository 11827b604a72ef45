//! The upload side of the pipeline: a transport seam plus the bundle
//! handler that ships sealed bundles through it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bundler::{Bundle, BundleHandler};
use tokio::sync::oneshot;
use url::Url;

use crate::api;
use crate::error::UploadError;

/// Transport seam for shipping trace payloads. The default is
/// [`HttpTraceService`]; tests substitute a recording implementation.
#[async_trait]
pub trait TraceService: Send + Sync + 'static {
    async fn patch_traces(&self, body: api::Traces) -> Result<(), UploadError>;
}

/// One finished trace plus the `finish_wait` callers to settle when its
/// bundle reaches a terminal state.
pub(crate) struct UploadItem {
    pub(crate) trace: api::Trace,
    pub(crate) waiters: Vec<oneshot::Sender<Result<(), UploadError>>>,
}

/// Ships bundles through the transport, delivering exactly one terminal
/// result per bundle to every registered waiter.
pub(crate) struct Uploader {
    transport: Arc<dyn TraceService>,
}

impl Uploader {
    pub(crate) fn new(transport: Arc<dyn TraceService>) -> Self {
        Uploader { transport }
    }
}

#[async_trait]
impl BundleHandler<UploadItem> for Uploader {
    async fn handle(&self, bundle: Bundle<UploadItem>) {
        let Bundle { seq, items, .. } = bundle;
        let mut traces = Vec::with_capacity(items.len());
        let mut waiters = Vec::new();
        for item in items {
            traces.push(item.trace);
            waiters.extend(item.waiters);
        }

        let count = traces.len();
        let result = self.transport.patch_traces(api::Traces { traces }).await;
        match &result {
            Ok(()) => log::debug!("uploaded bundle #{seq} ({count} traces)"),
            // Upload failures reach `finish_wait` callers; everyone else
            // only sees this log line.
            Err(error) => log::error!("upload of bundle #{seq} ({count} traces) failed: {error}"),
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

/// Default transport: JSON over HTTPS via reqwest.
pub struct HttpTraceService {
    client: reqwest::Client,
    url: Url,
}

impl HttpTraceService {
    /// `url` is the full `…/v1/projects/{project}/traces` endpoint.
    pub fn new(client: reqwest::Client, url: Url) -> Self {
        HttpTraceService { client, url }
    }
}

#[async_trait]
impl TraceService for HttpTraceService {
    async fn patch_traces(&self, body: api::Traces) -> Result<(), UploadError> {
        let response = self
            .client
            .patch(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|error| UploadError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(UploadError::Backend {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

pub(crate) fn default_http_client() -> reqwest::Client {
    let mut headers = http::HeaderMap::new();
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("keep-alive"),
    );

    reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        // A short pool idle timeout picks up DNS changes on long-lived
        // processes without hurting steady-state connection reuse.
        .pool_idle_timeout(Some(Duration::from_secs(5)))
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .default_headers(headers)
        .build()
        .expect("failed to build the default HTTP client")
}
