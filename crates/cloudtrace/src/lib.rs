//! Client library for recording and uploading distributed traces.
//!
//! A [`Client`] turns inbound requests (or bare header values) into root
//! [`Span`]s, consulting its sampling policy and the incoming
//! `X-Cloud-Trace-Context` header. Application code opens children with
//! [`Span::new_child`] / [`Span::new_remote_child`]; the
//! [`interceptor`] middleware does this automatically for outbound HTTP
//! and gRPC calls. When a root span finishes, its trace is handed to a
//! background bundler and uploaded in batches; [`Span::finish_wait`]
//! parks the caller until the upload has a terminal result.
//!
//! Untraced requests cost almost nothing: their spans are no-op handles
//! that still forward the upstream context downstream.

pub mod api;
mod error;
pub mod interceptor;
pub mod labels;
mod options;
mod span;
mod uploader;

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bundler::Bundler;
use propagation::SpanContext;
use tokio::sync::oneshot;
use url::Url;

pub use api::SpanKind;
pub use error::{Error, UploadError};
pub use options::{ClientOptions, SamplingOptions};
pub use span::{FinishOptions, Span};
pub use uploader::{HttpTraceService, TraceService};

// The propagation and sampling vocabulary is part of this crate's API.
pub use propagation::{SpanId, TraceId};
pub use sampling::{Decision, LimitedSampler, Parameters, SamplingPolicy};

use options::DEFAULT_ENDPOINT;
use span::TraceInner;
use uploader::{UploadItem, Uploader};

/// Entry point: holds the project configuration, the sampling policy
/// and the upload pipeline, and produces root spans.
///
/// Cheap to clone; clones share the same pipeline.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    project_id: String,
    policy: ArcSwapOption<Box<dyn SamplingPolicy>>,
    bundler: Bundler<UploadItem>,
}

impl Client {
    /// Create a client. Must be called within a tokio runtime; uploads
    /// run on background tasks.
    pub fn new(mut options: ClientOptions) -> Result<Client, Error> {
        if options.project_id.is_empty() {
            return Err(Error::InvalidConfiguration(
                "project_id must not be empty".to_owned(),
            ));
        }
        let endpoint = options.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
        let url = format!(
            "{}/v1/projects/{}/traces",
            endpoint.trim_end_matches('/'),
            options.project_id
        );
        let url = Url::parse(&url)
            .map_err(|error| Error::InvalidConfiguration(format!("invalid endpoint: {error}")))?;

        let policy: Option<Box<dyn SamplingPolicy>> = match options.policy.take() {
            Some(policy) => Some(policy),
            None => match options.sampling {
                Some(SamplingOptions { fraction, max_qps }) => {
                    Some(Box::new(LimitedSampler::new(fraction, max_qps)?))
                }
                None => None,
            },
        };
        let transport = options
            .transport
            .take()
            .unwrap_or_else(|| Arc::new(HttpTraceService::new(uploader::default_http_client(), url)));

        let bundler = Bundler::new(options.bundler_options(), Uploader::new(transport));
        Ok(Client {
            inner: Arc::new(ClientInner {
                project_id: options.project_id,
                policy: ArcSwapOption::from(policy.map(Arc::new)),
                bundler,
            }),
        })
    }

    /// Replace the sampling policy. Lock-free for readers. `None` falls
    /// back to honoring the incoming header's trace bit.
    pub fn set_sampling_policy(&self, policy: Option<Box<dyn SamplingPolicy>>) {
        self.inner.policy.store(policy.map(Arc::new));
    }

    /// Build a root span from an inbound HTTP request, attaching the
    /// host, method and URL labels.
    pub fn span_from_request<B>(&self, request: &http::Request<B>) -> Span {
        let context = request
            .headers()
            .get(propagation::header_name())
            .and_then(|value| value.to_str().ok())
            .and_then(SpanContext::parse);

        let method = request.method().to_string();
        let span = self.root(format!("{method} {}", request.uri().path()), context);

        let host = request
            .uri()
            .host()
            .map(str::to_owned)
            .or_else(|| {
                request
                    .headers()
                    .get(http::header::HOST)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_owned)
            });
        if let Some(host) = host {
            span.set_label(labels::HTTP_HOST, host);
        }
        span.set_label(labels::HTTP_METHOD, method);
        span.set_label(labels::HTTP_URL, request.uri().to_string());
        span
    }

    /// Build a root span from a raw header value, for ingress that is
    /// not HTTP. An empty value means "no upstream context".
    pub fn span_from_header(&self, name: impl Into<String>, header: &str) -> Span {
        self.root(name.into(), SpanContext::parse(header))
    }

    fn root(&self, name: String, context: Option<SpanContext>) -> Span {
        let upstream_options = context.map(|c| c.options).unwrap_or_default();
        let has_trace_header = upstream_options.trace_enabled();

        let decision = match self.inner.policy.load_full() {
            Some(policy) => policy.sample(Parameters { has_trace_header }),
            // Without a policy, mirror the header: upload exactly when
            // upstream is tracing.
            None => Decision {
                trace: has_trace_header,
                sample: has_trace_header,
                weight: 0.0,
            },
        };

        // The force bit keeps the trace alive for propagation even when
        // the local decision says no; it does not by itself upload.
        if !decision.trace && !upstream_options.force_trace() {
            return Span::noop(context);
        }

        let trace_id = context
            .map(|c| c.trace_id)
            .unwrap_or_else(TraceId::random);
        let parent_span_id = context.map(|c| c.span_id).unwrap_or_default();
        let options = if decision.trace {
            upstream_options.with_trace_enabled(true)
        } else {
            upstream_options
        };

        log::debug!(
            "starting root span '{name}' in trace {trace_id} (sampled: {})",
            decision.sample
        );
        let trace = TraceInner::new(trace_id, options, decision.sample, self.inner.clone());
        Span::root(trace, name, SpanKind::RpcServer, parent_span_id)
    }

    /// Wait until every pending trace has reached the backend. Returns
    /// `false` if the deadline expired first.
    pub async fn flush(&self, deadline: Option<Duration>) -> bool {
        match deadline {
            Some(deadline) => tokio::time::timeout(deadline, self.inner.bundler.flush())
                .await
                .is_ok(),
            None => {
                self.inner.bundler.flush().await;
                true
            }
        }
    }
}

impl ClientInner {
    // Called by a trace when its root span finishes sampled.
    pub(crate) fn submit(
        &self,
        trace_id: TraceId,
        spans: Vec<api::TraceSpan>,
        waiters: Vec<oneshot::Sender<Result<(), UploadError>>>,
    ) {
        let trace = api::Trace {
            project_id: self.project_id.clone(),
            trace_id: trace_id.to_string(),
            spans,
        };
        // Byte accounting uses the serialized size, computed once here.
        let size = match serde_json::to_vec(&trace) {
            Ok(body) => body.len(),
            Err(error) => {
                log::error!("failed to serialize trace {trace_id}: {error}");
                let error = UploadError::Serialize(error.to_string());
                for waiter in waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
                return;
            }
        };
        if let Err(error) = self.bundler.add(UploadItem { trace, waiters }, size) {
            // Dropping the item hangs up on its waiters, which resolves
            // their `finish_wait` with `Abandoned`.
            log::warn!("dropping trace {trace_id}: {error}");
        }
    }
}
