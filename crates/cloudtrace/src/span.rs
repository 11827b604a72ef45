//! Spans and the per-trace accumulation of finished spans.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use http::HeaderValue;
use jiff::Timestamp;
use propagation::{SpanContext, SpanId, TraceId, TraceOptions};
use tokio::sync::oneshot;

use crate::api::{self, SpanKind};
use crate::error::UploadError;
use crate::{ClientInner, labels};

/// A timed, labeled unit of work within a trace.
///
/// `Span` is a cheap handle; clones refer to the same span. Spans of
/// untraced requests are no-ops: every operation returns immediately,
/// and [`Span::new_remote_child`] still forwards the upstream context so
/// the chain stays intact for peers further down.
#[derive(Clone)]
pub struct Span {
    repr: Repr,
}

#[derive(Clone)]
enum Repr {
    /// Untraced. Keeps the upstream context, if any, for pass-through
    /// propagation.
    Noop { upstream: Option<SpanContext> },
    Live(Arc<SpanInner>),
}

struct SpanInner {
    trace: Arc<TraceInner>,
    span_id: SpanId,
    parent_span_id: SpanId,
    kind: SpanKind,
    name: String,
    start: Timestamp,
    is_root: bool,
    finished: AtomicBool,
    labels: Mutex<BTreeMap<String, String>>,
}

/// Optional data folded into a span as it finishes.
#[derive(Clone, Debug, Default)]
pub struct FinishOptions {
    status: Option<http::StatusCode>,
}

impl FinishOptions {
    /// Record the response status code under the status_code label.
    pub fn status(mut self, status: http::StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    /// Derive finish labels from an HTTP response.
    pub fn from_response<B>(response: &http::Response<B>) -> Self {
        Self::default().status(response.status())
    }
}

impl Span {
    pub(crate) fn noop(upstream: Option<SpanContext>) -> Self {
        Span {
            repr: Repr::Noop { upstream },
        }
    }

    pub(crate) fn root(
        trace: Arc<TraceInner>,
        name: String,
        kind: SpanKind,
        parent_span_id: SpanId,
    ) -> Self {
        Span {
            repr: Repr::Live(Arc::new(SpanInner {
                trace,
                span_id: SpanId::random(),
                parent_span_id,
                kind,
                name,
                start: Timestamp::now(),
                is_root: true,
                finished: AtomicBool::new(false),
                labels: Mutex::new(BTreeMap::new()),
            })),
        }
    }

    /// Whether this span records and propagates trace data.
    pub fn is_traced(&self) -> bool {
        matches!(self.repr, Repr::Live(_))
    }

    /// The id of the trace this span belongs to.
    pub fn trace_id(&self) -> Option<TraceId> {
        match &self.repr {
            Repr::Noop { upstream } => upstream.map(|context| context.trace_id),
            Repr::Live(inner) => Some(inner.trace.trace_id),
        }
    }

    /// This span's id; `None` when untraced.
    pub fn span_id(&self) -> Option<SpanId> {
        match &self.repr {
            Repr::Noop { .. } => None,
            Repr::Live(inner) => Some(inner.span_id),
        }
    }

    /// The trace-context header value a downstream peer should see from
    /// this span. Untraced spans forward the upstream context with the
    /// trace bit cleared; `None` without any context at all.
    pub fn header(&self) -> Option<String> {
        match &self.repr {
            Repr::Noop { upstream } => upstream.map(|context| {
                SpanContext {
                    options: context.options.with_trace_enabled(false),
                    ..context
                }
                .to_string()
            }),
            Repr::Live(inner) => Some(
                SpanContext::new(inner.trace.trace_id, inner.span_id, inner.trace.options)
                    .to_string(),
            ),
        }
    }

    /// Open a child span for in-process work.
    pub fn new_child(&self, name: impl Into<String>) -> Span {
        self.child(name.into(), SpanKind::Unspecified)
    }

    /// Open a client span for an outbound call and stamp the trace
    /// context onto its headers.
    pub fn new_remote_child(&self, name: impl Into<String>, headers: &mut http::HeaderMap) -> Span {
        let child = self.child(name.into(), SpanKind::RpcClient);
        if let Some(value) = child.header()
            && let Ok(value) = HeaderValue::from_str(&value)
        {
            headers.insert(propagation::header_name(), value);
        }
        child
    }

    fn child(&self, name: String, kind: SpanKind) -> Span {
        match &self.repr {
            Repr::Noop { .. } => self.clone(),
            Repr::Live(inner) => Span {
                repr: Repr::Live(Arc::new(SpanInner {
                    trace: inner.trace.clone(),
                    span_id: SpanId::random(),
                    parent_span_id: inner.span_id,
                    kind,
                    name,
                    start: Timestamp::now(),
                    is_root: false,
                    finished: AtomicBool::new(false),
                    labels: Mutex::new(BTreeMap::new()),
                })),
            },
        }
    }

    /// Add or overwrite a label; an empty value deletes it. Ignored once
    /// the span has finished.
    pub fn set_label(&self, key: impl Into<String>, value: impl Into<String>) {
        let Repr::Live(inner) = &self.repr else {
            return;
        };
        if inner.finished.load(Ordering::Acquire) {
            return;
        }
        let Ok(mut map) = inner.labels.lock() else {
            return;
        };
        let value = value.into();
        if value.is_empty() {
            map.remove(&key.into());
        } else {
            map.insert(key.into(), value);
        }
    }

    /// Close the span, stamping its end time. At most once; later calls
    /// are no-ops.
    pub fn finish(&self) {
        self.finish_with(FinishOptions::default());
    }

    pub fn finish_with(&self, options: FinishOptions) {
        let Repr::Live(inner) = &self.repr else {
            return;
        };
        inner.finish(options);
    }

    /// Close the span and wait until the enclosing trace has been
    /// uploaded, returning the terminal outcome.
    ///
    /// Resolves immediately when the trace is not going to be uploaded.
    pub async fn finish_wait(&self) -> Result<(), UploadError> {
        self.finish_wait_with(FinishOptions::default()).await
    }

    pub async fn finish_wait_with(&self, options: FinishOptions) -> Result<(), UploadError> {
        let Repr::Live(inner) = &self.repr else {
            return Ok(());
        };
        let waiter = inner.trace.register_waiter();
        inner.finish(options);
        match waiter {
            Some(receiver) => receiver.await.unwrap_or(Err(UploadError::Abandoned)),
            None => Ok(()),
        }
    }
}

impl SpanInner {
    fn finish(&self, options: FinishOptions) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let end = Timestamp::now();
        if let Some(status) = options.status
            && let Ok(mut map) = self.labels.lock()
        {
            map.insert(
                labels::HTTP_STATUS_CODE.to_owned(),
                status.as_u16().to_string(),
            );
        }
        let span = api::TraceSpan {
            span_id: self.span_id.0,
            kind: self.kind,
            name: self.name.clone(),
            parent_span_id: self.parent_span_id.0,
            start_time: self.start,
            end_time: end,
            labels: self
                .labels
                .lock()
                .map(|map| map.clone())
                .unwrap_or_default(),
        };
        self.trace.record(span, self.is_root);
    }
}

/// Shared state of one trace: identity, options, the upload decision,
/// and the spans finished so far.
pub(crate) struct TraceInner {
    trace_id: TraceId,
    /// Options propagated to downstream peers.
    options: TraceOptions,
    sampled: bool,
    client: Arc<ClientInner>,
    buffer: Mutex<TraceBuffer>,
}

#[derive(Default)]
struct TraceBuffer {
    spans: Vec<api::TraceSpan>,
    waiters: Vec<oneshot::Sender<Result<(), UploadError>>>,
    submitted: bool,
}

impl TraceInner {
    pub(crate) fn new(
        trace_id: TraceId,
        options: TraceOptions,
        sampled: bool,
        client: Arc<ClientInner>,
    ) -> Arc<Self> {
        Arc::new(TraceInner {
            trace_id,
            options,
            sampled,
            client,
            buffer: Mutex::new(TraceBuffer::default()),
        })
    }

    fn register_waiter(&self) -> Option<oneshot::Receiver<Result<(), UploadError>>> {
        if !self.sampled {
            return None;
        }
        let Ok(mut buffer) = self.buffer.lock() else {
            return None;
        };
        if buffer.submitted {
            return None;
        }
        let (sender, receiver) = oneshot::channel();
        buffer.waiters.push(sender);
        Some(receiver)
    }

    // Finished spans are kept in finish order; the root goes in last and
    // triggers submission under the same lock, so nothing can slot in
    // behind it.
    fn record(&self, span: api::TraceSpan, is_root: bool) {
        if !self.sampled {
            if is_root {
                log::debug!("discarding unsampled trace {}", self.trace_id);
            }
            return;
        }
        let submission = {
            let Ok(mut buffer) = self.buffer.lock() else {
                return;
            };
            if buffer.submitted {
                log::debug!(
                    "span {} finished after trace {} was submitted; dropping it",
                    span.span_id,
                    self.trace_id
                );
                return;
            }
            buffer.spans.push(span);
            if !is_root {
                return;
            }
            buffer.submitted = true;
            Some((
                std::mem::take(&mut buffer.spans),
                std::mem::take(&mut buffer.waiters),
            ))
        };
        if let Some((spans, waiters)) = submission {
            self.client.submit(self.trace_id, spans, waiters);
        }
    }
}
