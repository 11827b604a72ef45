//! Outbound-call middleware.
//!
//! Both interceptors are stateless tower layers for client stacks. The
//! parent [`Span`] rides in the request extensions; for each outbound
//! request they open a client child span, stamp the trace-context
//! header, invoke the wrapped service and finish the child when the
//! response (or error) comes back. Requests without a span in their
//! extensions pass through untouched.

pub mod grpc;
pub mod http;

use crate::labels;
use crate::span::{FinishOptions, Span};

/// Finishes the wrapped span on drop, so a cancelled call still closes
/// its client span with an error label instead of leaking an open span.
struct FinishGuard {
    span: Option<Span>,
}

impl FinishGuard {
    fn new(span: Span) -> Self {
        FinishGuard { span: Some(span) }
    }

    fn set_label(&self, key: &'static str, value: String) {
        if let Some(span) = &self.span {
            span.set_label(key, value);
        }
    }

    fn finish(mut self) {
        if let Some(span) = self.span.take() {
            span.finish();
        }
    }

    fn finish_with(mut self, options: FinishOptions) {
        if let Some(span) = self.span.take() {
            span.finish_with(options);
        }
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if let Some(span) = self.span.take() {
            span.set_label(labels::ERROR, "canceled");
            span.finish();
        }
    }
}
