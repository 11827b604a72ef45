//! Trace identity: trace and span identifiers, and the
//! `X-Cloud-Trace-Context` wire format that carries them across process
//! boundaries.

mod header;
mod ids;

pub use header::{HEADER_NAME, SpanContext, TraceOptions, header_name};
pub use ids::{ParseTraceIdError, SpanId, TraceId};
