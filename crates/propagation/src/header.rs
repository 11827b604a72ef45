//! Codec for the trace-context header.
//!
//! Wire grammar: `TRACEID "/" SPANID [";o=" OPTS]` where `TRACEID` is 32
//! hex digits, `SPANID` a decimal u64 (0 = unknown parent) and `OPTS` a
//! decimal u32 bit field.

use std::fmt;
use std::str::FromStr;

use http::HeaderName;

use crate::{SpanId, TraceId};

/// Name of the header carrying trace context between processes.
pub const HEADER_NAME: &str = "x-cloud-trace-context";

/// The header name as a typed `http` value.
pub fn header_name() -> HeaderName {
    HeaderName::from_static(HEADER_NAME)
}

/// Option bits carried in the `;o=` suffix of the header.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TraceOptions(pub u32);

impl TraceOptions {
    const TRACE_ENABLED: u32 = 1;
    const FORCE_TRACE: u32 = 1 << 1;

    /// Bit 0: the upstream caller is tracing this request and expects
    /// spans to flow.
    pub fn trace_enabled(self) -> bool {
        self.0 & Self::TRACE_ENABLED != 0
    }

    /// Bit 1: the caller asks for tracing regardless of local policy.
    pub fn force_trace(self) -> bool {
        self.0 & Self::FORCE_TRACE != 0
    }

    pub fn with_trace_enabled(self, enabled: bool) -> Self {
        if enabled {
            TraceOptions(self.0 | Self::TRACE_ENABLED)
        } else {
            TraceOptions(self.0 & !Self::TRACE_ENABLED)
        }
    }
}

/// The parsed contents of a trace-context header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SpanContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub options: TraceOptions,
}

impl SpanContext {
    pub fn new(trace_id: TraceId, span_id: SpanId, options: TraceOptions) -> Self {
        SpanContext {
            trace_id,
            span_id,
            options,
        }
    }

    /// Parse a header value.
    ///
    /// Parsing is tolerant where the grammar allows: the `;o=` suffix may
    /// be missing (options default to 0) and `/0` means the parent span
    /// is unknown. Anything malformed yields `None`, which callers treat
    /// as "no upstream context".
    pub fn parse(value: &str) -> Option<SpanContext> {
        if value.is_empty() {
            return None;
        }
        let (trace, rest) = value.split_once('/')?;
        let trace_id = trace.parse::<TraceId>().ok()?;
        let (span, options) = match rest.split_once(";o=") {
            Some((span, options)) => (span, parse_decimal::<u32>(options)?),
            None => (rest, 0),
        };
        let span_id = parse_decimal::<u64>(span)?;
        Some(SpanContext {
            trace_id,
            span_id: SpanId(span_id),
            options: TraceOptions(options),
        })
    }
}

// std's unsigned `FromStr` accepts a leading `+`, which the wire grammar
// does not.
fn parse_decimal<T: FromStr>(s: &str) -> Option<T> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl fmt::Display for SpanContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{};o={}", self.trace_id, self.span_id, self.options.0)
    }
}
