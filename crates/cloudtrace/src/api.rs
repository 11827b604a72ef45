//! Serde model of the trace backend's REST payload.
//!
//! Times are RFC 3339 with nanosecond precision; span ids travel as
//! decimal strings. A `parentSpanId` of zero means "root within this
//! payload" and is omitted from the wire form.

use std::collections::BTreeMap;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// Body of a `PATCH /v1/projects/{projectId}/traces` request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Traces {
    pub traces: Vec<Trace>,
}

/// One trace: a set of spans sharing a trace id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub project_id: String,
    /// 32 hex digits.
    pub trace_id: String,
    pub spans: Vec<TraceSpan>,
}

/// One finished span within a trace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSpan {
    /// Nonzero.
    #[serde(with = "u64_string")]
    pub span_id: u64,

    #[serde(default)]
    pub kind: SpanKind,

    pub name: String,

    #[serde(with = "u64_string", default, skip_serializing_if = "is_zero")]
    pub parent_span_id: u64,

    pub start_time: Timestamp,

    pub end_time: Timestamp,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// The role a span plays in an RPC exchange.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    #[default]
    #[serde(rename = "SPAN_KIND_UNSPECIFIED")]
    Unspecified,
    #[serde(rename = "RPC_SERVER")]
    RpcServer,
    #[serde(rename = "RPC_CLIENT")]
    RpcClient,
}

fn is_zero(id: &u64) -> bool {
    *id == 0
}

mod u64_string {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(id: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(id)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(D::Error::custom)
    }
}
