//! Well-known label keys attached by the instrumentation.

/// Host of the request URL.
pub const HTTP_HOST: &str = "trace.cloud.google.com/http/host";

/// HTTP request method.
pub const HTTP_METHOD: &str = "trace.cloud.google.com/http/method";

/// Full request URL.
pub const HTTP_URL: &str = "trace.cloud.google.com/http/url";

/// Response status code, attached when a span finishes.
pub const HTTP_STATUS_CODE: &str = "trace.cloud.google.com/http/status_code";

/// Failure description attached to RPC spans.
pub const ERROR: &str = "error";

/// Reserved for stack traces attached by instrumented code.
pub const STACKTRACE: &str = "trace.cloud.google.com/stacktrace";
