//! Tracing middleware for gRPC client channels.
//!
//! Sits on the HTTP/2 request path below tonic, which forwards request
//! extensions, so the parent span travels the same way as for plain
//! HTTP. Spans are named after the RPC path
//! (`/package.Service/Method`). Failed unary calls come back
//! trailers-only, which surfaces `grpc-status` in the response headers
//! where this middleware can see it.

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use http::{HeaderMap, Request, Response};
use tower::Layer;

use super::FinishGuard;
use crate::labels;
use crate::span::Span;

/// Layer wrapping a gRPC channel with child-span creation and
/// trace-context propagation.
#[derive(Clone, Default)]
pub struct TracingLayer;

impl TracingLayer {
    pub fn new() -> Self {
        TracingLayer
    }
}

impl<Service> Layer<Service> for TracingLayer
where
    Service: Send + Clone,
{
    type Service = TracingService<Service>;

    fn layer(&self, next: Service) -> Self::Service {
        TracingService { next }
    }
}

/// Service that opens one client span per RPC.
#[derive(Clone)]
pub struct TracingService<Service> {
    next: Service,
}

impl<Service, ReqBody, ResBody> tower::Service<Request<ReqBody>> for TracingService<Service>
where
    Service: tower::Service<Request<ReqBody>, Response = Response<ResBody>> + Send + Clone + 'static,
    Service::Future: Send + 'static,
    Service::Error: Display,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = Service::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.next.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let mut next = self.next.clone();

        let Some(parent) = req.extensions().get::<Span>().cloned() else {
            return Box::pin(async move { next.call(req).await });
        };

        let name = req.uri().path().to_owned();
        let child = parent.new_remote_child(name, req.headers_mut());

        let guard = FinishGuard::new(child);
        Box::pin(async move {
            match next.call(req).await {
                Ok(response) => {
                    if let Some(error) = grpc_error(response.headers()) {
                        guard.set_label(labels::ERROR, error);
                    }
                    guard.finish();
                    Ok(response)
                }
                Err(error) => {
                    guard.set_label(labels::ERROR, error.to_string());
                    guard.finish();
                    Err(error)
                }
            }
        })
    }
}

/// Render a non-OK `grpc-status` as `<code>: <message>`.
fn grpc_error(headers: &HeaderMap) -> Option<String> {
    let code = headers
        .get("grpc-status")?
        .to_str()
        .ok()?
        .parse::<i32>()
        .ok()?;
    if code == 0 {
        return None;
    }
    let code = tonic::Code::from_i32(code);
    let message = headers
        .get("grpc-message")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    Some(format!("{code:?}: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_status_is_not_an_error() {
        let mut headers = HeaderMap::new();
        headers.insert("grpc-status", "0".parse().unwrap());
        assert_eq!(grpc_error(&headers), None);
        assert_eq!(grpc_error(&HeaderMap::new()), None);
    }

    #[test]
    fn failed_status_renders_code_and_message() {
        let mut headers = HeaderMap::new();
        headers.insert("grpc-status", "13".parse().unwrap());
        headers.insert("grpc-message", "backend exploded".parse().unwrap());
        assert_eq!(
            grpc_error(&headers).as_deref(),
            Some("Internal: backend exploded")
        );
    }

    #[test]
    fn missing_message_still_renders_the_code() {
        let mut headers = HeaderMap::new();
        headers.insert("grpc-status", "5".parse().unwrap());
        assert_eq!(grpc_error(&headers).as_deref(), Some("NotFound: "));
    }
}
