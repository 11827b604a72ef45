//! Tracing middleware for outbound HTTP client stacks.

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use http::{Request, Response};
use tower::Layer;

use super::FinishGuard;
use crate::labels;
use crate::span::{FinishOptions, Span};

/// Layer wrapping an HTTP client service with child-span creation and
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

/// Service that opens one client span per outbound request.
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

        let host = req.uri().host().unwrap_or_default().to_owned();
        let method = req.method().to_string();
        let url = req.uri().to_string();
        let name = format!("{host}{}", req.uri().path());

        let child = parent.new_remote_child(name, req.headers_mut());
        child.set_label(labels::HTTP_HOST, host);
        child.set_label(labels::HTTP_METHOD, method);
        child.set_label(labels::HTTP_URL, url);

        let guard = FinishGuard::new(child);
        Box::pin(async move {
            match next.call(req).await {
                Ok(response) => {
                    guard.finish_with(FinishOptions::from_response(&response));
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
