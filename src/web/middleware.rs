//! Page view counting middleware
//!
//! Decides which requests are page views and hands the client's address and
//! user agent to the visitor counter before the request reaches its handler.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, HeaderMap, Method, Request},
    response::Response,
};
use futures::future::BoxFuture;
use std::{net::SocketAddr, task::{Context, Poll}};
use tower::{Layer, Service};

use crate::counter::VisitorCounter;

/// Paths that are never page views, besides everything under `/api/`
const EXCLUDED_PATHS: &[&str] = &["/healthz", "/favicon.ico", "/robots.txt"];

/// Get the client address, checking proxy headers first when trusted.
/// Priority: X-Forwarded-For (first IP) > X-Real-IP > ConnectInfo
fn client_ip(headers: &HeaderMap, peer: Option<String>, trust_proxy: bool) -> Option<String> {
    if trust_proxy {
        // X-Forwarded-For may contain a chain of IPs, first is the original client
        if let Some(forwarded) = headers.get("x-forwarded-for") {
            if let Ok(ips) = forwarded.to_str() {
                if let Some(first_ip) = ips.split(',').next() {
                    let ip = first_ip.trim();
                    if !ip.is_empty() {
                        return Some(ip.to_string());
                    }
                }
            }
        }

        if let Some(real_ip) = headers.get("x-real-ip") {
            if let Ok(ip) = real_ip.to_str() {
                let ip = ip.trim();
                if !ip.is_empty() {
                    return Some(ip.to_string());
                }
            }
        }
    }

    peer
}

/// Only GET requests for HTML documents outside the API count as page views
fn is_page_view(method: &Method, path: &str, headers: &HeaderMap) -> bool {
    if method != Method::GET || path.starts_with("/api/") || EXCLUDED_PATHS.contains(&path) {
        return false;
    }

    match headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) {
        None => true,
        Some(accept) => accept.contains("text/html") || accept.contains("*/*"),
    }
}

/// Layer that records page views
#[derive(Clone)]
pub struct PageViewLayer {
    counter: VisitorCounter,
    trust_proxy: bool,
}

impl PageViewLayer {
    pub fn new(counter: VisitorCounter, trust_proxy: bool) -> Self {
        Self { counter, trust_proxy }
    }
}

impl<S> Layer<S> for PageViewLayer {
    type Service = PageViewMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PageViewMiddleware {
            inner,
            counter: self.counter.clone(),
            trust_proxy: self.trust_proxy,
        }
    }
}

/// Middleware service that records page views
#[derive(Clone)]
pub struct PageViewMiddleware<S> {
    inner: S,
    counter: VisitorCounter,
    trust_proxy: bool,
}

impl<S> Service<Request<Body>> for PageViewMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let counter = self.counter.clone();
        let trust_proxy = self.trust_proxy;
        // Take the service that was driven to readiness, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let headers = request.headers();

            if is_page_view(request.method(), request.uri().path(), headers) {
                let peer = request
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string());
                let ip = client_ip(headers, peer, trust_proxy);
                let user_agent = headers
                    .get(header::USER_AGENT)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);

                counter.record_page_view(ip.as_deref(), user_agent.as_deref()).await;
            }

            inner.call(request).await
        })
    }
}
