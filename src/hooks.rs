//! Call boundaries: the transport the executor delegates I/O to, and the
//! caller-supplied hooks that run around a single call.
//!
//! Hook order within one call is fixed: request hook, transport call, then
//! either the retry hook or the response hook (never both).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use reqwest::{Request, Response};
use tokio_util::sync::CancellationToken;

use crate::{BoxError, Error, Result};

/// Owned, sendable future returned by the object-safe boundaries.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Performs one network round trip.
///
/// Implementations are shared by every call made through a client and must be
/// safe for concurrent use.
pub trait Transport: Send + Sync {
    fn send(&self, request: Request) -> BoxFuture<'_, Result<Response>>;
}

impl Transport for reqwest::Client {
    fn send(&self, request: Request) -> BoxFuture<'_, Result<Response>> {
        Box::pin(async move { self.execute(request).await.map_err(Error::transport) })
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, request: Request) -> BoxFuture<'_, Result<Response>> {
        (**self).send(request)
    }
}

/// Mutates the fully built request before it is sent. An error aborts the call.
pub trait RequestHook: Send {
    fn on_request(&mut self, request: &mut Request) -> std::result::Result<(), BoxError>;
}

impl<F> RequestHook for F
where
    F: FnMut(&mut Request) -> std::result::Result<(), BoxError> + Send,
{
    fn on_request(&mut self, request: &mut Request) -> std::result::Result<(), BoxError> {
        self(request)
    }
}

/// Runs once on the response of a call without a retry hook.
///
/// `request` is the request as sent, without its body. The hook may consume
/// the response body; on error the response is discarded by the executor.
pub trait ResponseHook: Send {
    fn on_response<'a>(
        &'a mut self,
        request: &'a Request,
        response: &'a mut Response,
    ) -> BoxFuture<'a, std::result::Result<(), BoxError>>;
}

impl<F> ResponseHook for F
where
    F: FnMut(&Request, &Response) -> std::result::Result<(), BoxError> + Send,
{
    fn on_response<'a>(
        &'a mut self,
        request: &'a Request,
        response: &'a mut Response,
    ) -> BoxFuture<'a, std::result::Result<(), BoxError>> {
        let outcome = self(request, response);
        Box::pin(std::future::ready(outcome))
    }
}

/// Owns the remainder of a call after the first transport round trip.
///
/// Receives a replayable copy of the request, the first outcome, and the
/// transport; whatever it returns is what the caller gets.
pub trait RetryHook: Send {
    fn retry(
        &mut self,
        request: Request,
        outcome: Result<Response>,
        transport: Arc<dyn Transport>,
    ) -> BoxFuture<'_, Result<Response>>;
}

impl<F> RetryHook for F
where
    F: FnMut(Request, Result<Response>, Arc<dyn Transport>) -> BoxFuture<'static, Result<Response>>
        + Send,
{
    fn retry(
        &mut self,
        request: Request,
        outcome: Result<Response>,
        transport: Arc<dyn Transport>,
    ) -> BoxFuture<'_, Result<Response>> {
        self(request, outcome, transport)
    }
}

/// Races every transport call against a cancellation token.
pub(crate) struct Cancellable {
    pub(crate) inner: Arc<dyn Transport>,
    pub(crate) token: CancellationToken,
}

impl Transport for Cancellable {
    fn send(&self, request: Request) -> BoxFuture<'_, Result<Response>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => Err(Error::Cancelled),
                outcome = self.inner.send(request) => outcome,
            }
        })
    }
}

/// Copies method, URL, headers, timeout and version. The body is left empty.
pub(crate) fn without_body(request: &Request) -> Request {
    let mut copy = Request::new(request.method().clone(), request.url().clone());
    *copy.headers_mut() = request.headers().clone();
    *copy.timeout_mut() = request.timeout().copied();
    *copy.version_mut() = request.version();
    copy
}

/// Full copy when the body is replayable, otherwise a copy without body.
pub(crate) fn replayable(request: &Request) -> Request {
    request.try_clone().unwrap_or_else(|| without_body(request))
}
