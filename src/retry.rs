use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Body, Method, Request, Response, StatusCode, Url};

use crate::backoff::Backoff;
use crate::hooks::{without_body, BoxFuture, RetryHook, Transport};
use crate::{BoxError, Error, Result};

/// Default number of re-issued attempts before giving up.
pub const DEFAULT_POLL_LIMIT: usize = 10;
/// Default static wait between attempts when no [`Backoff`] is attached.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(20);
/// Default upper bound on draining one rejected response body.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Decides whether an outcome is final. `true` ends the loop.
pub type Condition = Arc<dyn Fn(&Result<Response>) -> bool + Send + Sync>;
/// Produces a fresh body for every re-issued attempt.
pub type BodyFactory = Arc<dyn Fn() -> std::result::Result<Body, BoxError> + Send + Sync>;

/// Returned when every attempt up to the poll limit was rejected.
#[derive(Debug, thiserror::Error)]
#[error(
    "retry failed after attempts={attempts}, total_time={total_wait:?}, req_method={method}, req_url={url}, res_err={}",
    describe_last(.last_status, .last_error)
)]
pub struct RetryPollError {
    /// Re-issued attempts, equal to the poll limit.
    pub attempts: usize,
    /// Sum of every wait slept between attempts.
    pub total_wait: Duration,
    pub method: Method,
    pub url: Url,
    /// Status of the last rejected response, if the last outcome was a response.
    pub last_status: Option<StatusCode>,
    /// Error of the last rejected outcome, if it was an error.
    #[source]
    pub last_error: Option<Box<Error>>,
}

fn describe_last(status: &Option<StatusCode>, error: &Option<Box<Error>>) -> String {
    match (status, error) {
        (_, Some(error)) => error.to_string(),
        (Some(status), None) => format!("status {status}"),
        (None, None) => String::new(),
    }
}

/// Bounded retry loop, usable as a [`RetryHook`].
///
/// The first outcome (already produced by the executor) is evaluated before
/// any request is re-issued. Every rejected response body is drained, for at
/// most the drain timeout, then closed before the next attempt.
///
/// The default condition accepts a response with a `2xx` status and rejects
/// everything else, transport errors and cancellation included. A call whose
/// cancellation token fired therefore keeps polling until the limit unless a
/// custom condition accepts [`Error::Cancelled`].
///
/// Request bodies: with a [`BodyFactory`] every re-issued attempt gets a fresh
/// body from it. Without one, in-memory bodies are replayed and streaming
/// bodies are re-sent empty.
///
/// Attach a [`Backoff`] to compute waits; otherwise the static wait applies.
/// Pass the policy by `&mut` to reuse its engine across sequential calls.
pub struct RetryPolicy {
    wait: Duration,
    poll_limit: usize,
    condition: Condition,
    body_factory: Option<BodyFactory>,
    backoff: Option<Backoff>,
    drain_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            wait: DEFAULT_WAIT,
            poll_limit: DEFAULT_POLL_LIMIT,
            condition: Arc::new(accept_success),
            body_factory: None,
            backoff: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("wait", &self.wait)
            .field("poll_limit", &self.poll_limit)
            .field("body_factory", &self.body_factory.is_some())
            .field("backoff", &self.backoff)
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

/// Accepts `2xx` responses; rejects other statuses and every error.
pub fn accept_success(outcome: &Result<Response>) -> bool {
    matches!(outcome, Ok(response) if response.status().is_success())
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Static wait between attempts. Zero falls back to [`DEFAULT_WAIT`].
    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = if wait.is_zero() { DEFAULT_WAIT } else { wait };
        self
    }

    /// Number of re-issued attempts. Zero falls back to [`DEFAULT_POLL_LIMIT`].
    pub fn poll_limit(mut self, poll_limit: usize) -> Self {
        self.poll_limit = if poll_limit == 0 {
            DEFAULT_POLL_LIMIT
        } else {
            poll_limit
        };
        self
    }

    /// Replaces the acceptance condition.
    pub fn condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Result<Response>) -> bool + Send + Sync + 'static,
    {
        self.condition = Arc::new(condition);
        self
    }

    pub fn body_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> std::result::Result<Body, BoxError> + Send + Sync + 'static,
    {
        self.body_factory = Some(Arc::new(factory));
        self
    }

    /// Computes waits with `backoff` instead of the static wait.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn backoff_engine(&self) -> Option<&Backoff> {
        self.backoff.as_ref()
    }

    /// Runs the retry loop on `request` starting from its first `outcome`.
    pub async fn run(
        &mut self,
        request: Request,
        outcome: Result<Response>,
        transport: &dyn Transport,
    ) -> Result<Response> {
        if (self.condition)(&outcome) {
            return outcome;
        }

        let mut outcome = outcome;
        let mut total_wait = Duration::ZERO;

        for attempt in 1..=self.poll_limit {
            let wait = self.discard(outcome, attempt).await;
            total_wait += wait;

            #[cfg(feature = "tracing")]
            tracing::debug!(
                attempt,
                poll_limit = self.poll_limit,
                wait_ms = wait.as_millis() as u64,
                method = %request.method(),
                url = %request.url(),
                "retrying request"
            );

            tokio::time::sleep(wait).await;

            outcome = transport.send(self.next_request(&request)?).await;
            if (self.condition)(&outcome) {
                return outcome;
            }
        }

        let (last_status, last_error) = match outcome {
            Ok(mut response) => {
                let status = response.status();
                drain(&mut response, self.drain_timeout).await;
                (Some(status), None)
            }
            Err(err) => (None, Some(Box::new(err))),
        };

        Err(RetryPollError {
            attempts: self.poll_limit,
            total_wait,
            method: request.method().clone(),
            url: request.url().clone(),
            last_status,
            last_error,
        }
        .into())
    }

    /// Drains and closes a rejected outcome, returning the wait before the next attempt.
    async fn discard(&mut self, outcome: Result<Response>, attempt: usize) -> Duration {
        match outcome {
            Ok(mut response) => {
                drain(&mut response, self.drain_timeout).await;
                self.wait_for(Some(&response), attempt)
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(attempt, error = %_err, "attempt rejected with error");
                self.wait_for(None, attempt)
            }
        }
    }

    fn wait_for(&mut self, response: Option<&Response>, attempt: usize) -> Duration {
        match self.backoff.as_mut() {
            Some(backoff) => {
                let attempt = u32::try_from(attempt).unwrap_or(u32::MAX);
                backoff.next_wait(response, attempt)
            }
            None => self.wait,
        }
    }

    fn next_request(&self, request: &Request) -> Result<Request> {
        if let Some(factory) = &self.body_factory {
            let mut next = without_body(request);
            *next.body_mut() = Some(factory().map_err(Error::Body)?);
            return Ok(next);
        }
        Ok(request
            .try_clone()
            .unwrap_or_else(|| without_body(request)))
    }
}

/// Reads the body to completion, bounded by `timeout`, so the connection can be reused.
async fn drain(response: &mut Response, timeout: Duration) {
    let drained = tokio::time::timeout(timeout, async {
        let mut bytes = 0usize;
        while let Ok(Some(chunk)) = response.chunk().await {
            bytes += chunk.len();
        }
        bytes
    })
    .await;

    #[cfg(feature = "tracing")]
    match drained {
        Ok(bytes) => tracing::trace!(bytes, "drained rejected response body"),
        Err(_) => tracing::debug!(
            timeout_ms = timeout.as_millis() as u64,
            "gave up draining rejected response body"
        ),
    }
    #[cfg(not(feature = "tracing"))]
    let _ = drained;
}

impl RetryHook for RetryPolicy {
    fn retry(
        &mut self,
        request: Request,
        outcome: Result<Response>,
        transport: Arc<dyn Transport>,
    ) -> BoxFuture<'_, Result<Response>> {
        Box::pin(async move { self.run(request, outcome, transport.as_ref()).await })
    }
}

impl RetryHook for &mut RetryPolicy {
    fn retry(
        &mut self,
        request: Request,
        outcome: Result<Response>,
        transport: Arc<dyn Transport>,
    ) -> BoxFuture<'_, Result<Response>> {
        (**self).retry(request, outcome, transport)
    }
}
