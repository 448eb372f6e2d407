//! `resilient-http` executes outbound HTTP calls with pluggable hooks:
//! - [`Client::exec`] builds the request, runs a [`RequestHook`], performs one
//!   round trip through a [`Transport`], then hands the outcome to either a
//!   [`RetryHook`] or a [`ResponseHook`]
//! - [`RetryPolicy`] is a bounded retry loop driven by [`Backoff`]
//!   (exponential backoff with jitter, `Retry-After` aware)
//! - [`ResponseProcessor`] decompresses and auto-parses response bodies

mod backoff;
mod client;
mod error;
mod hooks;
mod options;
mod response;
mod retry;

pub use backoff::{parse_retry_after, Backoff, Jitter, DEFAULT_MAX_WAIT, DEFAULT_MIN_WAIT};
pub use client::Client;
pub use error::{BoxError, Error, HookPhase};
pub use hooks::{BoxFuture, RequestHook, ResponseHook, RetryHook, Transport};
pub use options::{CallOptions, ClientOptions, DEFAULT_USER_AGENT};
pub use response::{Decompressor, RawBody, ResponseProcessor, DEFAULT_MAX_BODY_SIZE};
pub use retry::{
    accept_success, BodyFactory, Condition, RetryPolicy, RetryPollError, DEFAULT_DRAIN_TIMEOUT,
    DEFAULT_POLL_LIMIT, DEFAULT_WAIT,
};

pub use reqwest::{Body, Method, Request, Response, StatusCode, Url};
pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, Error>;
