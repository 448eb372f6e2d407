use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::hooks::{RequestHook, ResponseHook, RetryHook};

/// Default `User-Agent` sent with every request unless overridden.
pub const DEFAULT_USER_AGENT: &str = concat!("resilient-http/", env!("CARGO_PKG_VERSION"));

/// Configures the executor itself: identification, timeouts, redirects and tracing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientOptions {
    /// Value of the `User-Agent` header set on every request.
    pub user_agent: String,
    /// Per-request timeout in milliseconds, unless a call sets its own.
    pub timeout_ms: Option<u64>,
    /// Follow redirects. Only used when the client builds its own transport.
    pub follow_redirects: bool,
    /// Emit per-call diagnostic events through `tracing`.
    pub trace: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            timeout_ms: None,
            follow_redirects: true,
            trace: false,
        }
    }
}

impl ClientOptions {
    /// Reads options from the environment, falling back to defaults.
    ///
    /// Reads:
    /// - `RESILIENT_HTTP_USER_AGENT`: user agent string
    /// - `RESILIENT_HTTP_TIMEOUT_MS`: per-request timeout in milliseconds
    /// - `RESILIENT_HTTP_TRACE`: `true`/`false`, `1`/`0`
    pub fn from_env() -> std::result::Result<Self, String> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> std::result::Result<Self, String> {
        let mut options = Self::default();

        if let Some(user_agent) = var("RESILIENT_HTTP_USER_AGENT") {
            if user_agent.trim().is_empty() {
                return Err("RESILIENT_HTTP_USER_AGENT is set but empty".to_owned());
            }
            options.user_agent = user_agent;
        }

        if let Some(timeout) = var("RESILIENT_HTTP_TIMEOUT_MS") {
            let timeout_ms = timeout.trim().parse::<u64>().map_err(|_| {
                format!("RESILIENT_HTTP_TIMEOUT_MS must be an integer, got '{timeout}'")
            })?;
            options.timeout_ms = Some(timeout_ms);
        }

        if let Some(trace) = var("RESILIENT_HTTP_TRACE") {
            options.trace = match trace.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                other => {
                    return Err(format!(
                        "RESILIENT_HTTP_TRACE must be a boolean, got '{other}'"
                    ))
                }
            };
        }

        Ok(options)
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Per-call configuration for [`crate::Client::exec`].
///
/// At most one post-processing hook runs per call. If both a retry hook and a
/// response hook are set, the retry hook takes over the remaining flow and the
/// response hook is never invoked.
#[derive(Default)]
pub struct CallOptions<'a> {
    pub(crate) headers: BTreeMap<String, String>,
    pub(crate) queries: BTreeMap<String, String>,
    pub(crate) request_hook: Option<Box<dyn RequestHook + 'a>>,
    pub(crate) response_hook: Option<Box<dyn ResponseHook + 'a>>,
    pub(crate) retry_hook: Option<Box<dyn RetryHook + 'a>>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cancel: Option<CancellationToken>,
}

impl<'a> CallOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one header. Caller headers win over the client defaults.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Replaces the whole caller header set.
    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers = headers
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .collect();
        self
    }

    /// Adds one query parameter, overwriting a same-named one already in the URI.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.queries.insert(key.into(), value.into());
        self
    }

    /// Replaces the whole caller query set.
    pub fn queries<I, K, V>(mut self, queries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.queries = queries
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self
    }

    /// Runs on the fully built request before it is sent.
    pub fn request_hook(mut self, hook: impl RequestHook + 'a) -> Self {
        self.request_hook = Some(Box::new(hook));
        self
    }

    /// Runs once on the response. Ignored when a retry hook is also set.
    pub fn response_hook(mut self, hook: impl ResponseHook + 'a) -> Self {
        self.response_hook = Some(Box::new(hook));
        self
    }

    /// Takes over the call after the first transport round trip.
    pub fn retry_hook(mut self, hook: impl RetryHook + 'a) -> Self {
        self.retry_hook = Some(Box::new(hook));
        self
    }

    /// Per-request timeout for every transport call of this call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Cancels in-flight transport calls of this call when the token fires.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl fmt::Debug for CallOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("headers", &self.headers)
            .field("queries", &self.queries)
            .field("request_hook", &self.request_hook.is_some())
            .field("response_hook", &self.response_hook.is_some())
            .field("retry_hook", &self.retry_hook.is_some())
            .field("timeout", &self.timeout)
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::{CallOptions, ClientOptions, DEFAULT_USER_AGENT};
    use crate::BoxError;

    fn from_vars(vars: &[(&str, &str)]) -> Result<ClientOptions, String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
            .collect();
        ClientOptions::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_identify_the_crate() {
        let options = ClientOptions::default();
        assert_eq!(options.user_agent, DEFAULT_USER_AGENT);
        assert!(options.user_agent.starts_with("resilient-http/"));
        assert!(options.follow_redirects);
        assert!(options.timeout().is_none());
    }

    #[test]
    fn env_overrides_defaults() {
        let options = from_vars(&[
            ("RESILIENT_HTTP_USER_AGENT", "svc/3"),
            ("RESILIENT_HTTP_TIMEOUT_MS", " 1500 "),
            ("RESILIENT_HTTP_TRACE", "ON"),
        ])
        .expect("valid environment");
        assert_eq!(options.user_agent, "svc/3");
        assert_eq!(options.timeout(), Some(Duration::from_millis(1500)));
        assert!(options.trace);

        assert_eq!(from_vars(&[]).expect("empty environment"), ClientOptions::default());
    }

    #[test]
    fn malformed_env_values_are_rejected() {
        let err = from_vars(&[("RESILIENT_HTTP_TIMEOUT_MS", "soon")]).expect_err("not a number");
        assert!(err.contains("RESILIENT_HTTP_TIMEOUT_MS"));
        assert!(err.contains("'soon'"));

        assert!(from_vars(&[("RESILIENT_HTTP_TIMEOUT_MS", "-5")]).is_err());

        let err = from_vars(&[("RESILIENT_HTTP_TRACE", "maybe")]).expect_err("not a boolean");
        assert!(err.contains("RESILIENT_HTTP_TRACE"));
        assert!(err.contains("'maybe'"));

        assert!(from_vars(&[("RESILIENT_HTTP_USER_AGENT", "  ")]).is_err());
    }

    #[test]
    fn headers_replace_previous_header_set() {
        let options = CallOptions::new()
            .header("X-One", "1")
            .headers([("X-Two", "2")])
            .header("X-Three", "3");
        assert_eq!(options.headers.len(), 2);
        assert!(!options.headers.contains_key("X-One"));
        assert_eq!(options.headers["X-Two"], "2");
    }

    #[test]
    fn query_overwrites_same_key() {
        let options = CallOptions::new().query("page", "1").query("page", "2");
        assert_eq!(options.queries["page"], "2");
    }

    #[test]
    fn debug_reports_hook_presence_only() {
        let options = CallOptions::new()
            .request_hook(|_: &mut reqwest::Request| -> Result<(), BoxError> { Ok(()) });
        let debug = format!("{options:?}");
        assert!(debug.contains("request_hook: true"));
        assert!(debug.contains("retry_hook: false"));
    }
}
