use std::fmt;
use std::sync::Arc;

use reqwest::header::{HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Body, Method, Request, Response, Url};

use crate::{
    hooks::{self, Cancellable, Transport},
    CallOptions, ClientOptions, Error, HookPhase, Result,
};

#[derive(Clone)]
/// Executes HTTP calls through an injected transport, running the call's
/// hooks around the single network round trip.
///
/// Hook order is fixed: request hook, transport call, then either the retry
/// hook (which then owns the result) or the response hook. Nothing here closes
/// the body of a returned response; the caller owns it.
pub struct Client {
    transport: Arc<dyn Transport>,
    options: ClientOptions,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("transport", &"<dyn Transport>")
            .field("options", &self.options)
            .finish()
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Creates a client backed by a default `reqwest::Client`.
    pub fn new() -> Self {
        Self::with_transport(reqwest::Client::new())
    }

    /// Creates a client whose default transport honors `opts`.
    ///
    /// Fails if the underlying `reqwest::Client` cannot be built.
    pub fn with_options(opts: ClientOptions) -> Result<Self> {
        let redirect = if opts.follow_redirects {
            reqwest::redirect::Policy::default()
        } else {
            reqwest::redirect::Policy::none()
        };
        let http = reqwest::Client::builder()
            .redirect(redirect)
            .build()
            .map_err(|err| Error::Construction(format!("failed to build transport: {err}")))?;
        Ok(Self::with_transport(http).options(opts))
    }

    /// Creates a client with an injected transport.
    pub fn with_transport(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Arc::new(transport),
            options: ClientOptions::default(),
        }
    }

    /// Creates a client from environment variables.
    ///
    /// See [`ClientOptions::from_env`] for the variables read.
    pub fn from_env() -> std::result::Result<Self, String> {
        let opts = ClientOptions::from_env()?;
        Self::with_options(opts).map_err(|err| err.to_string())
    }

    /// Replaces the options without rebuilding the transport.
    pub fn options(mut self, opts: ClientOptions) -> Self {
        self.options = opts;
        self
    }

    pub fn client_options(&self) -> &ClientOptions {
        &self.options
    }

    pub async fn get(&self, uri: &str, options: CallOptions<'_>) -> Result<Response> {
        self.exec(Method::GET, uri, None, options).await
    }

    pub async fn head(&self, uri: &str, options: CallOptions<'_>) -> Result<Response> {
        self.exec(Method::HEAD, uri, None, options).await
    }

    pub async fn post(
        &self,
        uri: &str,
        body: impl Into<Body>,
        options: CallOptions<'_>,
    ) -> Result<Response> {
        self.exec(Method::POST, uri, Some(body.into()), options).await
    }

    pub async fn put(
        &self,
        uri: &str,
        body: impl Into<Body>,
        options: CallOptions<'_>,
    ) -> Result<Response> {
        self.exec(Method::PUT, uri, Some(body.into()), options).await
    }

    pub async fn patch(
        &self,
        uri: &str,
        body: impl Into<Body>,
        options: CallOptions<'_>,
    ) -> Result<Response> {
        self.exec(Method::PATCH, uri, Some(body.into()), options).await
    }

    pub async fn delete(&self, uri: &str, options: CallOptions<'_>) -> Result<Response> {
        self.exec(Method::DELETE, uri, None, options).await
    }

    /// Performs one logical call.
    ///
    /// Builds the request (default `User-Agent`, then caller headers, then
    /// caller query parameters merged into the URI), runs the request hook,
    /// sends it once, and dispatches:
    /// - retry hook set: its result is returned as is, the response hook is skipped;
    /// - response hook set: it runs once, and on failure the response is dropped;
    /// - neither: the transport result is returned unchanged.
    pub async fn exec(
        &self,
        method: Method,
        uri: &str,
        body: Option<Body>,
        options: CallOptions<'_>,
    ) -> Result<Response> {
        let CallOptions {
            headers,
            queries,
            request_hook,
            response_hook,
            retry_hook,
            timeout,
            cancel,
        } = options;

        let mut url = Url::parse(uri)
            .map_err(|err| Error::Construction(format!("invalid uri '{uri}': {err}")))?;
        merge_queries(&mut url, queries.iter());

        let mut request = Request::new(method, url);
        *request.body_mut() = body;
        *request.timeout_mut() = timeout.or_else(|| self.options.timeout());

        let user_agent = HeaderValue::from_str(&self.options.user_agent)
            .map_err(|err| Error::Construction(format!("invalid user agent: {err}")))?;
        request.headers_mut().insert(USER_AGENT, user_agent);
        for (name, value) in &headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| Error::Construction(format!("invalid header name '{name}': {err}")))?;
            let value = HeaderValue::from_str(value).map_err(|err| {
                Error::Construction(format!("invalid value for header '{name}': {err}"))
            })?;
            request.headers_mut().insert(name, value);
        }

        if let Some(mut hook) = request_hook {
            hook.on_request(&mut request).map_err(|source| {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %source, "request hook failed");
                Error::Hook {
                    phase: HookPhase::Request,
                    source,
                }
            })?;
        }

        let transport: Arc<dyn Transport> = match cancel {
            Some(token) => Arc::new(Cancellable {
                inner: Arc::clone(&self.transport),
                token,
            }),
            None => Arc::clone(&self.transport),
        };

        if self.options.trace {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                method = %request.method(),
                url = %request.url(),
                headers = ?request.headers(),
                "sending request"
            );
        }

        if let Some(mut hook) = retry_hook {
            let replay = hooks::replayable(&request);
            let outcome = transport.send(request).await;
            self.trace_outcome(&outcome);
            return hook.retry(replay, outcome, transport).await;
        }

        let sent = hooks::without_body(&request);
        let outcome = transport.send(request).await;
        self.trace_outcome(&outcome);
        let mut response = outcome?;

        if let Some(mut hook) = response_hook {
            hook.on_response(&sent, &mut response)
                .await
                .map_err(|source| {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        error = %source,
                        status = response.status().as_u16(),
                        "response hook failed, discarding response"
                    );
                    Error::Hook {
                        phase: HookPhase::Response,
                        source,
                    }
                })?;
        }

        Ok(response)
    }

    fn trace_outcome(&self, _outcome: &Result<Response>) {
        if !self.options.trace {
            return;
        }
        #[cfg(feature = "tracing")]
        match _outcome {
            Ok(response) => tracing::debug!(
                status = response.status().as_u16(),
                version = ?response.version(),
                headers = ?response.headers(),
                "received response"
            ),
            Err(err) => tracing::debug!(error = %err, "transport call failed"),
        };
    }
}

/// Caller parameters replace every same-named parameter already in `url`.
fn merge_queries<'a>(url: &mut Url, queries: impl Iterator<Item = (&'a String, &'a String)>) {
    let queries: Vec<(&String, &String)> = queries.collect();
    if queries.is_empty() {
        return;
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !queries.iter().any(|(name, _)| name.as_str() == key.as_ref()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let mut pairs = url.query_pairs_mut();
    pairs.clear();
    pairs.extend_pairs(kept);
    pairs.extend_pairs(queries);
}
