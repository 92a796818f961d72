//! Authenticated HTTP access to a Splunk management endpoint.
//!
//! A [`Connection`] logs in once when it is created and reuses the session key
//! for every search. Searches stream the export endpoint's CSV body straight
//! into [`parse_results`]; the body is never buffered whole.

use std::io;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use tokio::runtime::Handle;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::{parse_login_response, SessionKey};
use crate::config::ServiceConfig;
use crate::error::{Result, SearchError};
use crate::parser::{parse_results, ParseSummary, RowSink};
use crate::request::{encode_form, SearchRequest};

pub const LOGIN_PATH: &str = "services/auth/login";
pub const EXPORT_PATH: &str = "services/search/jobs/export";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

pub struct Connection {
    client: Client,
    endpoint: Url,
    username: String,
    password: String,
    session_key: Option<SessionKey>,
    auth_error: Option<String>,
    queue_capacity: usize,
    runtime: Handle,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint.as_str())
            .field("username", &self.username)
            .field("authenticated", &self.session_key.is_some())
            .finish()
    }
}

impl Connection {
    /// Build a connection and log in.
    ///
    /// A failed login is logged and remembered (see [`auth_error`](Self::auth_error))
    /// but does not fail construction unless `config.require_auth` is set.
    /// Searches on an unauthenticated connection go out without an
    /// `Authorization` header.
    ///
    /// # Errors
    /// - [`SearchError::InvalidEndpoint`] when `config.uri` is unusable.
    /// - [`SearchError::Client`] when the HTTP client cannot be built.
    /// - The login error itself when `require_auth` is set.
    pub async fn connect(config: ServiceConfig) -> Result<Self> {
        let mut connection = Self::build(&config)?;
        if let Err(e) = connection.authenticate().await {
            if config.require_auth {
                return Err(e);
            }
            warn!(
                error = %e,
                endpoint = %connection.endpoint,
                "login failed, continuing without a session key"
            );
        }
        Ok(connection)
    }

    /// Like [`connect`](Self::connect) but any login failure is an error.
    pub async fn connect_strict(config: ServiceConfig) -> Result<Self> {
        Self::connect(config.require_auth(true)).await
    }

    fn build(config: &ServiceConfig) -> Result<Self> {
        let endpoint = config.endpoint()?;
        let client = Client::builder()
            .connect_timeout(config.connect_timeout_duration())
            .read_timeout(config.read_timeout_duration())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(SearchError::Client)?;

        Ok(Self {
            client,
            endpoint,
            username: config.username.clone(),
            password: config.password.clone(),
            session_key: None,
            auth_error: None,
            queue_capacity: config.queue_capacity.max(1),
            runtime: Handle::current(),
        })
    }

    /// Log in and install the returned session key.
    ///
    /// On failure the previous key (if any) is discarded and the error is kept
    /// for [`auth_error`](Self::auth_error).
    pub async fn authenticate(&mut self) -> Result<()> {
        let result = self.login().await;
        match &result {
            Ok(key) => {
                info!(endpoint = %self.endpoint, user = %self.username, "authenticated");
                self.session_key = Some(key.clone());
                self.auth_error = None;
            }
            Err(e) => {
                self.session_key = None;
                self.auth_error = Some(e.to_string());
            }
        }
        result.map(|_| ())
    }

    async fn login(&self) -> Result<SessionKey> {
        let url = self.url(LOGIN_PATH);
        let body = encode_form([
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
        ]);

        let response = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| SearchError::Authentication {
                url: url.to_string(),
                detail: e.to_string(),
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SearchError::Authentication {
                url: url.to_string(),
                detail: e.to_string(),
            })?;

        parse_login_response(&text).map_err(|e| {
            if status.is_success() {
                e
            } else {
                SearchError::Authentication {
                    url: url.to_string(),
                    detail: format!("HTTP {}: {e}", status.as_u16()),
                }
            }
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.session_key.is_some()
    }

    /// Why the last login attempt failed, if it did.
    pub fn auth_error(&self) -> Option<&str> {
        self.auth_error.as_deref()
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Runtime the connection was created on; search workers are spawned here.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Headers for one outgoing request, built from the current session key.
    pub fn request_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
        if let Some(key) = &self.session_key {
            match HeaderValue::from_str(&key.authorization()) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    headers.insert(AUTHORIZATION, value);
                }
                Err(e) => warn!(error = %e, "session key is not a valid header value"),
            }
        }
        headers
    }

    fn url(&self, path: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.set_path(path);
        url
    }

    /// Run `request` and stream its rows into `sink`.
    ///
    /// Failures are logged and reported through the returned summary's `error`;
    /// they are never returned to the caller. The sink is dropped when the call
    /// completes.
    pub async fn execute_search<S>(
        &self,
        request: &SearchRequest,
        sink: S,
        cancel: &CancellationToken,
    ) -> ParseSummary
    where
        S: RowSink + Send + 'static,
    {
        match self.try_execute_search(request, sink, cancel).await {
            Ok((_, summary)) => summary,
            Err(e) => {
                warn!(
                    error = ?e,
                    search = %request.search(),
                    "search failed, ending the result stream early"
                );
                ParseSummary {
                    error: Some(e.to_string()),
                    ..ParseSummary::default()
                }
            }
        }
    }

    /// Run `request`, returning the sink and parse summary.
    ///
    /// Errors before the body starts streaming (connect failure, non-2xx
    /// status) are returned. A read failure after streaming began ends the row
    /// sequence and is recorded in [`ParseSummary::error`], keeping the rows
    /// already delivered.
    ///
    /// Cancelling `cancel` aborts the request if it is still waiting for a
    /// response, or ends the body stream and drops it, closing the transport.
    pub async fn try_execute_search<S>(
        &self,
        request: &SearchRequest,
        sink: S,
        cancel: &CancellationToken,
    ) -> Result<(S, ParseSummary)>
    where
        S: RowSink + Send + 'static,
    {
        let url = self.url(EXPORT_PATH);
        debug!(url = %url, search = %request.search(), "starting export");

        let send = self
            .client
            .post(url.clone())
            .headers(self.request_headers())
            .body(request.form_body())
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("search cancelled before the response arrived");
                let summary = ParseSummary {
                    stopped_early: true,
                    ..ParseSummary::default()
                };
                return Ok((sink, summary));
            }
            response = send => response.map_err(|source| SearchError::Transport {
                url: url.to_string(),
                source,
            })?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(io::Error::other))
            .take_until(cancel.clone().cancelled_owned());
        let reader = SyncIoBridge::new(StreamReader::new(Box::pin(body)));

        tokio::task::spawn_blocking(move || {
            let mut sink = sink;
            let summary = parse_results(reader, &mut sink);
            (sink, summary)
        })
        .await
        .map_err(|e| SearchError::Worker(e.to_string()))
    }
}
