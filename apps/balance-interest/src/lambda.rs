//! Minimal client for the AWS Lambda Runtime API.
//!
//! The job ignores event payloads, so an invocation is just its request id.
//! Every request goes to `http://$AWS_LAMBDA_RUNTIME_API/2018-06-01/...`.

use std::future::Future;

use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::Instrument;
use url::Url;

const API_VERSION: &str = "2018-06-01";
const REQUEST_ID_HEADER: &str = "Lambda-Runtime-Aws-Request-Id";
const TRACE_ID_HEADER: &str = "Lambda-Runtime-Trace-Id";
const ERROR_TYPE_HEADER: &str = "Lambda-Runtime-Function-Error-Type";
const INIT_ERROR_TYPE: &str = "ConfigError";

/// Set by the Lambda environment for every function process.
pub const TASK_ROOT_VAR: &str = "LAMBDA_TASK_ROOT";
/// `host:port` of the Runtime API.
pub const RUNTIME_API_VAR: &str = "AWS_LAMBDA_RUNTIME_API";

#[derive(Error, Debug)]
pub enum LambdaError {
    #[error("{RUNTIME_API_VAR} is not set")]
    MissingApi,

    #[error("invalid runtime API address '{address}': {reason}")]
    InvalidApi { address: String, reason: String },

    #[error("runtime API request {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("runtime API returned HTTP {status} for {path}")]
    Status { path: String, status: StatusCode },

    #[error("invocation is missing the {REQUEST_ID_HEADER} header")]
    MissingRequestId,
}

/// Whether this process is hosted by the Lambda runtime.
#[must_use]
pub fn is_hosted() -> bool {
    std::env::var_os(TASK_ROOT_VAR).is_some()
}

/// Body of the `/error` endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub error_message: String,
    pub error_type: String,
}

impl ErrorReport {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_message: error_message.into(),
            error_type: error_type.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub request_id: String,
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LambdaRuntime {
    http: reqwest::Client,
    base: Url,
}

impl LambdaRuntime {
    /// # Errors
    /// Returns [`LambdaError::InvalidApi`] if `address` is not a `host:port`.
    pub fn new(address: &str) -> Result<Self, LambdaError> {
        let invalid = |reason: String| LambdaError::InvalidApi {
            address: address.to_owned(),
            reason,
        };
        if address.trim().is_empty() {
            return Err(invalid("empty address".to_owned()));
        }
        let base = Url::parse(&format!("http://{address}/{API_VERSION}/"))
            .map_err(|e| invalid(e.to_string()))?;
        if base.host_str().is_none_or(str::is_empty) {
            return Err(invalid("empty host".to_owned()));
        }
        // Long polling on `next` must not be cut short, so no client timeout.
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| invalid(e.to_string()))?;
        Ok(Self { http, base })
    }

    /// # Errors
    /// Returns [`LambdaError::MissingApi`] outside the Lambda environment.
    pub fn from_env() -> Result<Self, LambdaError> {
        let address = std::env::var(RUNTIME_API_VAR).map_err(|_| LambdaError::MissingApi)?;
        Self::new(&address)
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Block until the next event arrives.
    ///
    /// # Errors
    /// Transport failure, non-2xx status, or a response without request id.
    pub async fn next_invocation(&self) -> Result<Invocation, LambdaError> {
        let url = self.endpoint(&["runtime", "invocation", "next"]);
        let path = url.path().to_owned();
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| LambdaError::Transport {
                path: path.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(LambdaError::Status { path, status });
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        let request_id = header(REQUEST_ID_HEADER).ok_or(LambdaError::MissingRequestId)?;
        let trace_id = header(TRACE_ID_HEADER);
        Ok(Invocation {
            request_id,
            trace_id,
        })
    }

    /// Report the handler result as a JSON string.
    ///
    /// # Errors
    /// Transport failure or non-2xx status.
    pub async fn respond(&self, request_id: &str, message: &str) -> Result<(), LambdaError> {
        let url = self.endpoint(&["runtime", "invocation", request_id, "response"]);
        self.post(url, message, None).await
    }

    /// Report a handler failure for one invocation.
    ///
    /// # Errors
    /// Transport failure or non-2xx status.
    pub async fn report_error(
        &self,
        request_id: &str,
        report: &ErrorReport,
    ) -> Result<(), LambdaError> {
        let url = self.endpoint(&["runtime", "invocation", request_id, "error"]);
        self.post(url, report, Some(report.error_type.as_str())).await
    }

    /// Report a failure before the first invocation was fetched.
    ///
    /// # Errors
    /// Transport failure or non-2xx status.
    pub async fn report_init_error(&self, report: &ErrorReport) -> Result<(), LambdaError> {
        let url = self.endpoint(&["runtime", "init", "error"]);
        self.post(url, report, Some(report.error_type.as_str())).await
    }

    /// Pass a startup result through, posting a failure to the init error
    /// endpoint first.
    ///
    /// # Errors
    /// Returns `result` unchanged; a failed post is only written to stderr,
    /// since logging may not be initialized yet.
    pub async fn check_init<T>(&self, result: anyhow::Result<T>) -> anyhow::Result<T> {
        if let Err(e) = &result {
            let report = ErrorReport::new(INIT_ERROR_TYPE, format!("{e:#}"));
            if let Err(post) = self.report_init_error(&report).await {
                eprintln!("failed to report init error: {post}");
            }
        }
        result
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        url: Url,
        body: &T,
        error_type: Option<&str>,
    ) -> Result<(), LambdaError> {
        let path = url.path().to_owned();
        let mut request = self.http.post(url).json(body);
        if let Some(error_type) = error_type {
            request = request.header(ERROR_TYPE_HEADER, error_type);
        }
        let response = request
            .send()
            .await
            .map_err(|source| LambdaError::Transport {
                path: path.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(LambdaError::Status { path, status });
        }
        Ok(())
    }

    /// Fetch one invocation, run `handler`, and report its result.
    ///
    /// # Errors
    /// Only Runtime API failures; handler failures are reported to the API.
    pub async fn handle_next<F, Fut>(&self, handler: F) -> Result<(), LambdaError>
    where
        F: FnOnce(Invocation) -> Fut,
        Fut: Future<Output = Result<String, ErrorReport>>,
    {
        let invocation = self.next_invocation().await?;
        let request_id = invocation.request_id.clone();
        let span = tracing::info_span!(
            "lambda_invocation",
            request_id = %request_id,
            trace_id = invocation.trace_id.as_deref().unwrap_or_default(),
        );

        async {
            match handler(invocation).await {
                Ok(message) => {
                    tracing::info!("invocation succeeded");
                    self.respond(&request_id, &message).await
                }
                Err(report) => {
                    tracing::error!(
                        error_type = %report.error_type,
                        error = %report.error_message,
                        "invocation failed"
                    );
                    self.report_error(&request_id, &report).await
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Serve invocations until the Runtime API fails.
    ///
    /// # Errors
    /// The first Runtime API failure; the runtime restarts the process.
    pub async fn serve<F, Fut>(&self, mut handler: F) -> Result<(), LambdaError>
    where
        F: FnMut(Invocation) -> Fut,
        Fut: Future<Output = Result<String, ErrorReport>>,
    {
        loop {
            self.handle_next(&mut handler).await?;
        }
    }
}
