//! One run of the interest job: identity, dial, liveness check, increments.

use std::fmt;
use std::time::Duration;

use mesh_connect::{
    DialContext, MeshDialer, MeshError, MeshService, RegistryClient, SecretString,
    dial_with_deadline,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use resp_client::{RespConnection, RespError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::accounts::AccountId;
use crate::interest::{BatchReport, InterestPolicy, apply_interest};

/// Result text of every run that reached the update phase.
pub const SUCCESS_MESSAGE: &str = "Account balances updated successfully";

/// Inputs of one run, resolved from configuration.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub registry_address: String,
    pub registry_token: Option<SecretString>,
    pub registry_timeout: Duration,
    pub service_name: String,
    pub target_service: String,
    pub accounts: Vec<AccountId>,
    pub policy: InterestPolicy,
    pub dial_timeout: Duration,
}

/// Why the store could not be reached.
#[derive(Error, Debug)]
pub enum ConnectivityFailure {
    #[error(transparent)]
    Dial(#[from] MeshError),

    #[error("PING failed: {0}")]
    Ping(#[from] RespError),
}

/// Fatal run errors. Each one aborts the run before any balance changes.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("failed to create registry client: {0}")]
    RegistryClient(#[source] MeshError),

    #[error("failed to register mesh service '{service}': {source}")]
    ServiceRegistration {
        service: String,
        #[source]
        source: MeshError,
    },

    #[error("failed to connect to '{service}': {source}")]
    Connectivity {
        service: String,
        #[source]
        source: ConnectivityFailure,
    },

    #[error("run interrupted before completion")]
    Interrupted,
}

impl JobError {
    fn connectivity(service: &str, source: impl Into<ConnectivityFailure>) -> Self {
        Self::Connectivity {
            service: service.to_owned(),
            source: source.into(),
        }
    }

    /// Stable error class name, reported as the Lambda `errorType`.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::RegistryClient(_) => "RegistryClientError",
            Self::ServiceRegistration { .. } => "ServiceRegistrationError",
            Self::Connectivity { .. } => "ConnectivityError",
            Self::Interrupted => "InterruptedError",
        }
    }
}

/// Where a run is. `Done` is reached with either result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Connecting,
    Applying,
    Done,
}

impl RunPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Applying => "applying",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successful run: the fixed status text plus what happened per account.
#[derive(Debug)]
pub struct RunOutcome {
    pub message: &'static str,
    pub report: BatchReport,
}

/// Execute one run against the registry at `settings.registry_address`.
///
/// The mesh identity is released before returning on every path.
///
/// # Errors
/// See [`JobError`]; per-account failures are not errors and are recorded in
/// the returned report.
pub async fn run(settings: &JobSettings, cancel: CancellationToken) -> Result<RunOutcome, JobError> {
    let span = tracing::info_span!(
        "balance_interest_run",
        service = %settings.service_name,
        target = %settings.target_service,
        registry = %settings.registry_address,
        phase = RunPhase::Connecting.as_str(),
    );

    async {
        let registry = RegistryClient::new(
            &settings.registry_address,
            settings.registry_token.clone(),
            settings.registry_timeout,
        )
        .map_err(JobError::RegistryClient)?;

        let service = MeshService::register(registry, &settings.service_name)
            .await
            .map_err(|source| JobError::ServiceRegistration {
                service: settings.service_name.clone(),
                source,
            })?;

        let ctx = DialContext::with_cancel(settings.dial_timeout, cancel);
        let mut rng = StdRng::from_rng(&mut rand::rng());
        let result = execute(settings, &service, &ctx, &mut rng).await;
        service.close();
        result
    }
    .instrument(span)
    .await
}

/// Execute one run, abandoning it as soon as `shutdown` resolves.
///
/// Dropping the run future releases the mesh identity and the store
/// connection, so an interrupt at any phase leaves nothing held.
///
/// # Errors
/// [`JobError::Interrupted`] when `shutdown` resolves first, otherwise as
/// [`run`].
pub async fn run_until<F>(settings: &JobSettings, shutdown: F) -> Result<RunOutcome, JobError>
where
    F: Future<Output = ()>,
{
    tokio::select! {
        biased;
        result = run(settings, CancellationToken::new()) => result,
        () = shutdown => {
            tracing::warn!(service = %settings.service_name, "run interrupted");
            Err(JobError::Interrupted)
        }
    }
}

/// Run the dial and update phases through an arbitrary dialer.
///
/// # Errors
/// Returns [`JobError::Connectivity`] if the dial or the `PING` fails.
pub async fn run_with_dialer<R>(
    settings: &JobSettings,
    dialer: &dyn MeshDialer,
    ctx: &DialContext,
    rng: &mut R,
) -> Result<RunOutcome, JobError>
where
    R: Rng + ?Sized,
{
    let span = tracing::info_span!(
        "balance_interest_run",
        service = %settings.service_name,
        target = %settings.target_service,
        phase = RunPhase::Connecting.as_str(),
    );
    execute(settings, dialer, ctx, rng).instrument(span).await
}

async fn execute<R>(
    settings: &JobSettings,
    dialer: &dyn MeshDialer,
    ctx: &DialContext,
    rng: &mut R,
) -> Result<RunOutcome, JobError>
where
    R: Rng + ?Sized,
{
    let target = settings.target_service.as_str();
    let span = tracing::Span::current();

    let result: Result<RunOutcome, JobError> = async {
        let stream = dial_with_deadline(dialer, target, ctx)
            .await
            .map_err(|e| JobError::connectivity(target, e))?;
        let mut store = RespConnection::new(stream);
        store
            .ping()
            .await
            .map_err(|e| JobError::connectivity(target, e))?;
        tracing::info!(target_service = target, "store reachable");

        span.record("phase", RunPhase::Applying.as_str());
        let report = apply_interest(&mut store, &settings.accounts, settings.policy, rng).await;
        report.log_summary();

        Ok(RunOutcome {
            message: SUCCESS_MESSAGE,
            report,
        })
    }
    .await;

    span.record("phase", RunPhase::Done.as_str());
    if let Err(e) = &result {
        tracing::error!(error = %e, error_type = e.error_type(), "run aborted");
    }
    result
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn error_types_are_stable() {
        let registry = JobError::RegistryClient(MeshError::InvalidAddress {
            address: ":8500".to_owned(),
            reason: "empty host".to_owned(),
        });
        assert_eq!(registry.error_type(), "RegistryClientError");

        let connectivity = JobError::connectivity("redis", RespError::ConnectionClosed);
        assert_eq!(connectivity.error_type(), "ConnectivityError");
        assert!(connectivity.to_string().contains("'redis'"));

        assert_eq!(JobError::Interrupted.error_type(), "InterruptedError");
    }

    #[test]
    fn phases_render_lowercase() {
        assert_eq!(RunPhase::Applying.to_string(), "applying");
    }

    fn settings(registry_address: &str) -> JobSettings {
        JobSettings {
            registry_address: registry_address.to_owned(),
            registry_token: None,
            registry_timeout: Duration::from_secs(2),
            service_name: "balance-interest-lambda".to_owned(),
            target_service: "redis".to_owned(),
            accounts: vec![AccountId::new(1)],
            policy: InterestPolicy::new(40).unwrap(),
            dial_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn malformed_registry_address_fails_before_network() {
        let err = run(&settings("not a host:8500"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::RegistryClient(_)), "{err}");
    }

    #[tokio::test]
    async fn unreachable_registry_fails_registration() {
        let err = run(&settings("127.0.0.1:1"), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "ServiceRegistrationError");
    }
}
