use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use balance_interest::config::AppConfig;
use balance_interest::lambda::{self, ErrorReport, LambdaRuntime};
use balance_interest::{ExitPolicy, JobSettings, job, logging};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

/// Balance Interest - applies random interest to account balances
#[derive(Parser)]
#[command(name = "balance-interest")]
#[command(about = "Applies random interest to account balances over Consul Connect")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Exit with a non-zero status when the run fails
    #[arg(long)]
    fail_on_error: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply interest once, or serve invocations under the Lambda runtime
    Run,
    /// Validate configuration and exit
    Check,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let hosted = lambda::is_hosted();

    let init_runtime = if hosted {
        match LambdaRuntime::from_env() {
            Ok(runtime) => Some(runtime),
            Err(e) => {
                eprintln!("failed to reach the Lambda runtime API: {e}");
                None
            }
        }
    } else {
        None
    };

    let mut config = checked(init_runtime.as_ref(), AppConfig::load(cli.config.as_deref())).await?;
    if cli.fail_on_error {
        config.exit_policy = ExitPolicy::FailProcess;
    }

    let settings = checked(
        init_runtime.as_ref(),
        logging::init_logging(&config.logging, cli.verbose, hosted)
            .and_then(|()| config.job_settings()),
    )
    .await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Check => {
            check_config(&config)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run if hosted => serve_lambda(settings).await,
        Commands::Run => Ok(run_interactive(&settings, config.exit_policy).await),
    }
}

fn check_config(config: &AppConfig) -> Result<()> {
    tracing::info!("Checking configuration...");
    println!("Configuration is valid");
    println!("registry: {}", config.registry_address());
    println!("target service: {}", config.redis_service_name);
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

async fn run_interactive(settings: &JobSettings, policy: ExitPolicy) -> ExitCode {
    let interrupt = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    match job::run_until(settings, interrupt).await {
        Ok(outcome) => {
            println!("{}", outcome.message);
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("[ERROR] {e}");
            ExitCode::from(policy.failure_exit_code())
        }
    }
}

async fn serve_lambda(settings: JobSettings) -> Result<ExitCode> {
    let runtime = LambdaRuntime::from_env()?;
    tracing::info!(service = %settings.service_name, "serving Lambda invocations");

    let settings = &settings;
    runtime
        .serve(move |_invocation| {
            async move {
                job::run(settings, CancellationToken::new())
                    .await
                    .map(|outcome| outcome.message.to_owned())
                    .map_err(|e| ErrorReport::new(e.error_type(), e.to_string()))
            }
        })
        .await?;
    Ok(ExitCode::SUCCESS)
}

async fn checked<T>(runtime: Option<&LambdaRuntime>, result: Result<T>) -> Result<T> {
    match runtime {
        Some(runtime) => runtime.check_init(result).await,
        None => result,
    }
}
