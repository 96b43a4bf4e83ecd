use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bulwark::config::{Settings, StoreBackend, StoreConfig};
use bulwark::guard::{Operation, RateLimitGuard, RateLimitRejection, RequestContext};
use bulwark::ratelimit::{RateLimitResult, Scope, SlidingWindowLimiter};
use bulwark::store;

/// Inspect and exercise Bulwark rate limits against the shared store.
#[derive(Debug, Parser)]
#[command(name = "bulwark", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured store backend
    #[arg(long, global = true, value_enum)]
    backend: Option<BackendArg>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OperationArg {
    CreateInvitation,
    AcceptInvitation,
    CreateTenant,
    JoinTenant,
}

impl From<OperationArg> for Operation {
    fn from(arg: OperationArg) -> Self {
        match arg {
            OperationArg::CreateInvitation => Operation::CreateInvitation,
            OperationArg::AcceptInvitation => Operation::AcceptInvitation,
            OperationArg::CreateTenant => Operation::CreateTenant,
            OperationArg::JoinTenant => Operation::JoinTenant,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record attempts against a scope key
    Check {
        #[arg(long)]
        scope: Scope,
        #[arg(long)]
        id: String,
        #[arg(long, default_value_t = 1)]
        times: u32,
    },
    /// Show a scope key's state without recording an attempt
    Status {
        #[arg(long)]
        scope: Scope,
        #[arg(long)]
        id: String,
    },
    /// Clear a scope key
    Reset {
        #[arg(long)]
        scope: Scope,
        #[arg(long)]
        id: String,
    },
    /// Fire concurrent checks at one key and report how many got through
    Burst {
        #[arg(long)]
        scope: Scope,
        #[arg(long)]
        id: String,
        #[arg(long, default_value_t = 10)]
        concurrency: usize,
    },
    /// Run an operation through the guard
    Guard {
        #[arg(value_enum)]
        operation: OperationArg,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long)]
        ip: Option<IpAddr>,
        #[arg(long)]
        email: Option<String>,
    },
    /// Print the resolved limits for every scope
    Policy,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(backend) = cli.backend {
        settings.config.store.backend = match backend {
            BackendArg::Memory => StoreBackend::Memory,
            BackendArg::Redis => StoreBackend::Redis,
        };
    }
    info!(backend = ?settings.config.store.backend, "Configuration loaded");

    let json = cli.json;
    let policy = &settings.policy;

    match cli.command {
        Command::Policy => print_policy(&settings, json)?,
        Command::Check { scope, id, times } => {
            let limiter = connect_limiter(&settings.config.store).await?;
            let config = policy.config(scope);
            let key = scope.key(config, &id);
            for _ in 0..times {
                let result = limiter.check_and_consume(&key, config).await;
                print_result(scope, &result, json)?;
            }
        }
        Command::Status { scope, id } => {
            let limiter = connect_limiter(&settings.config.store).await?;
            let config = policy.config(scope);
            let result = limiter.status(&scope.key(config, &id), config).await;
            print_result(scope, &result, json)?;
        }
        Command::Reset { scope, id } => {
            let limiter = connect_limiter(&settings.config.store).await?;
            let config = policy.config(scope);
            let key = scope.key(config, &id);
            limiter.reset(&key).await;
            println!("reset {}", key);
        }
        Command::Burst {
            scope,
            id,
            concurrency,
        } => {
            let limiter = connect_limiter(&settings.config.store).await?;
            let config = policy.config(scope);
            let key = scope.key(config, &id);
            let results = join_all(
                (0..concurrency).map(|_| limiter.check_and_consume(&key, config)),
            )
            .await;
            let admitted = results.iter().filter(|r| r.allowed).count();

            if json {
                let summary = serde_json::json!({
                    "scope": scope,
                    "key": key.as_str(),
                    "attempts": concurrency,
                    "admitted": admitted,
                    "limit": config.max_requests(),
                });
                println!("{}", serde_json::to_string(&summary)?);
            } else {
                println!(
                    "{}: admitted {} of {} concurrent attempts (limit {})",
                    key,
                    admitted,
                    concurrency,
                    config.max_requests()
                );
            }
        }
        Command::Guard {
            operation,
            user,
            tenant,
            ip,
            email,
        } => {
            let guard = RateLimitGuard::new(
                connect_limiter(&settings.config.store).await?,
                Arc::new(policy.clone()),
                settings.config.guard.clone(),
            );
            let ctx = RequestContext {
                user_id: user,
                tenant_id: tenant,
                ip,
                email,
            };

            match guard.check(operation.into(), &ctx).await {
                Ok(admission) => {
                    for outcome in &admission.evaluated {
                        print_result(outcome.scope, &outcome.result, json)?;
                    }
                    if let Some(headers) = admission.headers() {
                        for (name, value) in headers.to_pairs() {
                            println!("{}: {}", name, value);
                        }
                    }
                }
                Err(rejection) => {
                    println!("{} {}", RateLimitRejection::STATUS_CODE, rejection);
                    for (name, value) in rejection.headers.to_pairs() {
                        println!("{}: {}", name, value);
                    }
                    return Ok(ExitCode::from(2));
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn connect_limiter(config: &StoreConfig) -> anyhow::Result<SlidingWindowLimiter> {
    let store = store::connect(config).await?;
    Ok(SlidingWindowLimiter::new(store))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_result(scope: Scope, result: &RateLimitResult, json: bool) -> anyhow::Result<()> {
    if json {
        let line = serde_json::json!({ "scope": scope, "result": result });
        println!("{}", serde_json::to_string(&line)?);
    } else {
        println!(
            "{}: allowed={} remaining={} total_hits={} reset_time={}",
            scope, result.allowed, result.remaining, result.total_hits, result.reset_time
        );
    }
    Ok(())
}

fn print_policy(settings: &Settings, json: bool) -> anyhow::Result<()> {
    for (scope, config) in settings.policy.iter() {
        if json {
            let line = serde_json::json!({ "scope": scope, "config": config });
            println!("{}", serde_json::to_string(&line)?);
        } else {
            println!(
                "{:<22} window_ms={:<10} max_requests={:<4} prefix={}",
                scope.name(),
                config.window_ms(),
                config.max_requests(),
                config.key_prefix()
            );
        }
    }
    Ok(())
}
