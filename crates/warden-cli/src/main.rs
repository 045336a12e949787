use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use warden_cli::cli::{Cli, Command};
use warden_cli::commands::{self, Decision};
use warden_cli::config::{AppConfig, LogFormat};

fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log.format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr);
            registry.with(fmt_layer).init();
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr);
            registry.with(fmt_layer).init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;
    init_logging(&config);

    let policy_path = cli.policy.as_deref().unwrap_or(&config.policy.path);
    let document = commands::load_policy(policy_path)?;
    tracing::info!(
        policy = %policy_path.display(),
        entities = document.entities.len(),
        checks = document.checks.len(),
        "policy loaded"
    );
    let executor = commands::build_executor(document);

    match cli.command {
        Command::Validate => {
            let entities = commands::validate(&executor)?;
            println!("ok: {} entity type(s) compiled", entities.len());
            for entity in entities {
                println!("  {entity}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Explain { entity } => {
            print!("{}", commands::explain(&executor, &entity)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Check(args) => {
            let decision = commands::check(&executor, &args, config.deadline()).await?;
            let code = match &decision {
                Decision::Allowed { representation } => {
                    println!("ALLOW");
                    if let Some(representation) = representation {
                        println!("{}", serde_json::to_string_pretty(representation)?);
                    }
                    ExitCode::SUCCESS
                }
                Decision::Filtered => {
                    println!("FILTERED");
                    ExitCode::SUCCESS
                }
                Decision::Denied(reason) => {
                    println!("DENY: {reason}");
                    ExitCode::FAILURE
                }
            };
            if args.metrics {
                print!("{}", executor.metrics().render_prometheus());
            }
            Ok(code)
        }
    }
}
