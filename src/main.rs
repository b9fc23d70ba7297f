use std::sync::Arc;

use clap::{Parser, Subcommand};
use docker_authz::authz::{Decision, Enforcer, Request};
use docker_authz::errors::AppError;
use docker_authz::settings::Settings;
use docker_authz::web;
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "docker-authz",
    version,
    about = "Docker authorization plugin backed by a declarative access-control model"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the plugin API (default)
    Serve,
    /// Evaluate one request against the configured model and policy
    Check {
        /// Resource path, e.g. /v1.41/containers/json
        object: String,
        /// HTTP method, e.g. GET
        action: String,
        /// Subject, for models that declare `sub`
        #[arg(long, default_value = "")]
        subject: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging goes to stderr so `check` output stays machine readable
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let settings = Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    // model and policy errors are fatal at startup
    let enforcer = Arc::new(Enforcer::from_files(
        &settings.policy.model_path,
        &settings.policy.policy_path,
        settings.policy.max_hierarchy_level,
    )?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            if settings.policy.reload_on_hangup {
                web::spawn_reload_on_hangup(enforcer.clone(), settings.policy.policy_path.clone())
                    .into_diagnostic()?;
            }
            web::serve(&settings, enforcer).await
        }
        Command::Check {
            object,
            action,
            subject,
        } => {
            let request = Request::new(subject, object, action);
            let decision = enforcer.explain_request(&request).unwrap_or_else(|e| {
                tracing::error!(error = %e, "Enforce error");
                Decision::deny(format!("Authorization error: {e}"))
            });
            let json = serde_json::to_string_pretty(&decision).map_err(AppError::from)?;
            println!("{json}");
            if !decision.allowed {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
