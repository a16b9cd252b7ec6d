use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process;

mod config;
mod observability;

#[derive(Parser)]
#[command(name = "ota", about = "Over-the-air bundle update distribution")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve the update, management and blob APIs
    Serve(ConfigArgs),
    /// Load and validate a config file, then exit
    ValidateConfig(ConfigArgs),
    /// List the metrics this service emits
    DescribeMetrics,
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long)]
    config: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        CliCommand::Serve(args) => serve(args),
        CliCommand::ValidateConfig(args) => match config::Config::from_file(&args.config) {
            Ok(_) => println!("{} is valid", args.config.display()),
            Err(err) => {
                eprintln!("{}: {err}", args.config.display());
                process::exit(1);
            }
        },
        CliCommand::DescribeMetrics => {
            print!(
                "{}",
                shared::metrics_defs::describe(distribution::metrics_defs::ALL_METRICS)
            );
        }
    }
}

fn serve(args: ConfigArgs) {
    let config = match config::Config::from_file(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}: {err}", args.config.display());
            process::exit(1);
        }
    };

    // Dropping the guard at the end of main flushes pending sentry events.
    let _guard = match observability::init(&config.common) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("could not initialize logging and metrics: {err}");
            process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("could not start runtime: {err}");
            process::exit(1);
        }
    };

    let result = runtime.block_on(distribution::run(config.distribution, shutdown_signal()));
    if let Err(err) = result {
        tracing::error!(error = %err, "server failed");
        process::exit(1);
    }
    tracing::info!("shut down");
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
