//! entrypoint for warren-cli

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use clap::{Parser, Subcommand};
use warren_core::error::BoxError;

pub mod cmd;
pub mod config;
pub mod error;
pub mod trace;

use cmd::{client_http, client_nat, server};

#[cfg(unix)]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[derive(Debug, Parser)]
#[command(name = "warren")]
#[command(bin_name = "warren")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmds: CliCommands,
}

#[derive(Debug, Subcommand)]
enum CliCommands {
    /// Run the inbound tunnel server.
    Server(server::ServerArgs),
    /// Run the HTTP CONNECT / forward-proxy client ingress.
    ClientHttp(client_http::ClientHttpArgs),
    /// Run the Linux NAT client ingress.
    ClientNat(client_nat::ClientNatArgs),
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    let log_level = match &cli.cmds {
        CliCommands::Server(args) => args.common.resolve(),
        CliCommands::ClientHttp(args) => args.common.resolve(),
        CliCommands::ClientNat(args) => args.common.resolve(),
    }
    .map(|cfg| cfg.log_level)
    .unwrap_or_else(|_| "info".to_owned());
    trace::init_tracing(trace::level_from_str(&log_level));

    #[allow(clippy::exit)]
    match match cli.cmds {
        CliCommands::Server(args) => server::run(args).await,
        CliCommands::ClientHttp(args) => client_http::run(args).await,
        CliCommands::ClientNat(args) => client_nat::run(args).await,
    } {
        Ok(()) => Ok(()),
        Err(err) => {
            if let Some(err) = err.downcast_ref::<error::ErrorWithExitCode>() {
                eprintln!("exit with error ({}): {err}", err.exit_code());
                std::process::exit(err.exit_code());
            } else {
                eprintln!("exit with error: {err}");
                std::process::exit(1);
            }
        }
    }
}
