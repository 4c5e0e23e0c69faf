use std::process::exit;

use clap::Parser;
use log::{error, info, LevelFilter};

use cli::Cli;

mod allocator;
mod cli;
mod controllers;
mod federation;
mod leader;
mod options;
mod pod_cidr_store;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    configure_logger();

    // reqwest and the API server share the process-wide TLS provider
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    if let Err(error) = cli.validate() {
        error!("Invalid configuration! {error}");
        exit(1);
    }

    match options::run(cli).await {
        Ok(()) => {
            info!("Exiting...");
        }
        Err(error) => {
            error!("The operator failed! {error:#}");
            exit(2);
        }
    }
}

fn configure_logger() {
    env_logger::builder()
        .default_format()
        .format_module_path(false)
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init()
}
