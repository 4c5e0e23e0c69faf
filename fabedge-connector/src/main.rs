use std::process::exit;

use clap::Parser;
use kube::Client;
use log::{error, LevelFilter};

use cli::Cli;
use manager::Manager;

mod cli;
mod gossip;
mod ipset;
mod iptables;
mod manager;
mod routing;
mod tunnel;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    configure_logger();

    let client = match Client::try_default().await {
        Ok(client) => client,
        Err(error) => {
            error!("Couldn't create the cluster API client! {error}");
            exit(1);
        }
    };

    let mut manager = match Manager::new(cli, client).await {
        Ok(manager) => manager,
        Err(error) => {
            error!("Couldn't create the connector manager! {error:#}");
            exit(1);
        }
    };

    if let Err(error) = manager.start().await {
        error!("The connector manager failed! {error:#}");
        exit(2);
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
