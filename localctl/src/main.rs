mod commands;
mod config;
mod docker;
mod error;
mod helm;
mod images;
mod install;
mod k8s;
mod logging;
mod migrate;
#[cfg(test)]
mod testing;
mod utils;

use crate::config::Config;
use crate::error::LocalError;
use anyhow::Result;
use clap::Parser;
use tokio::{
    select,
    signal::unix::{signal, SignalKind},
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    logging::init(&config)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let cancel = CancellationToken::new();

    let result = select! {
        result = commands::run(&config, cancel.clone()) => result,

        _ = sigterm.recv() => {
            warn!("SIGTERM received, exiting");
            cancel.cancel();
            Err(LocalError::Cancelled)
        }

        _ = sigint.recv() => {
            warn!("SIGINT received, exiting");
            cancel.cancel();
            Err(LocalError::Cancelled)
        }
    };

    Ok(result?)
}
