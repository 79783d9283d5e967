//! `rbd-driver`: run one volume driver operation and print the result as JSON.

mod cli;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use librbd::{CreateOptions, HostRunner, RbdBackend, VolumeDriver, VolumeError};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, LogFormat};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = config::resolve(cli.root.as_deref(), cli.config.as_deref(), &cli.driver_opts)?;
    let runner = Arc::new(HostRunner);
    let backend = Arc::new(RbdBackend::new(runner.clone()));
    let driver = VolumeDriver::open(cfg, backend, runner)
        .await
        .context("failed to open volume driver")?;

    match cli.command {
        Command::Create {
            name,
            size,
            pool,
            fstype,
        } => {
            let opts = CreateOptions {
                pool,
                size,
                fs_type: fstype,
            };
            print(&driver.create(&name, &opts).await?)
        }
        Command::Mount { name } => {
            let path = driver.mount(&name).await?;
            print(&json!({ "Mountpoint": path }))
        }
        Command::Unmount { name } => {
            driver.unmount(&name).await?;
            print(&json!({}))
        }
        Command::Remove { name } => {
            driver.remove(&name).await?;
            print(&json!({}))
        }
        Command::Path { name } => print(&json!({ "Mountpoint": driver.path(&name)? })),
        Command::Get { name } => print(&driver.get(&name)?),
        Command::List => print(&driver.list()),
        Command::Capabilities => print(&driver.capabilities()),
        Command::Info => print(&json!({ "Driver": driver.name(), "Info": driver.info() })),
        Command::Clear { name } => print(&driver.clear(&name).await?),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<VolumeError>() {
            Some(err) => {
                let out = json!({ "Error": err, "Message": format!("{e:#}"), "Retryable": err.is_retryable() });
                println!("{}", serde_json::to_string_pretty(&out).unwrap_or_else(|_| e.to_string()));
            }
            None => eprintln!("Error: {e:#}"),
        }
        std::process::exit(1);
    }
}
