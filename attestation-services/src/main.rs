// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Context;
use attestation_services::join::JoinService;
use attestation_services::keyservice::MasterSecret;
use attestation_services::verify::VerifyService;
use clap::Parser;
use cvm_attestation::choose::issuer_for;
use cvm_attestation::config::{select_variant, ATTESTATION_CONFIG_PATH, CSP_ENV, MEASUREMENTS_PATH, VARIANT_ENV};
use cvm_attestation::https::UreqGetter;
use cvm_attestation::rpc::{JOIN_SERVICE_PORT, VERIFY_SERVICE_PORT};
use cvm_attestation::updatable::{watch_measurements, PollingWatcher, UpdatableValidator};
use cvm_attestation::Issuer;
use env_logger::Env;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cloud service provider
    #[arg(long, env = CSP_ENV)]
    csp: Option<String>,

    /// Attestation variant, overriding the provider's default
    #[arg(long, env = VARIANT_ENV)]
    variant: Option<String>,

    #[command(subcommand)]
    service: Service,
}

#[derive(clap::Subcommand)]
enum Service {
    /// Serve attestation documents of this node
    Verify {
        #[arg(long, default_value_t = VERIFY_SERVICE_PORT)]
        port: u16,
    },
    /// Issue rejoin tickets to attested nodes
    Join {
        #[arg(long, default_value_t = JOIN_SERVICE_PORT)]
        port: u16,

        /// JSON file holding the master secret and its salt
        #[arg(long)]
        master_secret: PathBuf,

        /// Expected measurements, reloaded when the file changes
        #[arg(long, default_value = MEASUREMENTS_PATH)]
        measurements: PathBuf,

        #[arg(long, default_value = ATTESTATION_CONFIG_PATH)]
        attestation_config: PathBuf,
    },
}

fn listen(port: u16) -> anyhow::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr).with_context(|| format!("listening on {addr}"))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let variant = select_variant(args.csp.as_deref(), args.variant.as_deref())?;
    let issuer: Arc<dyn Issuer> = Arc::from(issuer_for(variant)?);
    let stop = Arc::new(AtomicBool::new(false));

    match args.service {
        Service::Verify { port } => {
            log::info!("starting verify service for {variant}");
            VerifyService::new(issuer).server().serve(listen(port)?, &stop)?;
        }
        Service::Join {
            port,
            master_secret,
            measurements,
            attestation_config,
        } => {
            log::info!("starting join service for {variant}");
            let keys = MasterSecret::from_file(&master_secret)?;
            let validator = Arc::new(
                UpdatableValidator::new(
                    variant,
                    measurements,
                    attestation_config,
                    Arc::new(UreqGetter::default()),
                )
                .context("loading validator")?,
            );

            let watched = validator.clone();
            let watch_stop = stop.clone();
            thread::spawn(move || {
                let watcher = PollingWatcher::new(Duration::from_secs(1));
                if let Err(e) = watch_measurements(&watched, &watcher, &watch_stop) {
                    log::error!("measurements watcher stopped: {e}");
                }
            });

            JoinService::new(Arc::new(keys))
                .server(issuer, validator)
                .serve(listen(port)?, &stop)?;
        }
    }
    Ok(())
}
