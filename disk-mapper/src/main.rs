// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::{bail, Context};
use clap::Parser;
use cvm_attestation::choose::issuer_for;
use cvm_attestation::config::{select_variant, CSP_ENV, VARIANT_ENV};
use cvm_attestation::https::UreqGetter;
use cvm_attestation::rpc::RECOVERY_PORT;
use cvm_attestation::variant::Provider;
use cvm_attestation::Issuer;
use disk_mapper::mapper::{Cryptsetup, SystemMounter};
use disk_mapper::marker::Device;
use disk_mapper::recovery::{CancelToken, NodeRecoverer, RecoveredKeys, RecoveryError, RecoveryServer, Rejoin};
use disk_mapper::rejoin::{QemuMetadata, RejoinClient, QEMU_METADATA_URL};
use disk_mapper::setup::SetupManager;
use env_logger::Env;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Block device of the state disk
    #[arg(long)]
    disk: PathBuf,

    /// Cloud service provider
    #[arg(long, env = CSP_ENV)]
    csp: Option<String>,

    /// Attestation variant, overriding the provider's default
    #[arg(long, env = VARIANT_ENV)]
    variant: Option<String>,

    /// Port of the recovery server
    #[arg(long, default_value_t = RECOVERY_PORT)]
    recovery_port: u16,

    /// Metadata API used to find the join services on QEMU
    #[arg(long, default_value = QEMU_METADATA_URL)]
    metadata_url: String,
}

/// Rejoin stand-in for providers without a metadata client: keys can only be
/// pushed by an operator.
struct ManualRecoveryOnly;

impl Rejoin for ManualRecoveryOnly {
    fn start(&self, _: &str, token: &CancelToken) -> Option<RecoveredKeys> {
        while !token.sleep(Duration::from_secs(3600)) {}
        None
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let variant = select_variant(args.csp.as_deref(), args.variant.as_deref())?;
    log::info!("starting disk-mapper for {variant}");

    let marker = Device::probe()?;
    if marker.is_bootstrapped()? {
        bail!("node is already marked as bootstrapped");
    }

    let manager = SetupManager::new(
        &args.disk,
        Box::new(Cryptsetup::new(&args.disk)),
        Box::new(SystemMounter),
        marker,
    );

    if !manager.is_luks() {
        return manager.prepare_new_disk().context("preparing new state disk");
    }

    let issuer: Arc<dyn Issuer> = Arc::from(issuer_for(variant)?);
    let rejoin: Box<dyn Rejoin> = match variant.provider() {
        Provider::Qemu => {
            let metadata = QemuMetadata::with_url(Box::new(UreqGetter::default()), args.metadata_url);
            Box::new(RejoinClient::new(issuer.clone(), Box::new(metadata)))
        }
        provider => {
            log::warn!("no metadata client for {provider:?}, waiting for an operator to push the key");
            Box::new(ManualRecoveryOnly)
        }
    };
    let recoverer = NodeRecoverer::new(Box::new(RecoveryServer::new(issuer)), rejoin);
    let addr = SocketAddr::from(([0, 0, 0, 0], args.recovery_port));
    let recover = |uuid: &str| -> Result<RecoveredKeys, RecoveryError> {
        recoverer.recover(uuid, TcpListener::bind(addr)?)
    };

    manager
        .prepare_existing_disk(&recover)
        .context("preparing existing state disk")
}
