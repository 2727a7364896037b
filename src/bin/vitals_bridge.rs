// src/bin/vitals_bridge.rs
//! Bridge binary: connects to the wearable over BLE and serves the live
//! view, audit log and remote upload until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use vitals_bridge::ble::btle::BtleCentral;
use vitals_bridge::config::BridgeArgs;
use vitals_bridge::forward::RealtimeDbUploader;
use vitals_bridge::Bridge;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = BridgeArgs::parse()
        .into_config()
        .context("invalid configuration")?;
    log::info!("starting vitals bridge for device '{}'", config.link.device_name);

    let uploader = RealtimeDbUploader::connect(config.uploader.clone())
        .await
        .context("remote store sign-in failed")?;
    let central = BtleCentral::new().await.context("no usable BLE adapter")?;

    let bridge = Bridge::new(config, Arc::new(central), Arc::new(uploader))?;
    bridge
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}
