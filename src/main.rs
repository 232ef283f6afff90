use std::sync::Arc;

use anyhow::Context;
use env_logger::Env;
use jbdread::{BleTransport, BmsSession, SessionConfig, Transport};
use tokio::time::{sleep, Duration};

const DEFAULT_INTERVAL_S: u64 = 5;

/// Usage: jbd-monitor [DEVICE NAME] [INTERVAL SECONDS]
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let name = args
        .next()
        .unwrap_or_else(|| BleTransport::DEFAULT_DEVICE_NAME.to_string());
    let interval = match args.next() {
        Some(secs) => secs.parse().context("interval must be a number of seconds")?,
        None => DEFAULT_INTERVAL_S,
    };

    let transport = Arc::new(BleTransport::connect(&name).await?);
    let session = BmsSession::new(transport.clone(), SessionConfig::default());

    let mtu = session.negotiate_mtu(&name, &transport).await;
    log::info!("MTU {} ({:?})", mtu.mtu, mtu.reason);

    let notifications = transport.notifications().await?;
    let result = tokio::select! {
        result = session.pump(notifications) => result,
        result = poll(&session, Duration::from_secs(interval)) => result,
    };

    session.correlator().cancel_all();
    transport.disconnect().await?;
    result
}

async fn poll<T: Transport>(session: &BmsSession<T>, interval: Duration) -> anyhow::Result<()> {
    match session.fetch_hardware_version().await {
        Ok(version) => println!("Hardware version: {}", version.version()),
        Err(err) => log::warn!("Hardware version: {err}"),
    }

    loop {
        match session.fetch_telemetry().await {
            Ok(validated) if validated.is_rejected() => {
                for finding in validated.report.errors() {
                    println!("REJECTED {}: {}", finding.validator_name, finding.message);
                }
            }
            Ok(validated) => println!("{:?}", validated.sample),
            Err(err) => log::warn!("Telemetry: {err}"),
        }
        sleep(interval).await;
    }
}
