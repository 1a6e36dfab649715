//! `sipdial`: place one outbound SIP call, keep it up, hang up
//!
//! Exit status is 0 when the call was answered and 1 otherwise. Ctrl-C
//! cancels a pending INVITE or hangs up an answered call.

mod args;
mod logging;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tracing::{error, info, warn};

use sipdial_call_core::{CallOutcome, CallSession, ObserverError, ResponseObserver, SipResponse, UdpTransport};

use crate::args::Args;
use crate::logging::{parse_log_level, setup_logging, LoggingConfig};

/// Logs progress responses as they arrive
struct ProgressLogger;

#[async_trait]
impl ResponseObserver for ProgressLogger {
    async fn on_response(&self, response: &SipResponse) -> Result<(), ObserverError> {
        match response.status() {
            200 => info!(status = 200, reason = response.reason(), "Call answered"),
            status if status < 200 => info!(status, reason = response.reason(), "Call progressing"),
            status => info!(status, reason = response.reason(), "Final response"),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut logging = LoggingConfig::new(parse_log_level(args.log_level.as_deref()));
    if args.log_json {
        logging = logging.with_json();
    }
    if let Err(e) = setup_logging(logging) {
        eprintln!("{:#}", e);
    }

    match run(args).await {
        Ok(outcome) if outcome.is_connected() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<CallOutcome> {
    let config = args.into_config()?;

    info!("Starting sipdial v{}", env!("CARGO_PKG_VERSION"));

    let transport = Arc::new(
        UdpTransport::bind(&config.transport)
            .await
            .context("failed to bind SIP transport")?,
    );
    let local = transport.advertised_endpoint().clone();

    let mut session = CallSession::new(transport.clone())
        .with_observer(Arc::new(ProgressLogger));

    let stop = session.stop_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received; stopping call");
                stop.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    let outcome = session.run_config(&config, &local).await.context("call setup failed")?;

    transport.close();
    info!(%outcome, "Call finished");
    println!("{}", outcome);

    Ok(outcome)
}
