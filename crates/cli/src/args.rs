//! Command-line arguments
//!
//! Flags override values from `--config`. Without a config file `--target`
//! and `--caller-id` are required.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use sipdial_call_core::{CallConfig, CallSettings, Endpoint, Header, TransportConfig};

#[derive(Parser, Debug)]
#[command(name = "sipdial")]
#[command(version, about = "Place one outbound SIP call, hold it, hang up")]
pub struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "SIPDIAL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Callee, e.g. sip:08821670000@100.81.118.20:5080
    #[arg(short, long)]
    pub target: Option<Endpoint>,

    /// Local address to bind
    #[arg(long)]
    pub bind_host: Option<String>,

    /// Local port to bind (0 picks one)
    #[arg(long)]
    pub bind_port: Option<u16>,

    /// Address advertised in Contact and Via
    #[arg(long)]
    pub external_host: Option<String>,

    /// Port advertised in Contact and Via
    #[arg(long)]
    pub external_port: Option<u16>,

    /// Display name in the From header
    #[arg(short = 'n', long)]
    pub display_name: Option<String>,

    /// Caller number for From and P-Asserted-Identity
    #[arg(long)]
    pub caller_id: Option<String>,

    /// Seconds to wait for a final response
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Seconds to keep an answered call up
    #[arg(long)]
    pub hold_secs: Option<u64>,

    /// Extra header, "Name: value"; repeatable
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    pub headers: Vec<Header>,

    /// trace, debug, info, warn, error or off
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    pub log_json: bool,
}

fn parse_header(s: &str) -> std::result::Result<Header, String> {
    Header::parse(s).map_err(|e| e.to_string())
}

const DEFAULT_BIND_HOST: &str = "0.0.0.0";
const DEFAULT_BIND_PORT: u16 = 5060;

impl Args {
    /// Merge the config file (if any) with the flags and validate
    pub fn into_config(self) -> Result<CallConfig> {
        let mut config = match &self.config {
            Some(path) => CallConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
            None => {
                let (Some(target), Some(caller_id)) = (self.target.clone(), self.caller_id.clone()) else {
                    bail!("--target and --caller-id are required without --config");
                };
                CallConfig::new(
                    TransportConfig::new(DEFAULT_BIND_HOST, DEFAULT_BIND_PORT),
                    CallSettings::new(target, "", caller_id),
                )
            }
        };

        if let Some(host) = self.bind_host {
            config.transport.bind_host = host;
        }
        if let Some(port) = self.bind_port {
            config.transport.bind_port = port;
        }
        if self.external_host.is_some() || self.external_port.is_some() {
            config.transport.rewrite_contact = true;
        }
        if let Some(host) = self.external_host {
            config.transport.external_host = Some(host);
        }
        if let Some(port) = self.external_port {
            config.transport.external_port = Some(port);
        }
        if let Some(target) = self.target {
            config.call.target = target;
        }
        if let Some(name) = self.display_name {
            config.call.display_name = name;
        }
        if let Some(caller_id) = self.caller_id {
            config.call.caller_id = caller_id;
        }
        if let Some(secs) = self.timeout_secs {
            config.call.timeout_ms = secs.saturating_mul(1000);
        }
        if let Some(secs) = self.hold_secs {
            config.call.hold_ms = secs.saturating_mul(1000);
        }
        config.call.headers.extend(self.headers);

        config.validate().context("invalid call configuration")?;
        Ok(config)
    }
}
