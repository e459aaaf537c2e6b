use anyhow::{bail, Result};
use clap::Parser;
use nix::unistd::geteuid;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use wifi_hotspot::{
    config::{resolve_method, split_positionals, Defaults, FreqBand, SessionConfig, SessionRequest, ShareMethod, WpaMode},
    interface, prompt, supervisor, HotspotError, Session, SessionOptions, System, TeardownCoordinator,
};

#[derive(Parser)]
#[command(name = "wifi-hotspot")]
#[command(about = "Run a temporary WiFi access point and share an Internet connection with it")]
#[command(override_usage = "wifi-hotspot [OPTIONS] <wifi-interface> [<interface-with-internet>] [<access-point-name> [<passphrase>]]")]
#[command(version)]
struct Cli {
    /// Channel number (default: 1)
    #[arg(short, long)]
    channel: Option<u32>,

    /// WPA version: 1, 2 or 1+2 (default: 1+2)
    #[arg(short, long)]
    wpa: Option<WpaMode>,

    /// IPv4 gateway of the access point (default: 192.168.12.1)
    #[arg(short, long)]
    gateway: Option<Ipv4Addr>,

    /// Internet sharing method: nat, bridge or none (default: nat)
    #[arg(short, long)]
    method: Option<ShareMethod>,

    /// Do not share an Internet connection (same as --method none)
    #[arg(short, long)]
    no_internet: bool,

    /// Hide the SSID
    #[arg(long)]
    hidden: bool,

    /// Let DNS clients resolve names from /etc/hosts
    #[arg(short = 'd', long)]
    respect_hosts: bool,

    /// hostapd driver (default: nl80211)
    #[arg(long)]
    driver: Option<String>,

    /// Stop clients of the access point from reaching each other
    #[arg(long)]
    isolate_clients: bool,

    /// Two-letter regulatory country code
    #[arg(long)]
    country: Option<String>,

    /// Frequency band: 2.4 or 5 (default: derived from the channel)
    #[arg(long)]
    freq_band: Option<FreqBand>,

    /// Defaults file (default: ~/.config/wifi-hotspot/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[arg(required = true, num_args = 1..=4, value_name = "ARGS")]
    args: Vec<String>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version output included: the access point never ran.
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };

    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn load_defaults(path: Option<&PathBuf>) -> Result<Defaults> {
    match path {
        Some(path) => Defaults::load_from(path),
        None => Defaults::load(),
    }
}

fn run(cli: Cli) -> Result<()> {
    if !geteuid().is_root() {
        bail!("You must run wifi-hotspot as root");
    }

    let defaults = load_defaults(cli.config.as_ref())?;
    let method = resolve_method(cli.no_internet, cli.method, &defaults)?;
    let positionals = split_positionals(method, &cli.args)?;

    let (ssid, passphrase) = match positionals.ssid {
        Some(ssid) => (ssid, positionals.passphrase),
        None => {
            let credentials = prompt::read_credentials()?;
            (credentials.ssid, credentials.passphrase)
        }
    };

    let config = SessionConfig::new(
        SessionRequest {
            wifi_iface: positionals.wifi_iface,
            internet_iface: positionals.internet_iface,
            ssid,
            passphrase,
            channel: cli.channel,
            wpa: cli.wpa,
            gateway: cli.gateway,
            method: Some(method),
            no_internet: cli.no_internet,
            hidden: cli.hidden,
            respect_hosts: cli.respect_hosts,
            driver: cli.driver,
            isolate_clients: cli.isolate_clients,
            country: cli.country,
            freq_band: cli.freq_band,
        },
        &defaults,
    )?;

    let system = Arc::new(System::new());
    interface::verify_interfaces(system.as_ref(), &config)?;
    let missing = supervisor::missing_programs(system.as_ref(), config.method);
    if !missing.is_empty() {
        bail!("Required programs not found: {}", missing.join(", "));
    }

    let wifi_iface = config.wifi_iface.clone();
    let sharing = match (&config.method, &config.internet_iface) {
        (ShareMethod::None, _) | (_, None) => "no Internet sharing".to_string(),
        (method, Some(internet)) => format!("sharing {} via {}", internet, method),
    };
    println!("Starting access point on {} ({})...", wifi_iface, sharing);

    let session = Arc::new(Session::new(config, system, SessionOptions::default()));
    let coordinator = Arc::new(TeardownCoordinator::new(session));
    coordinator.install_signal_handler()?;

    match coordinator.run() {
        // Interrupted means a termination signal: a clean stop.
        Ok(_) | Err(HotspotError::Interrupted) => println!("Access point stopped."),
        Err(e) => return Err(e.into()),
    }

    Ok(())
}
