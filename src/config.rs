use anyhow::Context;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{HotspotError, Result};

/// Linux limits interface names to 15 bytes (IFNAMSIZ - 1).
const MAX_IFACE_NAME: usize = 15;
const VIRTUAL_SUFFIX: &str = "ap";

pub const DEFAULT_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 12, 1);
pub const DEFAULT_CHANNEL: u32 = 1;
pub const DEFAULT_DRIVER: &str = "nl80211";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareMethod {
    None,
    Nat,
    Bridge,
}

impl FromStr for ShareMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(ShareMethod::None),
            "nat" => Ok(ShareMethod::Nat),
            "bridge" => Ok(ShareMethod::Bridge),
            other => Err(format!("unknown sharing method '{}' (expected nat, bridge or none)", other)),
        }
    }
}

impl fmt::Display for ShareMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShareMethod::None => "none",
            ShareMethod::Nat => "nat",
            ShareMethod::Bridge => "bridge",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum WpaMode {
    #[serde(rename = "1")]
    Wpa1,
    #[serde(rename = "2")]
    Wpa2,
    #[serde(rename = "1+2")]
    Both,
}

impl WpaMode {
    /// Value of hostapd's `wpa=` bitmask.
    pub fn hostapd_value(self) -> u8 {
        match self {
            WpaMode::Wpa1 => 1,
            WpaMode::Wpa2 => 2,
            WpaMode::Both => 3,
        }
    }
}

impl FromStr for WpaMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "1" => Ok(WpaMode::Wpa1),
            "2" => Ok(WpaMode::Wpa2),
            "1+2" | "2+1" => Ok(WpaMode::Both),
            other => Err(format!("unknown WPA version '{}' (expected 1, 2 or 1+2)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum FreqBand {
    #[serde(rename = "2.4")]
    Ghz2_4,
    #[serde(rename = "5")]
    Ghz5,
}

impl FreqBand {
    /// hostapd `hw_mode` for this band.
    pub fn hw_mode(self) -> &'static str {
        match self {
            FreqBand::Ghz2_4 => "g",
            FreqBand::Ghz5 => "a",
        }
    }

    fn channel_valid(self, channel: u32) -> bool {
        match self {
            FreqBand::Ghz2_4 => (1..=14).contains(&channel),
            FreqBand::Ghz5 => (36..=177).contains(&channel),
        }
    }

    pub fn for_channel(channel: u32) -> Self {
        if channel > 14 { FreqBand::Ghz5 } else { FreqBand::Ghz2_4 }
    }
}

impl FromStr for FreqBand {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "2.4" => Ok(FreqBand::Ghz2_4),
            "5" => Ok(FreqBand::Ghz5),
            other => Err(format!("unknown frequency band '{}' (expected 2.4 or 5)", other)),
        }
    }
}

/// Optional defaults read from `config.toml`. Command-line flags take precedence.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    #[serde(default)]
    pub channel: Option<u32>,
    #[serde(default)]
    pub wpa: Option<WpaMode>,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub method: Option<ShareMethod>,
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub freq_band: Option<FreqBand>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub isolate_clients: bool,
    #[serde(default)]
    pub respect_hosts: bool,
}

impl Defaults {
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path()?;
        if !path.exists() {
            return Ok(Defaults::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}

pub fn config_path() -> anyhow::Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Could not determine config directory")?;
    Ok(config_dir.join("wifi-hotspot").join("config.toml"))
}

/// Everything the operator asked for, before validation.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub wifi_iface: String,
    pub internet_iface: Option<String>,
    pub ssid: String,
    pub passphrase: Option<String>,
    pub channel: Option<u32>,
    pub wpa: Option<WpaMode>,
    pub gateway: Option<Ipv4Addr>,
    pub method: Option<ShareMethod>,
    pub no_internet: bool,
    pub hidden: bool,
    pub respect_hosts: bool,
    pub driver: Option<String>,
    pub isolate_clients: bool,
    pub country: Option<String>,
    pub freq_band: Option<FreqBand>,
}

/// Validated, immutable description of one access point session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub wifi_iface: String,
    pub virtual_iface: String,
    pub internet_iface: Option<String>,
    pub ssid: String,
    pub passphrase: Option<String>,
    pub channel: u32,
    pub wpa: WpaMode,
    /// `None` when bridging: the bridge, not the access point, owns the address.
    pub gateway: Option<Ipv4Addr>,
    pub method: ShareMethod,
    pub hidden: bool,
    pub respect_hosts: bool,
    pub driver: String,
    pub isolate_clients: bool,
    pub country: Option<String>,
    pub freq_band: FreqBand,
}

/// Picks the sharing method from `-n`, `-m` and the defaults file.
pub fn resolve_method(
    no_internet: bool,
    requested: Option<ShareMethod>,
    defaults: &Defaults,
) -> Result<ShareMethod> {
    match (no_internet, requested) {
        (true, Some(method)) if method != ShareMethod::None => Err(HotspotError::invalid(format!(
            "--no-internet conflicts with --method {}",
            method
        ))),
        (true, _) => Ok(ShareMethod::None),
        (false, Some(method)) => Ok(method),
        (false, None) => Ok(defaults.method.unwrap_or(ShareMethod::Nat)),
    }
}

/// Positional arguments once the sharing method is known.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Positionals {
    pub wifi_iface: String,
    pub internet_iface: Option<String>,
    pub ssid: Option<String>,
    pub passphrase: Option<String>,
}

/// Splits `<wifi> [<internet>] [<ssid> [<passphrase>]]`; the internet
/// interface is only expected when something is being shared.
pub fn split_positionals(method: ShareMethod, args: &[String]) -> Result<Positionals> {
    let mut iter = args.iter().cloned();
    let wifi_iface = iter
        .next()
        .ok_or_else(|| HotspotError::invalid("missing wifi interface"))?;

    let internet_iface = if method == ShareMethod::None {
        None
    } else {
        Some(iter.next().ok_or_else(|| {
            HotspotError::invalid(format!("sharing method '{}' needs an interface with Internet access", method))
        })?)
    };

    let positionals = Positionals {
        wifi_iface,
        internet_iface,
        ssid: iter.next(),
        passphrase: iter.next(),
    };

    if iter.next().is_some() {
        return Err(HotspotError::invalid("too many arguments"));
    }

    Ok(positionals)
}

/// `<physical>ap`, shortened so the name fits the kernel limit.
pub fn virtual_iface_name(physical: &str) -> String {
    let room = MAX_IFACE_NAME - VIRTUAL_SUFFIX.len();
    let mut base = physical.to_string();
    while base.len() > room {
        base.pop();
    }
    format!("{}{}", base, VIRTUAL_SUFFIX)
}

pub fn validate_ssid(ssid: &str) -> Result<()> {
    if ssid.is_empty() || ssid.len() > 32 {
        return Err(HotspotError::invalid("SSID must be between 1 and 32 bytes"));
    }
    if ssid.chars().any(char::is_control) {
        return Err(HotspotError::invalid("SSID must not contain control characters"));
    }
    Ok(())
}

pub fn validate_passphrase(passphrase: &str) -> Result<()> {
    let len = passphrase.chars().count();
    if !(8..=63).contains(&len) {
        return Err(HotspotError::invalid("passphrase must be between 8 and 63 characters"));
    }
    if passphrase.chars().any(char::is_control) {
        return Err(HotspotError::invalid("passphrase must not contain control characters"));
    }
    Ok(())
}

fn validate_gateway(gateway: Ipv4Addr) -> Result<()> {
    let last = gateway.octets()[3];
    if !gateway.is_private() || last == 0 || last == 255 {
        return Err(HotspotError::invalid(format!(
            "gateway {} must be a private host address",
            gateway
        )));
    }
    Ok(())
}

impl SessionConfig {
    pub fn new(req: SessionRequest, defaults: &Defaults) -> Result<Self> {
        let method = resolve_method(req.no_internet, req.method, defaults)?;

        match (method, &req.internet_iface) {
            (ShareMethod::None, Some(iface)) => {
                return Err(HotspotError::invalid(format!(
                    "interface '{}' given but nothing is shared",
                    iface
                )));
            }
            (ShareMethod::Nat | ShareMethod::Bridge, None) => {
                return Err(HotspotError::invalid(format!(
                    "sharing method '{}' needs an interface with Internet access",
                    method
                )));
            }
            _ => {}
        }

        if req.internet_iface.as_deref() == Some(req.wifi_iface.as_str()) {
            return Err(HotspotError::invalid(
                "wifi interface and Internet interface must differ",
            ));
        }
        if req.wifi_iface.is_empty() {
            return Err(HotspotError::invalid("missing wifi interface"));
        }

        let gateway = if method == ShareMethod::Bridge {
            if req.gateway.is_some() {
                return Err(HotspotError::invalid(
                    "--gateway cannot be used with the bridge method",
                ));
            }
            None
        } else {
            let gateway = req.gateway.or(defaults.gateway).unwrap_or(DEFAULT_GATEWAY);
            validate_gateway(gateway)?;
            Some(gateway)
        };

        validate_ssid(&req.ssid)?;
        if let Some(passphrase) = &req.passphrase {
            validate_passphrase(passphrase)?;
        }

        let channel = req.channel.or(defaults.channel).unwrap_or(DEFAULT_CHANNEL);
        let freq_band = req
            .freq_band
            .or(defaults.freq_band)
            .unwrap_or_else(|| FreqBand::for_channel(channel));
        if !freq_band.channel_valid(channel) {
            return Err(HotspotError::invalid(format!(
                "channel {} is not valid for the {} band",
                channel,
                match freq_band {
                    FreqBand::Ghz2_4 => "2.4 GHz",
                    FreqBand::Ghz5 => "5 GHz",
                }
            )));
        }

        let country = match req.country.or_else(|| defaults.country.clone()) {
            Some(code) if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) => {
                Some(code.to_ascii_uppercase())
            }
            Some(code) => {
                return Err(HotspotError::invalid(format!("invalid country code '{}'", code)));
            }
            None => None,
        };

        Ok(SessionConfig {
            virtual_iface: virtual_iface_name(&req.wifi_iface),
            wifi_iface: req.wifi_iface,
            internet_iface: req.internet_iface,
            ssid: req.ssid,
            passphrase: req.passphrase,
            channel,
            wpa: req.wpa.or(defaults.wpa).unwrap_or(WpaMode::Both),
            gateway,
            method,
            hidden: req.hidden || defaults.hidden,
            respect_hosts: req.respect_hosts || defaults.respect_hosts,
            driver: req
                .driver
                .or_else(|| defaults.driver.clone())
                .unwrap_or_else(|| DEFAULT_DRIVER.to_string()),
            isolate_clients: req.isolate_clients || defaults.isolate_clients,
            country,
            freq_band,
        })
    }

    /// `a.b.c.0/24` around the gateway, if the access point has an address.
    pub fn subnet(&self) -> Option<String> {
        self.gateway.map(|gw| {
            let [a, b, c, _] = gw.octets();
            format!("{}.{}.{}.0/24", a, b, c)
        })
    }

    /// First and last address handed out by the DHCP server.
    pub fn dhcp_range(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        self.gateway.map(|gw| {
            let [a, b, c, _] = gw.octets();
            (Ipv4Addr::new(a, b, c, 1), Ipv4Addr::new(a, b, c, 254))
        })
    }
}
