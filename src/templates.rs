use lazy_static::lazy_static;
use serde::Serialize;
use std::path::Path;
use tera::{Context, Tera};

use crate::config::{FreqBand, SessionConfig};
use crate::error::{HotspotError, Result};

lazy_static! {
    pub static ref TEMPLATES: Tera = {
        let mut tera = Tera::default();
        if let Err(e) = tera.add_raw_templates(vec![
            ("hostapd.conf", include_str!("../templates/hostapd.conf.tera")),
            ("dnsmasq.conf", include_str!("../templates/dnsmasq.conf.tera")),
        ]) {
            eprintln!("Template parsing error: {}", e);
            std::process::exit(1);
        }
        tera
    };
}

#[derive(Serialize)]
struct HostapdParams<'a> {
    interface: &'a str,
    ssid: &'a str,
    driver: &'a str,
    channel: u32,
    hw_mode: &'static str,
    ctrl_interface: String,
    hidden: bool,
    isolate_clients: bool,
    country: Option<&'a str>,
    bridge: Option<&'a str>,
    passphrase: Option<&'a str>,
    wpa: u8,
}

#[derive(Serialize)]
struct DnsmasqParams<'a> {
    interface: &'a str,
    gateway: String,
    range_start: String,
    range_end: String,
    respect_hosts: bool,
}

fn render<T: Serialize>(name: &str, params: &T) -> Result<String> {
    let render_error = |e: tera::Error| HotspotError::Render {
        name: name.to_string(),
        reason: e.to_string(),
    };
    let context = Context::from_serialize(params).map_err(render_error)?;
    TEMPLATES.render(name, &context).map_err(render_error)
}

/// hostapd configuration. `channel` is the channel actually used, which can
/// differ from the configured one.
pub fn hostapd_conf(
    config: &SessionConfig,
    channel: u32,
    bridge: Option<&str>,
    ctrl_dir: &Path,
) -> Result<String> {
    let band = if channel == config.channel {
        config.freq_band
    } else {
        FreqBand::for_channel(channel)
    };
    render(
        "hostapd.conf",
        &HostapdParams {
            interface: &config.virtual_iface,
            ssid: &config.ssid,
            driver: &config.driver,
            channel,
            hw_mode: band.hw_mode(),
            ctrl_interface: ctrl_dir.display().to_string(),
            hidden: config.hidden,
            isolate_clients: config.isolate_clients,
            country: config.country.as_deref(),
            bridge,
            passphrase: config.passphrase.as_deref(),
            wpa: config.wpa.hostapd_value(),
        },
    )
}

/// dnsmasq configuration, or `None` when the access point has no address of
/// its own (bridging hands DHCP to the shared network).
pub fn dnsmasq_conf(config: &SessionConfig) -> Result<Option<String>> {
    let (Some(gateway), Some((start, end))) = (config.gateway, config.dhcp_range()) else {
        return Ok(None);
    };
    render(
        "dnsmasq.conf",
        &DnsmasqParams {
            interface: &config.virtual_iface,
            gateway: gateway.to_string(),
            range_start: start.to_string(),
            range_end: end.to_string(),
            respect_hosts: config.respect_hosts,
        },
    )
    .map(Some)
}
