use std::fs;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

use crate::config::{virtual_iface_name, SessionConfig};
use crate::error::{HotspotError, Result};
use crate::registry::ResourceRegistry;
use crate::resource::ResourceHandle;
use crate::system::SystemOps;

const KEYFILE_SECTION: &str = "[keyfile]";
const UNMANAGED_KEY: &str = "unmanaged-devices";

/// Checks the interfaces named on the command line before anything is touched.
pub fn verify_interfaces(ops: &dyn SystemOps, config: &SessionConfig) -> Result<()> {
    if !ops.interface_exists(&config.wifi_iface) {
        return Err(HotspotError::invalid(format!("interface '{}' not found", config.wifi_iface)));
    }
    if !ops.is_wireless(&config.wifi_iface) {
        return Err(HotspotError::invalid(format!(
            "interface '{}' is not a WiFi device",
            config.wifi_iface
        )));
    }
    if let Some(internet) = &config.internet_iface {
        if !ops.interface_exists(internet) {
            return Err(HotspotError::invalid(format!("interface '{}' not found", internet)));
        }
    }
    Ok(())
}

/// Creates the AP-mode interface on the radio behind `physical`.
pub fn create_virtual_interface(
    ops: &dyn SystemOps,
    registry: &ResourceRegistry,
    physical: &str,
) -> Result<String> {
    let name = virtual_iface_name(physical);
    let creation_error = |reason: String| HotspotError::InterfaceCreation {
        iface: name.clone(),
        reason,
    };

    if ops.interface_exists(&name) {
        warn!(iface = name.as_str(), "removing stale virtual interface");
        if let Err(e) = ops.delete_interface(&name) {
            debug!("stale interface removal: {}", e);
        }
    }

    let phy = ops.phy_of(physical).map_err(|e| creation_error(e.to_string()))?;
    let concurrent = ops
        .supports_concurrent_ap(&phy)
        .map_err(|e| creation_error(e.to_string()))?;
    if !concurrent {
        return Err(creation_error(format!(
            "{} cannot run an access point alongside {}",
            phy, physical
        )));
    }

    ops.create_ap_interface(physical, &name)
        .map_err(|e| creation_error(e.to_string()))?;
    registry.register(ResourceHandle::virtual_interface(&name));
    info!(iface = name.as_str(), phy = phy.as_str(), "virtual interface created");
    Ok(name)
}

/// Keeps NetworkManager's hands off the virtual interface. Returns whether an
/// entry was added; a missing NetworkManager is not an error.
pub fn register_as_unmanaged(
    ops: &dyn SystemOps,
    registry: &ResourceRegistry,
    vif: &str,
) -> Result<bool> {
    let Some(config) = ops.network_manager_config() else {
        debug!("NetworkManager not running, nothing to register");
        return Ok(false);
    };

    let mac = ops.hardware_address(vif)?;
    let contents = fs::read_to_string(&config)?;
    let Some(updated) = add_unmanaged_entry(&contents, &mac) else {
        info!(mac = mac.as_str(), "already unmanaged by NetworkManager");
        return Ok(false);
    };

    fs::write(&config, updated)?;
    registry.register(ResourceHandle::unmanaged_registration(&config, &mac));
    if let Err(e) = ops.reload_network_manager() {
        warn!("NetworkManager reload failed: {}", e);
    }
    info!(mac = mac.as_str(), "marked {} as unmanaged in {}", vif, config.display());
    Ok(true)
}

/// Flushes the interface, assigns `gateway/24` when given and sets it up.
pub fn bring_up(
    ops: &dyn SystemOps,
    registry: &ResourceRegistry,
    vif: &str,
    gateway: Option<Ipv4Addr>,
) -> Result<()> {
    ops.flush_addresses(vif)?;
    ops.set_link(vif, true)?;
    if let Some(gateway) = gateway {
        ops.add_address(vif, gateway, 24)?;
    }
    registry.register(ResourceHandle::interface_address(vif));
    Ok(())
}

/// Sets the interface down and flushes it; a vanished interface is fine.
pub fn take_down(ops: &dyn SystemOps, vif: &str) -> Result<()> {
    if !ops.interface_exists(vif) {
        return Ok(());
    }
    let down = ops.set_link(vif, false);
    ops.flush_addresses(vif)?;
    down
}

fn unmanaged_value(line: &str) -> Option<&str> {
    let (key, value) = line.split_once('=')?;
    (key.trim() == UNMANAGED_KEY).then_some(value)
}

/// Index of the `unmanaged-devices` line and the `[keyfile]` header, if any.
fn locate(lines: &[String]) -> (Option<usize>, Option<usize>) {
    let mut header = None;
    let mut in_keyfile = false;
    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            in_keyfile = trimmed == KEYFILE_SECTION;
            if in_keyfile && header.is_none() {
                header = Some(idx);
            }
            continue;
        }
        if in_keyfile && unmanaged_value(trimmed).is_some() {
            return (Some(idx), header);
        }
    }
    (None, header)
}

fn split_lines(contents: &str) -> (Vec<String>, bool) {
    let trailing_newline = contents.ends_with('\n');
    let lines = contents.lines().map(String::from).collect();
    (lines, trailing_newline)
}

fn join_lines(lines: &[String], trailing_newline: bool) -> String {
    let mut out = lines.join("\n");
    if trailing_newline && !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Adds `mac:<mac>` to `[keyfile] unmanaged-devices`. `None` when present.
pub fn add_unmanaged_entry(contents: &str, mac: &str) -> Option<String> {
    let entry = format!("mac:{}", mac);
    let (mut lines, trailing_newline) = split_lines(contents);

    match locate(&lines) {
        (Some(idx), _) => {
            let value = unmanaged_value(&lines[idx]).unwrap_or_default();
            let mut entries: Vec<&str> = value.split(';').map(str::trim).filter(|e| !e.is_empty()).collect();
            if entries.iter().any(|e| e.eq_ignore_ascii_case(&entry)) {
                return None;
            }
            entries.push(&entry);
            lines[idx] = format!("{}={}", UNMANAGED_KEY, entries.join(";"));
            Some(join_lines(&lines, trailing_newline))
        }
        (None, Some(header)) => {
            lines.insert(header + 1, format!("{}={}", UNMANAGED_KEY, entry));
            Some(join_lines(&lines, trailing_newline))
        }
        (None, None) => {
            lines.push(KEYFILE_SECTION.to_string());
            lines.push(format!("{}={}", UNMANAGED_KEY, entry));
            Some(join_lines(&lines, true))
        }
    }
}

/// Removes exactly `mac:<mac>` again. Drops the line once it is empty, and
/// the `[keyfile]` header too if nothing else is left in it.
pub fn remove_unmanaged_entry(contents: &str, mac: &str) -> Option<String> {
    let entry = format!("mac:{}", mac);
    let (mut lines, trailing_newline) = split_lines(contents);
    let (Some(idx), header) = locate(&lines) else {
        return None;
    };

    let value = unmanaged_value(&lines[idx]).unwrap_or_default();
    let all: Vec<&str> = value.split(';').map(str::trim).filter(|e| !e.is_empty()).collect();
    let remaining: Vec<&str> = all.iter().copied().filter(|e| !e.eq_ignore_ascii_case(&entry)).collect();
    if remaining.len() == all.len() {
        return None;
    }

    if remaining.is_empty() {
        lines.remove(idx);
        if let Some(header) = header {
            let section_empty = lines[header + 1..]
                .iter()
                .take_while(|l| !l.trim().starts_with('['))
                .all(|l| l.trim().is_empty());
            let at_end = lines[header + 1..].iter().all(|l| l.trim().is_empty());
            if section_empty && at_end {
                lines.truncate(header);
            }
        }
    } else {
        lines[idx] = format!("{}={}", UNMANAGED_KEY, remaining.join(";"));
    }
    Some(join_lines(&lines, trailing_newline))
}
