use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::Result;
use crate::interface::{remove_unmanaged_entry, take_down};
use crate::system::{FirewallRule, ProcessSignal, SignalOutcome, SystemOps};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    ScratchDirectory,
    VirtualInterface,
    UnmanagedRegistration,
    InterfaceAddress,
    NatRule,
    ForwardingSysctl,
    BridgeDevice,
    ChildProcess,
}

/// Description of how to give a resource back. Carries every value the
/// reversal needs, so nothing else has to remember session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Undo {
    RemoveDirectory { path: PathBuf },
    DeleteInterface { iface: String },
    RemoveUnmanaged { config: PathBuf, mac: String },
    TakeDown { iface: String },
    DeleteRule(FirewallRule),
    RestoreForwarding { value: String },
    DeleteBridge { bridge: String },
    Terminate { pid: u32, marker: Option<PathBuf> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    pub kind: ResourceKind,
    pub identity: String,
    pub undo: Undo,
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.kind, self.identity)
    }
}

impl ResourceHandle {
    pub fn scratch_directory(path: &Path) -> Self {
        ResourceHandle {
            kind: ResourceKind::ScratchDirectory,
            identity: path.display().to_string(),
            undo: Undo::RemoveDirectory { path: path.to_path_buf() },
        }
    }

    pub fn virtual_interface(iface: &str) -> Self {
        ResourceHandle {
            kind: ResourceKind::VirtualInterface,
            identity: iface.to_string(),
            undo: Undo::DeleteInterface { iface: iface.to_string() },
        }
    }

    pub fn unmanaged_registration(config: &Path, mac: &str) -> Self {
        ResourceHandle {
            kind: ResourceKind::UnmanagedRegistration,
            identity: format!("mac:{} in {}", mac, config.display()),
            undo: Undo::RemoveUnmanaged {
                config: config.to_path_buf(),
                mac: mac.to_string(),
            },
        }
    }

    pub fn interface_address(iface: &str) -> Self {
        ResourceHandle {
            kind: ResourceKind::InterfaceAddress,
            identity: iface.to_string(),
            undo: Undo::TakeDown { iface: iface.to_string() },
        }
    }

    pub fn nat_rule(rule: FirewallRule) -> Self {
        ResourceHandle {
            kind: ResourceKind::NatRule,
            identity: rule.iptables_args("-I").join(" "),
            undo: Undo::DeleteRule(rule),
        }
    }

    pub fn forwarding(saved: &str) -> Self {
        ResourceHandle {
            kind: ResourceKind::ForwardingSysctl,
            identity: format!("net.ipv4.ip_forward (was {})", saved),
            undo: Undo::RestoreForwarding { value: saved.to_string() },
        }
    }

    pub fn bridge(bridge: &str) -> Self {
        ResourceHandle {
            kind: ResourceKind::BridgeDevice,
            identity: bridge.to_string(),
            undo: Undo::DeleteBridge { bridge: bridge.to_string() },
        }
    }

    pub fn child_process(name: &str, pid: u32, marker: Option<&Path>) -> Self {
        ResourceHandle {
            kind: ResourceKind::ChildProcess,
            identity: format!("{}[{}]", name, pid),
            undo: Undo::Terminate {
                pid,
                marker: marker.map(Path::to_path_buf),
            },
        }
    }
}

/// How long a child gets between SIGTERM and SIGKILL.
#[derive(Debug, Clone, Copy)]
pub struct TerminatePolicy {
    pub grace: Duration,
    pub poll: Duration,
}

impl Default for TerminatePolicy {
    fn default() -> Self {
        TerminatePolicy {
            grace: Duration::from_secs(2),
            poll: Duration::from_millis(100),
        }
    }
}

/// SIGTERM, wait for the grace period, then SIGKILL. A process that is
/// already gone counts as terminated.
pub fn terminate(ops: &dyn SystemOps, pid: u32, policy: &TerminatePolicy) -> Result<()> {
    if ops.signal(pid, ProcessSignal::Terminate)? == SignalOutcome::AlreadyGone {
        debug!(pid, "process already gone");
        return Ok(());
    }

    let deadline = Instant::now() + policy.grace;
    loop {
        if !ops.is_alive(pid) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(policy.poll);
    }

    warn!(pid, "process ignored SIGTERM, sending SIGKILL");
    ops.signal(pid, ProcessSignal::Kill)?;
    Ok(())
}

fn ignore_not_found(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl Undo {
    /// Performs the reversal. Resources that are already gone are not errors.
    pub fn apply(&self, ops: &dyn SystemOps, policy: &TerminatePolicy) -> Result<()> {
        match self {
            Undo::RemoveDirectory { path } => {
                ignore_not_found(fs::remove_dir_all(path))?;
            }
            Undo::DeleteInterface { iface } => {
                if ops.interface_exists(iface) {
                    ops.delete_interface(iface)?;
                }
            }
            Undo::RemoveUnmanaged { config, mac } => {
                let contents = match fs::read_to_string(config) {
                    Ok(contents) => contents,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                if let Some(updated) = remove_unmanaged_entry(&contents, mac) {
                    fs::write(config, updated)?;
                    if let Err(e) = ops.reload_network_manager() {
                        warn!("NetworkManager reload failed: {}", e);
                    }
                }
            }
            Undo::TakeDown { iface } => take_down(ops, iface)?,
            Undo::DeleteRule(rule) => ops.delete_rule(rule)?,
            Undo::RestoreForwarding { value } => ops.write_ip_forward(value)?,
            Undo::DeleteBridge { bridge } => {
                if ops.interface_exists(bridge) {
                    if let Err(e) = ops.set_link(bridge, false) {
                        warn!(bridge = bridge.as_str(), "could not bring bridge down: {}", e);
                    }
                    ops.delete_bridge(bridge)?;
                }
            }
            Undo::Terminate { pid, marker } => {
                terminate(ops, *pid, policy)?;
                if let Some(marker) = marker {
                    ignore_not_found(fs::remove_file(marker))?;
                }
            }
        }
        Ok(())
    }
}
