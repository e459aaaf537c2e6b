use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tracing::debug;

use crate::error::{HotspotError, Result};

const IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";
const ENTROPY_AVAIL: &str = "/proc/sys/kernel/random/entropy_avail";
const NM_CONFIG: &str = "/etc/NetworkManager/NetworkManager.conf";
/// Daemons live here even when root's PATH lacks them.
const SBIN_DIRS: &str = "/sbin:/usr/sbin:/usr/local/sbin";

/// A firewall rule this crate inserts; rendered to `iptables` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallRule {
    /// Masquerade traffic from `source` leaving through `out_iface`.
    Masquerade { out_iface: String, source: String },
    /// Accept forwarded traffic from `source` entering through `in_iface`.
    AcceptForward { in_iface: String, source: String },
}

impl FirewallRule {
    /// `iptables` arguments; `op` is `-I` to insert or `-D` to delete.
    pub fn iptables_args(&self, op: &str) -> Vec<String> {
        let args: Vec<&str> = match self {
            FirewallRule::Masquerade { out_iface, source } => vec![
                "-w", "-t", "nat", op, "POSTROUTING", "-s", source.as_str(), "-o", out_iface.as_str(), "-j",
                "MASQUERADE",
            ],
            FirewallRule::AcceptForward { in_iface, source } => {
                vec!["-w", op, "FORWARD", "-i", in_iface.as_str(), "-s", source.as_str(), "-j", "ACCEPT"]
            }
        };
        args.into_iter().map(String::from).collect()
    }
}

/// How a daemon run in the foreground ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonExit {
    pub code: Option<i32>,
}

impl DaemonExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Terminate,
    Kill,
}

/// Outcome of signalling a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Delivered,
    AlreadyGone,
}

/// Every external tool and kernel knob the crate touches. [`System`] shells
/// out; the unit tests substitute an in-memory host.
pub trait SystemOps: Send + Sync {
    // --- links ---
    fn interface_exists(&self, iface: &str) -> bool;
    fn is_wireless(&self, iface: &str) -> bool;
    /// Name of the radio (`phyN`) behind a wireless interface.
    fn phy_of(&self, iface: &str) -> Result<String>;
    /// Whether the radio can run an AP next to its existing station interface.
    fn supports_concurrent_ap(&self, phy: &str) -> Result<bool>;
    /// Channel the interface currently operates on, if it is associated.
    fn current_channel(&self, iface: &str) -> Result<Option<u32>>;
    fn create_ap_interface(&self, physical: &str, name: &str) -> Result<()>;
    fn delete_interface(&self, name: &str) -> Result<()>;
    fn hardware_address(&self, iface: &str) -> Result<String>;
    fn flush_addresses(&self, iface: &str) -> Result<()>;
    fn add_address(&self, iface: &str, addr: Ipv4Addr, prefix: u8) -> Result<()>;
    fn set_link(&self, iface: &str, up: bool) -> Result<()>;

    // --- forwarding and firewall ---
    /// Raw contents of the IPv4 forwarding sysctl.
    fn read_ip_forward(&self) -> Result<String>;
    fn write_ip_forward(&self, value: &str) -> Result<()>;
    fn insert_rule(&self, rule: &FirewallRule) -> Result<()>;
    fn delete_rule(&self, rule: &FirewallRule) -> Result<()>;

    // --- bridging ---
    fn list_bridges(&self) -> Result<Vec<String>>;
    fn create_bridge(&self, name: &str) -> Result<()>;
    fn delete_bridge(&self, name: &str) -> Result<()>;
    fn attach_to_bridge(&self, bridge: &str, member: &str) -> Result<()>;

    // --- network manager ---
    /// Config file of a running NetworkManager, or `None` when it is absent.
    fn network_manager_config(&self) -> Option<PathBuf>;
    fn reload_network_manager(&self) -> Result<()>;

    // --- processes ---
    fn find_program(&self, name: &str) -> Option<PathBuf>;
    fn entropy_available(&self) -> Result<u32>;
    /// Starts a background process and returns its PID.
    fn spawn(&self, program: &str, args: &[String]) -> Result<u32>;
    /// Starts a process, calls `on_start` with its PID, then waits for it.
    fn run_foreground(
        &self,
        program: &str,
        args: &[String],
        on_start: &mut dyn FnMut(u32),
    ) -> Result<DaemonExit>;
    fn signal(&self, pid: u32, sig: ProcessSignal) -> Result<SignalOutcome>;
    fn is_alive(&self, pid: u32) -> bool;
}

/// The real host.
#[derive(Debug, Default)]
pub struct System;

impl System {
    pub fn new() -> Self {
        System
    }

    fn exec(program: &str, args: &[&str]) -> Result<Output> {
        debug!(program, ?args, "exec");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| HotspotError::command(program, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let error_msg = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(HotspotError::command(program, error_msg.trim().to_string()));
        }

        Ok(output)
    }

    fn exec_owned(program: &str, args: &[String]) -> Result<Output> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        Self::exec(program, &args)
    }
}

impl SystemOps for System {
    fn interface_exists(&self, iface: &str) -> bool {
        Path::new("/sys/class/net").join(iface).exists()
    }

    fn is_wireless(&self, iface: &str) -> bool {
        Path::new("/sys/class/net").join(iface).join("phy80211").exists()
    }

    fn phy_of(&self, iface: &str) -> Result<String> {
        let path = Path::new("/sys/class/net").join(iface).join("phy80211").join("name");
        let name = fs::read_to_string(&path)?;
        Ok(name.trim().to_string())
    }

    fn supports_concurrent_ap(&self, phy: &str) -> Result<bool> {
        let output = Self::exec("iw", &["phy", phy, "info"])?;
        Ok(parse_ap_concurrency(&String::from_utf8_lossy(&output.stdout)))
    }

    fn current_channel(&self, iface: &str) -> Result<Option<u32>> {
        let output = Self::exec("iw", &["dev", iface, "info"])?;
        Ok(parse_channel(&String::from_utf8_lossy(&output.stdout)))
    }

    fn create_ap_interface(&self, physical: &str, name: &str) -> Result<()> {
        Self::exec("iw", &["dev", physical, "interface", "add", name, "type", "__ap"])?;
        Ok(())
    }

    fn delete_interface(&self, name: &str) -> Result<()> {
        Self::exec("iw", &["dev", name, "del"])?;
        Ok(())
    }

    fn hardware_address(&self, iface: &str) -> Result<String> {
        let path = Path::new("/sys/class/net").join(iface).join("address");
        Ok(fs::read_to_string(path)?.trim().to_ascii_lowercase())
    }

    fn flush_addresses(&self, iface: &str) -> Result<()> {
        Self::exec("ip", &["addr", "flush", "dev", iface])?;
        Ok(())
    }

    fn add_address(&self, iface: &str, addr: Ipv4Addr, prefix: u8) -> Result<()> {
        let cidr = format!("{}/{}", addr, prefix);
        let broadcast = {
            let [a, b, c, _] = addr.octets();
            format!("{}.{}.{}.255", a, b, c)
        };
        Self::exec("ip", &["addr", "add", &cidr, "broadcast", &broadcast, "dev", iface])?;
        Ok(())
    }

    fn set_link(&self, iface: &str, up: bool) -> Result<()> {
        let state = if up { "up" } else { "down" };
        Self::exec("ip", &["link", "set", "dev", iface, state])?;
        Ok(())
    }

    fn read_ip_forward(&self) -> Result<String> {
        Ok(fs::read_to_string(IP_FORWARD)?.trim().to_string())
    }

    fn write_ip_forward(&self, value: &str) -> Result<()> {
        debug!(value, "writing {}", IP_FORWARD);
        fs::write(IP_FORWARD, value)?;
        Ok(())
    }

    fn insert_rule(&self, rule: &FirewallRule) -> Result<()> {
        Self::exec_owned("iptables", &rule.iptables_args("-I"))?;
        Ok(())
    }

    fn delete_rule(&self, rule: &FirewallRule) -> Result<()> {
        Self::exec_owned("iptables", &rule.iptables_args("-D"))?;
        Ok(())
    }

    fn list_bridges(&self) -> Result<Vec<String>> {
        let output = Self::exec("ip", &["-o", "link", "show", "type", "bridge"])?;
        Ok(parse_link_names(&String::from_utf8_lossy(&output.stdout)))
    }

    fn create_bridge(&self, name: &str) -> Result<()> {
        Self::exec("ip", &["link", "add", "name", name, "type", "bridge"])?;
        Ok(())
    }

    fn delete_bridge(&self, name: &str) -> Result<()> {
        Self::exec("ip", &["link", "delete", name, "type", "bridge"])?;
        Ok(())
    }

    fn attach_to_bridge(&self, bridge: &str, member: &str) -> Result<()> {
        Self::exec("ip", &["link", "set", "dev", member, "master", bridge])?;
        Ok(())
    }

    fn network_manager_config(&self) -> Option<PathBuf> {
        // `nmcli -t -f RUNNING general` prints "running" when the daemon is up.
        let running = Command::new("nmcli")
            .args(["-t", "-f", "RUNNING", "general"])
            .output()
            .map(|out| out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "running")
            .unwrap_or(false);

        let path = PathBuf::from(NM_CONFIG);
        (running && path.exists()).then_some(path)
    }

    fn reload_network_manager(&self) -> Result<()> {
        Self::exec("nmcli", &["general", "reload", "conf"])?;
        Ok(())
    }

    fn find_program(&self, name: &str) -> Option<PathBuf> {
        which::which(name)
            .ok()
            .or_else(|| find_program_in(name, SBIN_DIRS))
    }

    fn entropy_available(&self) -> Result<u32> {
        let raw = fs::read_to_string(ENTROPY_AVAIL)?;
        raw.trim()
            .parse()
            .map_err(|_| HotspotError::command(ENTROPY_AVAIL, format!("unexpected value '{}'", raw.trim())))
    }

    fn spawn(&self, program: &str, args: &[String]) -> Result<u32> {
        debug!(program, ?args, "spawn");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| HotspotError::command(program, e.to_string()))?;
        // Reaped later through waitpid in is_alive.
        Ok(child.id())
    }

    fn run_foreground(
        &self,
        program: &str,
        args: &[String],
        on_start: &mut dyn FnMut(u32),
    ) -> Result<DaemonExit> {
        debug!(program, ?args, "run in foreground");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| HotspotError::command(program, e.to_string()))?;
        on_start(child.id());
        match child.wait() {
            Ok(status) => Ok(DaemonExit { code: status.code() }),
            // Already reaped by a teardown polling it from another thread.
            Err(e) if e.raw_os_error() == Some(Errno::ECHILD as i32) => {
                debug!(program, "child reaped elsewhere");
                Ok(DaemonExit { code: None })
            }
            Err(e) => Err(HotspotError::command(program, format!("waiting for exit: {}", e))),
        }
    }

    fn signal(&self, pid: u32, sig: ProcessSignal) -> Result<SignalOutcome> {
        let sig = match sig {
            ProcessSignal::Terminate => Signal::SIGTERM,
            ProcessSignal::Kill => Signal::SIGKILL,
        };
        match signal::kill(Pid::from_raw(pid as i32), sig) {
            Ok(()) => Ok(SignalOutcome::Delivered),
            Err(Errno::ESRCH) => Ok(SignalOutcome::AlreadyGone),
            Err(e) => Err(HotspotError::command("kill", format!("PID {}: {}", pid, e))),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        let pid = Pid::from_raw(pid as i32);
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(_) => false,
            // Not our child: fall back to probing with signal 0.
            Err(Errno::ECHILD) => signal::kill(pid, None).is_ok(),
            Err(_) => false,
        }
    }
}

/// Executable named `name` in the colon-separated `search_path`.
pub fn find_program_in(name: &str, search_path: &str) -> Option<PathBuf> {
    which::which_in(name, Some(search_path), "/").ok()
}

/// Looks for a combination allowing `AP` beside `managed` in the
/// "valid interface combinations" block of `iw phy <phy> info`.
pub fn parse_ap_concurrency(info: &str) -> bool {
    let mut entries: Vec<String> = Vec::new();
    let mut in_combinations = false;
    for line in info.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("valid interface combinations") {
            in_combinations = true;
            continue;
        }
        if !in_combinations {
            continue;
        }
        if let Some(entry) = trimmed.strip_prefix('*') {
            entries.push(entry.trim().to_string());
        } else if trimmed.starts_with("total") || trimmed.starts_with("#{") {
            // iw wraps long combinations onto continuation lines
            if let Some(last) = entries.last_mut() {
                last.push(' ');
                last.push_str(trimmed);
            }
        } else {
            in_combinations = false;
        }
    }
    entries.iter().any(|entry| combination_allows_ap(entry))
}

// e.g. "#{ managed } <= 1, #{ AP, P2P-client } <= 1, total <= 2, #channels <= 1"
fn combination_allows_ap(entry: &str) -> bool {
    let has_managed = entry.contains("managed");
    let has_ap = entry
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '-')
        .any(|word| word == "AP");
    let total = entry
        .split("total <=")
        .nth(1)
        .and_then(|rest| rest.trim().split(|c: char| !c.is_ascii_digit()).next())
        .and_then(|n| n.parse::<u32>().ok())
        .unwrap_or(0);
    has_managed && has_ap && total >= 2
}

/// Channel number from `iw dev <iface> info` ("channel 6 (2437 MHz), ...").
pub fn parse_channel(info: &str) -> Option<u32> {
    info.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("channel "))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|n| n.parse().ok())
}

/// Interface names from `ip -o link show` output ("3: br0: <...> ...").
pub fn parse_link_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split(':').nth(1))
        .map(|name| name.trim())
        .map(|name| name.split('@').next().unwrap_or(name).to_string())
        .filter(|name| !name.is_empty())
        .collect()
}
