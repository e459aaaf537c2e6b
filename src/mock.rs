use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{Defaults, SessionConfig, SessionRequest, ShareMethod};
use crate::error::{HotspotError, Result};
use crate::resource::TerminatePolicy;
use crate::session::{Session, SessionOptions};
use crate::system::{DaemonExit, FirewallRule, ProcessSignal, SignalOutcome, SystemOps};

#[derive(Debug, Clone)]
pub struct MockIface {
    pub wireless: bool,
    pub phy: Option<String>,
    pub mac: String,
    pub up: bool,
    pub addrs: Vec<String>,
    pub master: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MockProcess {
    pub name: String,
    pub args: Vec<String>,
    pub alive: bool,
    pub ignores_sigterm: bool,
}

/// What the host looked like while the foreground daemon was running.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub interfaces: BTreeMap<String, MockIface>,
    pub rules: Vec<FirewallRule>,
    pub ip_forward: String,
    pub running: Vec<MockProcess>,
}

#[derive(Debug)]
struct State {
    interfaces: BTreeMap<String, MockIface>,
    bridges: Vec<String>,
    channels: BTreeMap<String, u32>,
    concurrent_ap: bool,
    ip_forward: String,
    rules: Vec<FirewallRule>,
    nm_config: Option<PathBuf>,
    programs: HashSet<String>,
    entropy: u32,
    processes: BTreeMap<u32, MockProcess>,
    next_pid: u32,
    next_mac: u8,
    failing: HashSet<String>,
    spawn_failures: HashSet<String>,
    dies_on_start: HashSet<String>,
    foreground_exit: DaemonExit,
    lose_foreground: bool,
    snapshot: Option<Snapshot>,
    ops: Vec<String>,
}

type Hook = Box<dyn FnOnce() + Send>;

pub struct MockSystem {
    state: Mutex<State>,
    hooks: Mutex<Vec<(String, Hook)>>,
}

fn fail(op: &str) -> HotspotError {
    HotspotError::command(op, "simulated failure")
}

impl MockSystem {
    pub fn new() -> Self {
        let programs = ["hostapd", "dnsmasq", "dhclient", "iw", "ip", "iptables"]
            .into_iter()
            .map(String::from)
            .collect();
        MockSystem {
            state: Mutex::new(State {
                interfaces: BTreeMap::new(),
                bridges: Vec::new(),
                channels: BTreeMap::new(),
                concurrent_ap: true,
                ip_forward: "0".to_string(),
                rules: Vec::new(),
                nm_config: None,
                programs,
                entropy: 3000,
                processes: BTreeMap::new(),
                next_pid: 1000,
                next_mac: 1,
                failing: HashSet::new(),
                spawn_failures: HashSet::new(),
                dies_on_start: HashSet::new(),
                foreground_exit: DaemonExit { code: Some(0) },
                lose_foreground: false,
                snapshot: None,
                ops: Vec::new(),
            }),
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// A host with none of the external tools installed.
    pub fn without_programs() -> Self {
        let mock = Self::new();
        mock.lock().programs.clear();
        mock
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn add_iface(&self, name: &str, wireless: bool, phy: Option<&str>) {
        let mut st = self.lock();
        let mac = format!("02:00:00:00:00:{:02x}", st.next_mac);
        st.next_mac += 1;
        st.interfaces.insert(
            name.to_string(),
            MockIface {
                wireless,
                phy: phy.map(String::from),
                mac,
                up: false,
                addrs: Vec::new(),
                master: None,
            },
        );
    }

    pub fn add_wifi(&self, name: &str, phy: &str) {
        self.add_iface(name, true, Some(phy));
    }

    pub fn add_ethernet(&self, name: &str) {
        self.add_iface(name, false, None);
    }

    pub fn add_bridge(&self, name: &str) {
        self.add_iface(name, false, None);
        self.lock().bridges.push(name.to_string());
    }

    pub fn set_current_channel(&self, iface: &str, channel: u32) {
        self.lock().channels.insert(iface.to_string(), channel);
    }

    pub fn set_concurrent_ap(&self, supported: bool) {
        self.lock().concurrent_ap = supported;
    }

    pub fn set_ip_forward(&self, value: &str) {
        self.lock().ip_forward = value.to_string();
    }

    pub fn ip_forward(&self) -> String {
        self.lock().ip_forward.clone()
    }

    pub fn set_nm_config(&self, path: PathBuf) {
        self.lock().nm_config = Some(path);
    }

    pub fn add_program(&self, name: &str) {
        self.lock().programs.insert(name.to_string());
    }

    pub fn set_entropy(&self, entropy: u32) {
        self.lock().entropy = entropy;
    }

    /// Makes the named operation (a `SystemOps` method name) fail.
    pub fn fail_on(&self, op: &str) {
        self.lock().failing.insert(op.to_string());
    }

    pub fn fail_spawn(&self, program: &str) {
        self.lock().spawn_failures.insert(program.to_string());
    }

    pub fn dies_on_start(&self, program: &str) {
        self.lock().dies_on_start.insert(program.to_string());
    }

    pub fn set_foreground_exit(&self, code: Option<i32>) {
        self.lock().foreground_exit = DaemonExit { code };
    }

    /// The foreground wait fails after the daemon has started.
    pub fn fail_foreground_wait(&self) {
        self.lock().lose_foreground = true;
    }

    /// Runs `hook` once, on the first `op` call, before the operation itself.
    /// `run_foreground` fires after the daemon has started.
    pub fn on_op(&self, op: &str, hook: impl FnOnce() + Send + 'static) {
        self.hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((op.to_string(), Box::new(hook)));
    }

    fn fire(&self, op: &str) {
        let hook = {
            let mut hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
            hooks
                .iter()
                .position(|(name, _)| name == op)
                .map(|idx| hooks.remove(idx).1)
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn add_process(&self, name: &str) -> u32 {
        let mut st = self.lock();
        let pid = st.next_pid;
        st.next_pid += 1;
        st.processes.insert(
            pid,
            MockProcess {
                name: name.to_string(),
                args: Vec::new(),
                alive: true,
                ignores_sigterm: false,
            },
        );
        pid
    }

    pub fn ignore_sigterm(&self, pid: u32) {
        if let Some(process) = self.lock().processes.get_mut(&pid) {
            process.ignores_sigterm = true;
        }
    }

    pub fn interface(&self, name: &str) -> Option<MockIface> {
        self.lock().interfaces.get(name).cloned()
    }

    pub fn rules(&self) -> Vec<FirewallRule> {
        self.lock().rules.clone()
    }

    pub fn bridges(&self) -> Vec<String> {
        self.lock().bridges.clone()
    }

    pub fn running(&self, name: &str) -> bool {
        self.lock().processes.values().any(|p| p.alive && p.name == name)
    }

    pub fn spawned(&self, name: &str) -> Option<MockProcess> {
        self.lock().processes.values().find(|p| p.name == name).cloned()
    }

    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }

    pub fn snapshot(&self) -> Option<Snapshot> {
        self.lock().snapshot.clone()
    }

    fn check(&self, op: &str) -> Result<()> {
        self.fire(op);
        if self.lock().failing.contains(op) { Err(fail(op)) } else { Ok(()) }
    }

    fn record(st: &mut State, op: String) {
        st.ops.push(op);
    }

    fn start_process(&self, program: &str, args: &[String]) -> Result<u32> {
        let mut st = self.lock();
        if st.spawn_failures.contains(program) || !st.programs.contains(program) {
            return Err(HotspotError::command(program, "No such file or directory"));
        }
        let pid = st.next_pid;
        st.next_pid += 1;
        let alive = !st.dies_on_start.contains(program);
        st.processes.insert(
            pid,
            MockProcess {
                name: program.to_string(),
                args: args.to_vec(),
                alive,
                ignores_sigterm: false,
            },
        );
        Self::record(&mut st, format!("spawn {} {}", program, args.join(" ")));
        Ok(pid)
    }
}

impl SystemOps for MockSystem {
    fn interface_exists(&self, iface: &str) -> bool {
        self.lock().interfaces.contains_key(iface)
    }

    fn is_wireless(&self, iface: &str) -> bool {
        self.lock().interfaces.get(iface).is_some_and(|i| i.wireless)
    }

    fn phy_of(&self, iface: &str) -> Result<String> {
        self.lock()
            .interfaces
            .get(iface)
            .and_then(|i| i.phy.clone())
            .ok_or_else(|| fail("phy_of"))
    }

    fn supports_concurrent_ap(&self, _phy: &str) -> Result<bool> {
        self.check("supports_concurrent_ap")?;
        Ok(self.lock().concurrent_ap)
    }

    fn current_channel(&self, iface: &str) -> Result<Option<u32>> {
        Ok(self.lock().channels.get(iface).copied())
    }

    fn create_ap_interface(&self, physical: &str, name: &str) -> Result<()> {
        self.check("create_ap_interface")?;
        let phy = {
            let st = self.lock();
            if st.interfaces.contains_key(name) {
                return Err(HotspotError::command("iw", "File exists"));
            }
            st.interfaces
                .get(physical)
                .and_then(|i| i.phy.clone())
                .ok_or_else(|| HotspotError::command("iw", "No such device"))?
        };
        self.add_wifi(name, &phy);
        let mut st = self.lock();
        Self::record(&mut st, format!("iw dev {} interface add {} type __ap", physical, name));
        Ok(())
    }

    fn delete_interface(&self, name: &str) -> Result<()> {
        self.check("delete_interface")?;
        let mut st = self.lock();
        if st.interfaces.remove(name).is_none() {
            return Err(HotspotError::command("iw", "No such device"));
        }
        Self::record(&mut st, format!("iw dev {} del", name));
        Ok(())
    }

    fn hardware_address(&self, iface: &str) -> Result<String> {
        self.lock()
            .interfaces
            .get(iface)
            .map(|i| i.mac.clone())
            .ok_or_else(|| fail("hardware_address"))
    }

    fn flush_addresses(&self, iface: &str) -> Result<()> {
        self.check("flush_addresses")?;
        let mut st = self.lock();
        let entry = st.interfaces.get_mut(iface).ok_or_else(|| fail("flush_addresses"))?;
        entry.addrs.clear();
        Self::record(&mut st, format!("ip addr flush dev {}", iface));
        Ok(())
    }

    fn add_address(&self, iface: &str, addr: Ipv4Addr, prefix: u8) -> Result<()> {
        self.check("add_address")?;
        let mut st = self.lock();
        let entry = st.interfaces.get_mut(iface).ok_or_else(|| fail("add_address"))?;
        entry.addrs.push(format!("{}/{}", addr, prefix));
        Self::record(&mut st, format!("ip addr add {}/{} dev {}", addr, prefix, iface));
        Ok(())
    }

    fn set_link(&self, iface: &str, up: bool) -> Result<()> {
        self.check("set_link")?;
        let mut st = self.lock();
        let entry = st.interfaces.get_mut(iface).ok_or_else(|| fail("set_link"))?;
        entry.up = up;
        Self::record(&mut st, format!("ip link set dev {} {}", iface, if up { "up" } else { "down" }));
        Ok(())
    }

    fn read_ip_forward(&self) -> Result<String> {
        self.check("read_ip_forward")?;
        Ok(self.lock().ip_forward.clone())
    }

    fn write_ip_forward(&self, value: &str) -> Result<()> {
        self.check("write_ip_forward")?;
        let mut st = self.lock();
        st.ip_forward = value.to_string();
        Self::record(&mut st, format!("write ip_forward {}", value));
        Ok(())
    }

    fn insert_rule(&self, rule: &FirewallRule) -> Result<()> {
        self.check("insert_rule")?;
        let mut st = self.lock();
        st.rules.insert(0, rule.clone());
        Self::record(&mut st, format!("iptables {}", rule.iptables_args("-I").join(" ")));
        Ok(())
    }

    fn delete_rule(&self, rule: &FirewallRule) -> Result<()> {
        self.check("delete_rule")?;
        let mut st = self.lock();
        let pos = st
            .rules
            .iter()
            .position(|r| r == rule)
            .ok_or_else(|| HotspotError::command("iptables", "Bad rule (does a matching rule exist in that chain?)"))?;
        st.rules.remove(pos);
        Self::record(&mut st, format!("iptables {}", rule.iptables_args("-D").join(" ")));
        Ok(())
    }

    fn list_bridges(&self) -> Result<Vec<String>> {
        self.check("list_bridges")?;
        Ok(self.lock().bridges.clone())
    }

    fn create_bridge(&self, name: &str) -> Result<()> {
        self.check("create_bridge")?;
        self.add_bridge(name);
        let mut st = self.lock();
        Self::record(&mut st, format!("ip link add name {} type bridge", name));
        Ok(())
    }

    fn delete_bridge(&self, name: &str) -> Result<()> {
        self.check("delete_bridge")?;
        let mut st = self.lock();
        st.interfaces.remove(name);
        st.bridges.retain(|b| b != name);
        for iface in st.interfaces.values_mut() {
            if iface.master.as_deref() == Some(name) {
                iface.master = None;
            }
        }
        Self::record(&mut st, format!("ip link delete {} type bridge", name));
        Ok(())
    }

    fn attach_to_bridge(&self, bridge: &str, member: &str) -> Result<()> {
        self.check("attach_to_bridge")?;
        let mut st = self.lock();
        let entry = st.interfaces.get_mut(member).ok_or_else(|| fail("attach_to_bridge"))?;
        entry.master = Some(bridge.to_string());
        Self::record(&mut st, format!("ip link set dev {} master {}", member, bridge));
        Ok(())
    }

    fn network_manager_config(&self) -> Option<PathBuf> {
        self.lock().nm_config.clone()
    }

    fn reload_network_manager(&self) -> Result<()> {
        let mut st = self.lock();
        Self::record(&mut st, "nmcli general reload conf".to_string());
        Ok(())
    }

    fn find_program(&self, name: &str) -> Option<PathBuf> {
        self.lock()
            .programs
            .contains(name)
            .then(|| PathBuf::from("/usr/sbin").join(name))
    }

    fn entropy_available(&self) -> Result<u32> {
        Ok(self.lock().entropy)
    }

    fn spawn(&self, program: &str, args: &[String]) -> Result<u32> {
        self.start_process(program, args)
    }

    fn run_foreground(
        &self,
        program: &str,
        args: &[String],
        on_start: &mut dyn FnMut(u32),
    ) -> Result<DaemonExit> {
        let pid = self.start_process(program, args)?;
        on_start(pid);
        self.fire("run_foreground");

        let mut st = self.lock();
        if st.lose_foreground {
            return Err(HotspotError::command(program, "simulated wait failure"));
        }
        // killed while it ran, as by a termination signal
        let killed = st.processes.get(&pid).is_some_and(|p| !p.alive);
        let snapshot = Snapshot {
            interfaces: st.interfaces.clone(),
            rules: st.rules.clone(),
            ip_forward: st.ip_forward.clone(),
            running: st.processes.values().filter(|p| p.alive).cloned().collect(),
        };
        st.snapshot = Some(snapshot);
        if let Some(process) = st.processes.get_mut(&pid) {
            process.alive = false;
        }
        if killed {
            return Ok(DaemonExit { code: None });
        }
        Ok(st.foreground_exit)
    }

    fn signal(&self, pid: u32, sig: ProcessSignal) -> Result<SignalOutcome> {
        let mut st = self.lock();
        let (flag, outcome) = match st.processes.get_mut(&pid) {
            Some(process) if process.alive => {
                if sig == ProcessSignal::Kill || !process.ignores_sigterm {
                    process.alive = false;
                }
                let flag = if sig == ProcessSignal::Kill { "KILL" } else { "TERM" };
                (flag, SignalOutcome::Delivered)
            }
            _ => return Ok(SignalOutcome::AlreadyGone),
        };
        Self::record(&mut st, format!("kill -{} {}", flag, pid));
        Ok(outcome)
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.lock().processes.get(&pid).is_some_and(|p| p.alive)
    }
}

/// A session on `wlan0` (sharing through `eth0` unless `method` is none)
/// with no grace or readiness delays.
pub fn test_session(
    mock: &Arc<MockSystem>,
    method: ShareMethod,
    passphrase: Option<&str>,
    scratch_root: &Path,
) -> Session {
    let internet = (method != ShareMethod::None).then(|| "eth0".to_string());
    let config = SessionConfig::new(
        SessionRequest {
            wifi_iface: "wlan0".to_string(),
            internet_iface: internet,
            ssid: "TestNet".to_string(),
            passphrase: passphrase.map(String::from),
            method: Some(method),
            ..Default::default()
        },
        &Defaults::default(),
    )
    .expect("test configuration is valid");
    Session::new(
        config,
        mock.clone(),
        SessionOptions {
            terminate: TerminatePolicy {
                grace: Duration::ZERO,
                poll: Duration::ZERO,
            },
            readiness: Duration::ZERO,
            scratch_root: scratch_root.to_path_buf(),
        },
    )
}
