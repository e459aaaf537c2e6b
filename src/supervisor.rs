use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{SessionConfig, ShareMethod};
use crate::error::{HotspotError, Result};
use crate::registry::ResourceRegistry;
use crate::resource::ResourceHandle;
use crate::system::{DaemonExit, SystemOps};
use crate::templates;

/// Below this many bits of kernel entropy hostapd can stall on key generation.
pub const LOW_ENTROPY: u32 = 1000;

const HOSTAPD: &str = "hostapd";
const DNSMASQ: &str = "dnsmasq";
const HAVEGED: &str = "haveged";

pub fn marker_path(scratch: &Path, program: &str) -> PathBuf {
    scratch.join(format!("{}.pid", program))
}

fn write_marker(scratch: &Path, program: &str, pid: u32) -> Option<PathBuf> {
    let marker = marker_path(scratch, program);
    match fs::write(&marker, pid.to_string()) {
        Ok(()) => Some(marker),
        Err(e) => {
            warn!(program, pid, "could not write PID marker: {}", e);
            None
        }
    }
}

/// Starts a background process and registers it, with its PID marker, for
/// termination at teardown.
pub fn spawn_tracked(
    ops: &dyn SystemOps,
    registry: &ResourceRegistry,
    scratch: &Path,
    program: &str,
    args: &[String],
) -> Result<u32> {
    debug!(program, "spawning {} {}", program, args.join(" "));
    let pid = ops.spawn(program, args)?;
    let marker = write_marker(scratch, program, pid);
    registry.register(ResourceHandle::child_process(program, pid, marker.as_deref()));
    Ok(pid)
}

/// Drops the handle and PID marker of a child that has exited and been
/// reaped, so teardown never signals whatever reuses its PID.
pub fn forget_exited(registry: &ResourceRegistry, scratch: &Path, program: &str, pid: u32) {
    registry.forget_process(pid);
    let marker = marker_path(scratch, program);
    if let Err(e) = fs::remove_file(&marker) {
        debug!(program, pid, "could not remove {}: {}", marker.display(), e);
    }
}

/// Programs the session cannot run without.
pub fn missing_programs(ops: &dyn SystemOps, method: ShareMethod) -> Vec<&'static str> {
    let mut required = vec!["iw", "ip", HOSTAPD];
    match method {
        ShareMethod::None => required.push(DNSMASQ),
        ShareMethod::Nat => required.extend([DNSMASQ, "iptables"]),
        ShareMethod::Bridge => required.push("dhclient"),
    }
    required
        .into_iter()
        .filter(|program| ops.find_program(program).is_none())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    AuxStarted,
    ServiceStarted,
    ForegroundRunning,
    Exited,
}

/// Starts haveged, dnsmasq and hostapd, in that order and never out of it.
pub struct ProcessSupervisor<'a> {
    ops: &'a dyn SystemOps,
    registry: &'a ResourceRegistry,
    scratch: &'a Path,
    readiness: Duration,
    state: SupervisorState,
}

impl<'a> ProcessSupervisor<'a> {
    pub fn new(
        ops: &'a dyn SystemOps,
        registry: &'a ResourceRegistry,
        scratch: &'a Path,
        readiness: Duration,
    ) -> Self {
        ProcessSupervisor {
            ops,
            registry,
            scratch,
            readiness,
            state: SupervisorState::Idle,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    fn transition(&mut self, service: &str, from: SupervisorState, to: SupervisorState) -> Result<()> {
        if self.state != from {
            return Err(HotspotError::ServiceStart {
                service: service.to_string(),
                reason: format!("supervisor is {:?}, expected {:?}", self.state, from),
            });
        }
        debug!("supervisor {:?} -> {:?}", from, to);
        self.state = to;
        Ok(())
    }

    /// Writes hostapd and, when needed, dnsmasq configuration into the
    /// scratch directory.
    pub fn write_configs(
        &self,
        config: &SessionConfig,
        channel: u32,
        bridge: Option<&str>,
    ) -> Result<(PathBuf, Option<PathBuf>)> {
        let ctrl_dir = self.scratch.join("hostapd_ctrl");
        let hostapd = self.scratch.join("hostapd.conf");
        fs::write(&hostapd, templates::hostapd_conf(config, channel, bridge, &ctrl_dir)?)?;

        let dnsmasq = match templates::dnsmasq_conf(config)? {
            Some(contents) => {
                let path = self.scratch.join("dnsmasq.conf");
                fs::write(&path, contents)?;
                Some(path)
            }
            None => None,
        };
        Ok((hostapd, dnsmasq))
    }

    /// Entropy booster. Best effort: nothing here can fail the session.
    pub fn spawn_supporting(&mut self) -> Result<()> {
        self.transition(HAVEGED, SupervisorState::Idle, SupervisorState::AuxStarted)?;

        let entropy = match self.ops.entropy_available() {
            Ok(entropy) => entropy,
            Err(e) => {
                debug!("could not read available entropy: {}", e);
                return Ok(());
            }
        };
        if entropy >= LOW_ENTROPY {
            return Ok(());
        }
        if self.ops.find_program(HAVEGED).is_none() {
            warn!(entropy, "entropy is low and haveged is not installed");
            return Ok(());
        }

        let args = ["-F", "-w", "1024"].map(String::from);
        match spawn_tracked(self.ops, self.registry, self.scratch, HAVEGED, &args) {
            Ok(pid) => info!(pid, entropy, "started haveged"),
            Err(e) => warn!("could not start haveged: {}", e),
        }
        Ok(())
    }

    /// DHCP and DNS for the clients. Skipped when `conf` is `None`.
    pub fn spawn_service(&mut self, conf: Option<&Path>) -> Result<()> {
        self.transition(DNSMASQ, SupervisorState::AuxStarted, SupervisorState::ServiceStarted)?;
        let Some(conf) = conf else {
            debug!("no DHCP service needed");
            return Ok(());
        };

        let service_error = |reason: String| HotspotError::ServiceStart {
            service: DNSMASQ.to_string(),
            reason,
        };
        let args = vec!["-k".to_string(), "-C".to_string(), conf.display().to_string()];
        let pid = spawn_tracked(self.ops, self.registry, self.scratch, DNSMASQ, &args)
            .map_err(|e| service_error(e.to_string()))?;

        thread::sleep(self.readiness);
        if !self.ops.is_alive(pid) {
            forget_exited(self.registry, self.scratch, DNSMASQ, pid);
            return Err(service_error(format!("exited within {:?} of starting", self.readiness)));
        }
        info!(pid, "dnsmasq running");
        Ok(())
    }

    /// Runs hostapd and blocks until it exits.
    pub fn run_foreground(&mut self, conf: &Path) -> Result<DaemonExit> {
        self.transition(
            HOSTAPD,
            SupervisorState::ServiceStarted,
            SupervisorState::ForegroundRunning,
        )?;

        let args = vec![conf.display().to_string()];
        let (registry, scratch) = (self.registry, self.scratch);
        let mut started = None;
        let mut on_start = |pid: u32| {
            let marker = write_marker(scratch, HOSTAPD, pid);
            registry.register(ResourceHandle::child_process(HOSTAPD, pid, marker.as_deref()));
            info!(pid, "hostapd started");
            started = Some(pid);
        };

        let result = self.ops.run_foreground(HOSTAPD, &args, &mut on_start);
        self.state = SupervisorState::Exited;

        let exit = match (result, started) {
            (Ok(exit), Some(pid)) => {
                forget_exited(registry, scratch, HOSTAPD, pid);
                exit
            }
            (Ok(exit), None) => exit,
            // Still registered: teardown terminates it.
            (Err(e), Some(pid)) => {
                return Err(HotspotError::command(HOSTAPD, format!("lost track of PID {}: {}", pid, e)));
            }
            (Err(e), None) => {
                return Err(HotspotError::ServiceStart {
                    service: HOSTAPD.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        if !exit.success() {
            return Err(HotspotError::UnexpectedDaemonExit {
                daemon: HOSTAPD.to_string(),
                code: exit.code,
            });
        }
        info!("hostapd exited");
        Ok(exit)
    }
}
