use anyhow::Context;
use std::fs;
use std::path::Path;
use std::process;
use std::sync::{Arc, Once};
use tracing::{debug, info, warn};

use crate::error::{HotspotError, Result};
use crate::registry::UnwindReport;
use crate::resource::{terminate, ResourceKind};
use crate::session::{Session, SessionState};
use crate::system::DaemonExit;

/// The single teardown path for hostapd exit, setup failure and termination
/// signals alike. Daemons stop first, then the scratch directory goes, then
/// the registry unwinds the rest in reverse acquisition order.
pub struct TeardownCoordinator {
    session: Arc<Session>,
    once: Once,
}

impl TeardownCoordinator {
    pub fn new(session: Arc<Session>) -> Self {
        TeardownCoordinator {
            session,
            once: Once::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Releases everything the session holds. Only the first call acts and
    /// returns a report; concurrent callers wait for it to finish.
    pub fn teardown(&self) -> Option<UnwindReport> {
        let mut report = None;
        self.once.call_once(|| report = Some(self.release_all()));
        report
    }

    fn release_all(&self) -> UnwindReport {
        let session = &self.session;
        session.advance(SessionState::TearingDown);
        info!("tearing down");

        let registry = session.registry();
        let mut report = registry.unwind_kind(ResourceKind::ChildProcess);
        if let Some(scratch) = session.scratch_dir() {
            self.reap_leftover_markers(&scratch, &mut report);
        }
        report.merge(registry.unwind_kind(ResourceKind::ScratchDirectory));
        report.merge(registry.unwind_all());

        for failure in &report.failures {
            eprintln!("Warning: could not release {}", failure);
        }
        session.advance(SessionState::Terminated);
        info!(
            released = report.released.len(),
            failed = report.failures.len(),
            "teardown complete"
        );
        report
    }

    /// Terminates processes whose PID marker outlived their handle.
    fn reap_leftover_markers(&self, scratch: &Path, report: &mut UnwindReport) {
        let entries = match fs::read_dir(scratch) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("scratch directory unreadable: {}", e);
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "pid") {
                continue;
            }
            let pid = fs::read_to_string(&path)
                .ok()
                .and_then(|contents| contents.trim().parse::<u32>().ok());
            let Some(pid) = pid else {
                warn!("ignoring unreadable PID marker {}", path.display());
                continue;
            };

            let label = format!("leftover {}[{}]", path.display(), pid);
            match terminate(self.session.ops(), pid, self.session.policy()) {
                Ok(()) => report.released.push(label),
                Err(e) => report.failures.push(format!("{}: {}", label, e)),
            }
            if let Err(e) = fs::remove_file(&path) {
                debug!("could not remove {}: {}", path.display(), e);
            }
        }
    }

    /// Runs the session and always tears it down afterwards.
    pub fn run(&self) -> Result<DaemonExit> {
        let result = self.session.run();
        match &result {
            Err(HotspotError::Interrupted) => info!("session interrupted"),
            Err(e) => warn!("session failed: {}", e),
            Ok(_) => {}
        }
        self.teardown();
        result
    }

    /// Tears the session down on SIGINT, SIGTERM or SIGHUP and exits with
    /// status 0: stopping the access point is what the operator asked for.
    /// Install before anything is acquired.
    pub fn install_signal_handler(self: &Arc<Self>) -> anyhow::Result<()> {
        let coordinator = Arc::clone(self);
        ctrlc::set_handler(move || {
            eprintln!();
            info!("termination signal received");
            coordinator.teardown();
            process::exit(0);
        })
        .context("failed to install termination handler")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShareMethod;
    use crate::mock::{test_session, MockSystem};
    use crate::system::SystemOps;
    use std::sync::Weak;
    use std::thread;

    fn host() -> Arc<MockSystem> {
        let mock = Arc::new(MockSystem::new());
        mock.add_wifi("wlan0", "phy0");
        mock.add_ethernet("eth0");
        mock
    }

    /// Tears `coord` down from inside the mock's `op`, as a signal landing
    /// mid-acquisition would.
    fn teardown_during(mock: &MockSystem, op: &str, coord: &Arc<TeardownCoordinator>) {
        let coord: Weak<TeardownCoordinator> = Arc::downgrade(coord);
        mock.on_op(op, move || {
            if let Some(coord) = coord.upgrade() {
                coord.teardown();
            }
        });
    }

    fn coordinator(
        mock: &Arc<MockSystem>,
        method: ShareMethod,
        passphrase: Option<&str>,
        root: &Path,
    ) -> TeardownCoordinator {
        TeardownCoordinator::new(Arc::new(test_session(mock, method, passphrase, root)))
    }

    #[test]
    fn nat_session_leaves_nothing_behind() {
        let mock = host();
        let root = tempfile::TempDir::new().unwrap();
        let coord = coordinator(&mock, ShareMethod::Nat, Some("12345678"), root.path());

        coord.run().unwrap();

        assert!(!mock.interface_exists("wlan0ap"));
        assert!(mock.rules().is_empty());
        assert_eq!(mock.ip_forward(), "0");
        assert!(!mock.running("dnsmasq"));
        assert!(!mock.running("hostapd"));
        assert!(!coord.session().scratch_dir().unwrap().exists());
        assert_eq!(coord.session().state(), SessionState::Terminated);
        assert!(coord.session().registry().is_drained());
    }

    #[test]
    fn virtual_interface_gone_for_every_method() {
        for method in [ShareMethod::None, ShareMethod::Nat, ShareMethod::Bridge] {
            let mock = host();
            let root = tempfile::TempDir::new().unwrap();
            let coord = coordinator(&mock, method, None, root.path());
            coord.run().unwrap();
            assert!(!mock.interface_exists("wlan0ap"), "{} left the interface", method);
            assert!(mock.bridges().is_empty(), "{} left a bridge", method);
        }
    }

    #[test]
    fn open_network_without_sharing() {
        let mock = Arc::new(MockSystem::new());
        mock.add_wifi("wlan0", "phy0");
        let root = tempfile::TempDir::new().unwrap();
        let coord = coordinator(&mock, ShareMethod::None, None, root.path());
        coord.session().run().unwrap();

        let conf = fs::read_to_string(coord.session().scratch_dir().unwrap().join("hostapd.conf")).unwrap();
        assert!(!conf.contains("wpa"));
        let snap = mock.snapshot().unwrap();
        assert!(snap.rules.is_empty());
        assert_eq!(snap.interfaces["wlan0ap"].addrs, vec!["192.168.12.1/24"]);

        coord.teardown().unwrap();
        assert!(!mock.interface_exists("wlan0ap"));
    }

    #[test]
    fn hostapd_start_failure_cleans_up() {
        let mock = host();
        mock.fail_spawn("hostapd");
        let root = tempfile::TempDir::new().unwrap();
        let coord = coordinator(&mock, ShareMethod::Nat, Some("12345678"), root.path());

        let err = coord.run().unwrap_err();
        assert!(matches!(err, HotspotError::ServiceStart { .. }));
        assert!(!mock.running("dnsmasq"));
        assert!(!mock.interface_exists("wlan0ap"));
        assert!(mock.rules().is_empty());
    }

    #[test]
    fn unexpected_hostapd_exit_is_reported_after_cleanup() {
        let mock = host();
        mock.set_foreground_exit(Some(1));
        let root = tempfile::TempDir::new().unwrap();
        let coord = coordinator(&mock, ShareMethod::Nat, None, root.path());

        let err = coord.run().unwrap_err();
        assert!(matches!(err, HotspotError::UnexpectedDaemonExit { code: Some(1), .. }));
        assert!(!mock.interface_exists("wlan0ap"));
        assert_eq!(mock.ip_forward(), "0");
    }

    #[test]
    fn second_teardown_does_nothing() {
        let mock = host();
        let root = tempfile::TempDir::new().unwrap();
        let coord = coordinator(&mock, ShareMethod::Nat, None, root.path());
        coord.session().run().unwrap();

        let report = coord.teardown().unwrap();
        assert!(report.is_clean());
        let ops_after_first = mock.ops();

        assert!(coord.teardown().is_none());
        assert_eq!(mock.ops(), ops_after_first);
    }

    #[test]
    fn concurrent_teardowns_release_once() {
        let mock = host();
        let root = tempfile::TempDir::new().unwrap();
        let coord = Arc::new(coordinator(&mock, ShareMethod::Nat, None, root.path()));
        coord.session().run().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let coord = Arc::clone(&coord);
                thread::spawn(move || coord.teardown().is_some())
            })
            .collect();
        let acted = handles.into_iter().map(|h| h.join().unwrap()).filter(|acted| *acted).count();
        assert_eq!(acted, 1);
        assert!(mock.rules().is_empty());
    }

    #[test]
    fn children_stop_before_interface_is_deleted() {
        let mock = host();
        let root = tempfile::TempDir::new().unwrap();
        let coord = coordinator(&mock, ShareMethod::Nat, None, root.path());
        coord.run().unwrap();

        let ops = mock.ops();
        let teardown_start = ops.iter().position(|op| op.starts_with("kill ")).unwrap();
        let del = ops.iter().position(|op| op == "iw dev wlan0ap del").unwrap();
        let rule = ops.iter().position(|op| op.contains("-D ")).unwrap();
        assert!(teardown_start < rule);
        assert!(rule < del);
    }

    #[test]
    fn leftover_markers_are_terminated() {
        let mock = host();
        let root = tempfile::TempDir::new().unwrap();
        let coord = coordinator(&mock, ShareMethod::None, None, root.path());
        coord.session().run().unwrap();

        let stray = mock.add_process("dnsmasq");
        let scratch = coord.session().scratch_dir().unwrap();
        fs::write(scratch.join("stray.pid"), format!("{}\n", stray)).unwrap();

        let report = coord.teardown().unwrap();
        assert!(!mock.is_alive(stray));
        assert!(report.released.iter().any(|r| r.contains("stray.pid")));
        assert!(!scratch.exists());
    }

    #[test]
    fn failure_before_scratch_directory_still_tears_down() {
        let mock = host();
        let coord = coordinator(&mock, ShareMethod::None, None, Path::new("/nonexistent/wifi-hotspot-root"));

        let err = coord.run().unwrap_err();
        assert!(matches!(err, HotspotError::Io(_)));
        assert!(mock.ops().is_empty());
        assert_eq!(coord.session().state(), SessionState::Terminated);
    }

    #[test]
    fn teardown_while_hostapd_runs_is_an_interruption() {
        let mock = host();
        let root = tempfile::TempDir::new().unwrap();
        let coord = Arc::new(coordinator(&mock, ShareMethod::Nat, None, root.path()));
        teardown_during(&mock, "run_foreground", &coord);

        let err = coord.run().unwrap_err();
        assert!(matches!(err, HotspotError::Interrupted));
        // stopped by the teardown before its wait returned
        assert!(mock.spawned("hostapd").is_some());
        assert!(!mock.snapshot().unwrap().running.iter().any(|p| p.name == "hostapd"));
        assert!(!mock.running("dnsmasq"));
        assert!(!mock.interface_exists("wlan0ap"));
        assert!(mock.rules().is_empty());
        assert_eq!(coord.session().state(), SessionState::Terminated);
    }

    #[test]
    fn teardown_during_rule_insertion_releases_later_acquisitions() {
        let mock = host();
        let root = tempfile::TempDir::new().unwrap();
        let coord = Arc::new(coordinator(&mock, ShareMethod::Nat, Some("12345678"), root.path()));
        teardown_during(&mock, "insert_rule", &coord);

        let err = coord.run().unwrap_err();
        assert!(matches!(err, HotspotError::Interrupted));

        // both rules and the forwarding switch came after the teardown
        let ops = mock.ops();
        assert_eq!(ops.iter().filter(|op| op.contains(" -I ")).count(), 2);
        assert_eq!(ops.iter().filter(|op| op.contains(" -D ")).count(), 2);
        assert!(mock.rules().is_empty());
        assert_eq!(mock.ip_forward(), "0");

        assert!(!mock.interface_exists("wlan0ap"));
        assert!(mock.spawned("dnsmasq").is_none());
        assert!(mock.spawned("hostapd").is_none());
        assert!(!coord.session().scratch_dir().unwrap().exists());
        assert_eq!(coord.session().state(), SessionState::Terminated);
        assert!(coord.session().registry().is_empty());
    }

    #[test]
    fn teardown_during_interface_creation_deletes_it() {
        let mock = host();
        let root = tempfile::TempDir::new().unwrap();
        let coord = Arc::new(coordinator(&mock, ShareMethod::Bridge, None, root.path()));
        teardown_during(&mock, "create_ap_interface", &coord);

        let err = coord.run().unwrap_err();
        assert!(matches!(err, HotspotError::Interrupted));

        let ops = mock.ops();
        let add = ops.iter().position(|op| op.contains("interface add wlan0ap")).unwrap();
        let del = ops.iter().position(|op| op == "iw dev wlan0ap del").unwrap();
        assert!(add < del);
        assert!(!mock.interface_exists("wlan0ap"));
        assert!(mock.bridges().is_empty());
        assert!(mock.spawned("dhclient").is_none());
        assert!(mock.spawned("hostapd").is_none());
        assert_eq!(coord.session().state(), SessionState::Terminated);
        assert!(coord.session().registry().is_drained());
    }
}
