use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::error::{HotspotError, Result};
use crate::interface::{bring_up, create_virtual_interface, register_as_unmanaged};
use crate::registry::ResourceRegistry;
use crate::resource::{ResourceHandle, TerminatePolicy};
use crate::sharing::{resolve_channel, strategy_for, SharingContext};
use crate::supervisor::ProcessSupervisor;
use crate::system::{DaemonExit, SystemOps};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Created,
    InterfaceReady,
    SharingReady,
    Serving,
    TearingDown,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub terminate: TerminatePolicy,
    /// How long a freshly started daemon must stay alive to count as started.
    pub readiness: Duration,
    /// Where the scratch directory is created.
    pub scratch_root: PathBuf,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            terminate: TerminatePolicy::default(),
            readiness: Duration::from_millis(500),
            scratch_root: env::temp_dir(),
        }
    }
}

/// Owns the configuration, the host handle and the registry of everything
/// acquired. Shared with the signal handler through an `Arc`.
pub struct Session {
    config: SessionConfig,
    ops: Arc<dyn SystemOps>,
    registry: ResourceRegistry,
    options: SessionOptions,
    state: Mutex<SessionState>,
    scratch: Mutex<Option<PathBuf>>,
}

impl Session {
    pub fn new(config: SessionConfig, ops: Arc<dyn SystemOps>, options: SessionOptions) -> Self {
        let registry = ResourceRegistry::new(ops.clone(), options.terminate);
        Session {
            config,
            ops,
            registry,
            options,
            state: Mutex::new(SessionState::Created),
            scratch: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn ops(&self) -> &dyn SystemOps {
        self.ops.as_ref()
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &TerminatePolicy {
        &self.options.terminate
    }

    pub fn scratch_dir(&self) -> Option<PathBuf> {
        self.scratch.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn state_lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> SessionState {
        *self.state_lock()
    }

    /// Moves the session forward. Backward moves are ignored, so a teardown
    /// that already started cannot be undone by a late acquisition step.
    pub fn advance(&self, next: SessionState) -> bool {
        let mut state = self.state_lock();
        if next <= *state {
            debug!("ignoring session transition {:?} -> {:?}", *state, next);
            return false;
        }
        info!("session {:?} -> {:?}", *state, next);
        *state = next;
        true
    }

    fn create_scratch(&self) -> Result<PathBuf> {
        let path = tempfile::Builder::new()
            .prefix("wifi-hotspot.")
            .tempdir_in(&self.options.scratch_root)?
            .keep();
        *self.scratch.lock().unwrap_or_else(|e| e.into_inner()) = Some(path.clone());
        self.registry.register(ResourceHandle::scratch_directory(&path));
        debug!("scratch directory {}", path.display());
        Ok(path)
    }

    /// Stops acquisition once a teardown has begun.
    fn ensure_active(&self) -> Result<()> {
        if self.state() >= SessionState::TearingDown {
            return Err(HotspotError::Interrupted);
        }
        Ok(())
    }

    /// Acquires everything in order and blocks on hostapd. Does not tear
    /// down; the caller must always run the teardown afterwards. Returns
    /// [`HotspotError::Interrupted`] whenever a teardown started while it ran,
    /// whatever the acquisition step saw.
    pub fn run(&self) -> Result<DaemonExit> {
        let result = self.acquire_and_serve();
        if self.state() >= SessionState::TearingDown {
            if let Err(e) = &result {
                debug!("after teardown: {}", e);
            }
            return Err(HotspotError::Interrupted);
        }
        result
    }

    fn acquire_and_serve(&self) -> Result<DaemonExit> {
        let ops = self.ops.as_ref();
        let config = &self.config;
        let scratch = self.create_scratch()?;

        let channel = resolve_channel(ops, config);

        let vif = create_virtual_interface(ops, &self.registry, &config.wifi_iface)?;
        self.ensure_active()?;
        register_as_unmanaged(ops, &self.registry, &vif)?;
        bring_up(ops, &self.registry, &vif, config.gateway)?;
        self.ensure_active()?;
        self.advance(SessionState::InterfaceReady);

        let ctx = SharingContext {
            ops,
            registry: &self.registry,
            config,
            scratch: &scratch,
            readiness: self.options.readiness,
        };
        let outcome = strategy_for(config.method).enable(&ctx)?;
        self.ensure_active()?;
        self.advance(SessionState::SharingReady);

        self.serve(&scratch, channel, outcome.bridge.as_deref())
    }

    fn serve(&self, scratch: &Path, channel: u32, bridge: Option<&str>) -> Result<DaemonExit> {
        let mut supervisor =
            ProcessSupervisor::new(self.ops.as_ref(), &self.registry, scratch, self.options.readiness);
        let (hostapd_conf, dnsmasq_conf) = supervisor.write_configs(&self.config, channel, bridge)?;

        supervisor.spawn_supporting()?;
        supervisor.spawn_service(dnsmasq_conf.as_deref())?;
        self.ensure_active()?;
        self.advance(SessionState::Serving);
        println!(
            "Access point '{}' on {} (channel {})",
            self.config.ssid, self.config.virtual_iface, channel
        );
        supervisor.run_foreground(&hostapd_conf)
    }
}
