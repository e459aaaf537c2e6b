use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{SessionConfig, ShareMethod};
use crate::error::{HotspotError, Result, SharingFailure};
use crate::registry::ResourceRegistry;
use crate::resource::ResourceHandle;
use crate::supervisor::{forget_exited, spawn_tracked};
use crate::system::{FirewallRule, SystemOps};

/// Bridge names probed, `br0` upwards.
pub const BRIDGE_CANDIDATES: usize = 100;

pub struct SharingContext<'a> {
    pub ops: &'a dyn SystemOps,
    pub registry: &'a ResourceRegistry,
    pub config: &'a SessionConfig,
    pub scratch: &'a Path,
    /// How long a freshly started DHCP client must survive.
    pub readiness: Duration,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SharingOutcome {
    /// Bridge hostapd must add the access point to.
    pub bridge: Option<String>,
}

/// How the access point's clients reach the Internet interface.
pub trait SharingStrategy {
    fn method(&self) -> ShareMethod;
    fn enable(&self, ctx: &SharingContext<'_>) -> Result<SharingOutcome>;
}

pub fn strategy_for(method: ShareMethod) -> Box<dyn SharingStrategy> {
    match method {
        ShareMethod::None => Box::new(NoSharing),
        ShareMethod::Nat => Box::new(NatSharing),
        ShareMethod::Bridge => Box::new(BridgeSharing),
    }
}

fn internet_iface<'a>(ctx: &SharingContext<'a>) -> Result<&'a str> {
    ctx.config.internet_iface.as_deref().ok_or_else(|| {
        HotspotError::invalid(format!("sharing method '{}' needs an Internet interface", ctx.config.method))
    })
}

/// Clients only reach the host itself.
pub struct NoSharing;

impl SharingStrategy for NoSharing {
    fn method(&self) -> ShareMethod {
        ShareMethod::None
    }

    fn enable(&self, _ctx: &SharingContext<'_>) -> Result<SharingOutcome> {
        debug!("no Internet sharing");
        Ok(SharingOutcome::default())
    }
}

/// Masquerade the access point's subnet behind the Internet interface.
pub struct NatSharing;

impl SharingStrategy for NatSharing {
    fn method(&self) -> ShareMethod {
        ShareMethod::Nat
    }

    fn enable(&self, ctx: &SharingContext<'_>) -> Result<SharingOutcome> {
        let internet = internet_iface(ctx)?;
        let subnet = ctx
            .config
            .subnet()
            .ok_or_else(|| HotspotError::invalid("NAT needs a gateway address"))?;

        let saved = ctx
            .ops
            .read_ip_forward()
            .map_err(|e| SharingFailure::Forwarding(e.to_string()))?;

        let rules = [
            FirewallRule::Masquerade {
                out_iface: internet.to_string(),
                source: subnet.clone(),
            },
            FirewallRule::AcceptForward {
                in_iface: ctx.config.virtual_iface.clone(),
                source: subnet,
            },
        ];
        for rule in rules {
            ctx.ops
                .insert_rule(&rule)
                .map_err(|e| SharingFailure::RuleInsertion(e.to_string()))?;
            ctx.registry.register(ResourceHandle::nat_rule(rule));
        }

        ctx.ops
            .write_ip_forward("1")
            .map_err(|e| SharingFailure::Forwarding(e.to_string()))?;
        ctx.registry.register(ResourceHandle::forwarding(&saved));

        info!(internet, "NAT enabled (ip_forward was {})", saved);
        Ok(SharingOutcome::default())
    }
}

/// Put the access point and the Internet interface on one bridge.
pub struct BridgeSharing;

impl SharingStrategy for BridgeSharing {
    fn method(&self) -> ShareMethod {
        ShareMethod::Bridge
    }

    fn enable(&self, ctx: &SharingContext<'_>) -> Result<SharingOutcome> {
        let internet = internet_iface(ctx)?;
        let bridge_error = |e: HotspotError| SharingFailure::Bridge(e.to_string());

        let existing = ctx.ops.list_bridges().map_err(bridge_error)?;
        let bridge = select_bridge_name(&existing)?;

        ctx.ops.create_bridge(&bridge).map_err(bridge_error)?;
        ctx.registry.register(ResourceHandle::bridge(&bridge));

        ctx.ops.attach_to_bridge(&bridge, internet).map_err(bridge_error)?;
        ctx.ops.set_link(&bridge, true).map_err(bridge_error)?;

        let args = vec!["-d".to_string(), bridge.clone()];
        let pid = spawn_tracked(ctx.ops, ctx.registry, ctx.scratch, "dhclient", &args)
            .map_err(|e| SharingFailure::LeaseAcquisition(format!("{}: {}", bridge, e)))?;
        thread::sleep(ctx.readiness);
        if !ctx.ops.is_alive(pid) {
            forget_exited(ctx.registry, ctx.scratch, "dhclient", pid);
            return Err(SharingFailure::LeaseAcquisition(bridge).into());
        }

        info!(bridge = bridge.as_str(), internet, "bridge ready");
        Ok(SharingOutcome { bridge: Some(bridge) })
    }
}

/// First of `br0..br99` not already present.
pub fn select_bridge_name(existing: &[String]) -> std::result::Result<String, SharingFailure> {
    (0..BRIDGE_CANDIDATES)
        .map(|i| format!("br{}", i))
        .find(|name| !existing.contains(name))
        .ok_or(SharingFailure::NoAvailableBridge(BRIDGE_CANDIDATES))
}

/// A radio that is already associated can only serve on its current channel.
pub fn effective_channel(requested: u32, current: Option<u32>) -> u32 {
    match current {
        Some(current) if current != requested => {
            info!(
                requested,
                current,
                "radio is already on channel {}, using it instead of {}",
                current,
                requested
            );
            current
        }
        _ => requested,
    }
}

pub fn resolve_channel(ops: &dyn SystemOps, config: &SessionConfig) -> u32 {
    let current = ops.current_channel(&config.wifi_iface).unwrap_or_else(|e| {
        debug!("could not read current channel: {}", e);
        None
    });
    effective_channel(config.channel, current)
}
