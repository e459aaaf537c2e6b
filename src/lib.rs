//! Temporary WiFi Access Point Library
//!
//! This library turns a wireless interface into a short-lived access point
//! and optionally shares an Internet connection with its clients. It drives
//! `iw`, `ip`, `iptables`, NetworkManager, `hostapd`, `dnsmasq`, `dhclient`
//! and `haveged`, and gives back every resource it took when the session
//! ends, fails or is interrupted.
//!
//! # Modules
//!
//! - [`config`] - Session configuration, validation and the defaults file
//! - [`error`] - Custom error types for the library
//! - [`interface`] - Virtual AP interface and NetworkManager registration
//! - [`prompt`] - Reading the SSID and passphrase from the terminal or stdin
//! - [`registry`] - Stack of acquired resources, released in reverse
//! - [`resource`] - Resource handles and how each one is undone
//! - [`session`] - The acquisition sequence of one access point session
//! - [`sharing`] - NAT, bridge or no Internet sharing
//! - [`supervisor`] - hostapd, dnsmasq and haveged process supervision
//! - [`system`] - Typed access to the host's networking tools
//! - [`teardown`] - The single, idempotent teardown path
//! - [`templates`] - hostapd and dnsmasq configuration rendering
//!
//! # Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use wifi_hotspot::config::{Defaults, SessionConfig, SessionRequest};
//! use wifi_hotspot::{Session, SessionOptions, System, TeardownCoordinator};
//!
//! let config = SessionConfig::new(
//!     SessionRequest {
//!         wifi_iface: "wlan0".to_string(),
//!         internet_iface: Some("eth0".to_string()),
//!         ssid: "MyAccessPoint".to_string(),
//!         passphrase: Some("MyPassPhrase".to_string()),
//!         ..Default::default()
//!     },
//!     &Defaults::default(),
//! )
//! .expect("invalid configuration");
//!
//! let session = Arc::new(Session::new(config, Arc::new(System::new()), SessionOptions::default()));
//! let coordinator = Arc::new(TeardownCoordinator::new(session));
//! coordinator.install_signal_handler().expect("signal handler");
//!
//! // Blocks until hostapd exits, then releases everything.
//! coordinator.run().expect("access point failed");
//! ```

/// Configuration module for the session and the optional defaults file.
/// Validates everything before any resource is touched.
pub mod config;

/// Error module defining custom error types for the library.
/// Uses `thiserror` for ergonomic error handling.
pub mod error;

/// Interface module for the virtual AP interface.
/// Creates, addresses and removes it, and keeps NetworkManager away from it.
pub mod interface;

/// Prompt module for credentials not given on the command line.
pub mod prompt;

/// Registry of acquired resources, unwound last-in first-out.
pub mod registry;

/// Resource handles and their undo actions.
pub mod resource;

/// Session module tying configuration, interface, sharing and daemons together.
pub mod session;

/// Sharing strategies for the Internet connection.
pub mod sharing;

/// Supervisor for the daemons the access point runs on.
pub mod supervisor;

/// System module wrapping every external tool behind the `SystemOps` trait.
pub mod system;

/// Teardown coordinator and termination signal handling.
pub mod teardown;

/// Templates module rendering hostapd and dnsmasq configuration with Tera.
pub mod templates;

#[cfg(test)]
mod mock;

// Re-export the main error type for library users
pub use error::{HotspotError, SharingFailure};

// Re-export the session entry points
pub use session::{Session, SessionOptions, SessionState};
pub use teardown::TeardownCoordinator;

// Re-export the real host implementation and its trait
pub use system::{System, SystemOps};
