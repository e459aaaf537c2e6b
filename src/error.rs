use thiserror::Error;

#[derive(Error, Debug)]
pub enum HotspotError {
    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("Failed to create virtual interface '{iface}': {reason}")]
    InterfaceCreation { iface: String, reason: String },

    #[error("Failed to set up sharing: {0}")]
    SharingSetup(#[from] SharingFailure),

    #[error("Failed to start {service}: {reason}")]
    ServiceStart { service: String, reason: String },

    #[error("{daemon} exited with {}", describe_exit(.code))]
    UnexpectedDaemonExit { daemon: String, code: Option<i32> },

    #[error("Session interrupted by teardown")]
    Interrupted,

    #[error("Failed to render {name}: {reason}")]
    Render { name: String, reason: String },

    #[error("Failed to execute {program}: {reason}")]
    CommandExecution { program: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SharingFailure {
    #[error("could not insert firewall rule: {0}")]
    RuleInsertion(String),

    #[error("no free bridge name among {0} candidates")]
    NoAvailableBridge(usize),

    #[error("could not obtain a DHCP lease on {0}")]
    LeaseAcquisition(String),

    #[error("could not toggle IPv4 forwarding: {0}")]
    Forwarding(String),

    #[error("bridge setup failed: {0}")]
    Bridge(String),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "no status (killed by signal)".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, HotspotError>;

impl HotspotError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        HotspotError::ConfigValidation(msg.into())
    }

    pub(crate) fn command(program: &str, reason: impl Into<String>) -> Self {
        HotspotError::CommandExecution {
            program: program.to_string(),
            reason: reason.into(),
        }
    }
}
