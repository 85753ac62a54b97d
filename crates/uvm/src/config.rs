use serde::{Deserialize, Serialize};
use std::time::Duration;
use uvm_core::GuestOs;

/// How [`GuestHost::close`](crate::GuestHost::close) stops a running guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownPolicy {
    /// Ask the guest to shut down before resorting to terminate.
    #[serde(default)]
    pub graceful: bool,
    /// Upper bound on waiting for the guest to exit once stopped.
    #[serde(default)]
    pub timeout: Option<Duration>,
}

/// Static configuration of a guest host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestHostConfig {
    pub id: String,
    pub os: GuestOs,
    pub scsi_controller_count: u8,
    pub shutdown: ShutdownPolicy,
    pub devices_physically_backed: bool,
    pub no_writable_file_shares: bool,
    pub vsmb_no_direct_map: bool,
    /// Bound on waiting for the entropy and log listeners during start.
    pub start_timeout: Duration,
}

impl Default for GuestHostConfig {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            os: GuestOs::Linux,
            scsi_controller_count: 1,
            shutdown: ShutdownPolicy::default(),
            devices_physically_backed: false,
            no_writable_file_shares: false,
            vsmb_no_direct_map: false,
            start_timeout: Duration::from_secs(120),
        }
    }
}

impl GuestHostConfig {
    pub fn new(id: impl Into<String>, os: GuestOs) -> Self {
        Self {
            id: id.into(),
            os,
            ..Default::default()
        }
    }

    pub fn with_scsi_controllers(mut self, count: u8) -> Self {
        self.scsi_controller_count = count;
        self
    }

    /// Enables graceful shutdown on close, optionally bounded by `timeout`.
    pub fn with_graceful_shutdown(mut self, timeout: Option<Duration>) -> Self {
        self.shutdown = ShutdownPolicy {
            graceful: true,
            timeout,
        };
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown.timeout = Some(timeout);
        self
    }

    pub fn with_physically_backed_devices(mut self) -> Self {
        self.devices_physically_backed = true;
        self
    }

    pub fn with_no_writable_file_shares(mut self) -> Self {
        self.no_writable_file_shares = true;
        self
    }

    pub fn with_vsmb_no_direct_map(mut self) -> Self {
        self.vsmb_no_direct_map = true;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }
}
