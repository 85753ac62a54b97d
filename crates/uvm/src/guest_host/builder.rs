use super::GuestHost;
use crate::config::GuestHostConfig;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::UnixListener;
use uvm_core::{
    AccessGranter, ComputeSystem, GuestConnector, GuestOs, Host, ModifyRequest, NoAccessControl,
    Result, VerityReader,
};

/// The [`Host`] the managers of a [`GuestHost`] see: the compute system plus
/// the configured policy flags.
pub(crate) struct HostContext {
    id: String,
    os: GuestOs,
    devices_physically_backed: bool,
    disallow_writable_file_shares: bool,
    system: Arc<dyn ComputeSystem>,
}

impl HostContext {
    pub(crate) fn new(config: &GuestHostConfig, system: Arc<dyn ComputeSystem>) -> Self {
        Self {
            id: config.id.clone(),
            os: config.os,
            devices_physically_backed: config.devices_physically_backed,
            disallow_writable_file_shares: config.no_writable_file_shares,
            system,
        }
    }
}

#[async_trait]
impl Host for HostContext {
    fn id(&self) -> &str {
        &self.id
    }

    fn os(&self) -> GuestOs {
        self.os
    }

    fn devices_physically_backed(&self) -> bool {
        self.devices_physically_backed
    }

    fn disallow_writable_file_shares(&self) -> bool {
        self.disallow_writable_file_shares
    }

    async fn modify(&self, request: ModifyRequest) -> Result<()> {
        self.system.modify(&request).await
    }
}

/// Builder for [`GuestHost`].
///
/// # Example
///
/// ```rust,ignore
/// let host = GuestHost::builder(GuestHostConfig::new("vm-1", GuestOs::Linux), system)
///     .guest_connector(connector)
///     .log_listener(UnixListener::bind(&log_path)?)
///     .build();
/// host.start().await?;
/// ```
pub struct GuestHostBuilder {
    config: GuestHostConfig,
    system: Arc<dyn ComputeSystem>,
    connector: Option<Arc<dyn GuestConnector>>,
    entropy_listener: Option<UnixListener>,
    log_listener: Option<UnixListener>,
    access: Arc<dyn AccessGranter>,
    verity: Option<Arc<dyn VerityReader>>,
}

impl GuestHostBuilder {
    pub fn new(config: GuestHostConfig, system: Arc<dyn ComputeSystem>) -> Self {
        Self {
            config,
            system,
            connector: None,
            entropy_listener: None,
            log_listener: None,
            access: Arc::new(NoAccessControl),
            verity: None,
        }
    }

    /// Connects to the guest agent once the system is powered on.
    pub fn guest_connector(mut self, connector: Arc<dyn GuestConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Socket the guest reads its entropy seed from.
    pub fn entropy_listener(mut self, listener: UnixListener) -> Self {
        self.entropy_listener = Some(listener);
        self
    }

    /// Socket the guest writes its log stream to.
    pub fn log_listener(mut self, listener: UnixListener) -> Self {
        self.log_listener = Some(listener);
        self
    }

    pub fn access_granter(mut self, access: Arc<dyn AccessGranter>) -> Self {
        self.access = access;
        self
    }

    pub fn verity_reader(mut self, verity: Arc<dyn VerityReader>) -> Self {
        self.verity = Some(verity);
        self
    }

    pub fn build(self) -> GuestHost {
        GuestHost::new(
            self.config,
            self.system,
            self.connector,
            self.entropy_listener,
            self.log_listener,
            self.access,
            self.verity,
        )
    }
}
