//! Network attachments for virtual machines.

use axum::Router;
use parking_lot::Mutex;

/// Where a virtual machine's network interface plugs in.
///
/// Besides connectivity, a network serves the guest's metadata service,
/// answering with whatever handler the engine installs.
pub trait Network: Send + Sync {
    /// QEMU `-netdev` value for a backend named `id`.
    fn net_dev(&self, id: &str) -> String;

    /// Install the handler for metadata requests from the guest.
    fn set_handler(&self, handler: Router);

    /// Give the network back; it must not be used afterwards.
    fn release(self: Box<Self>);
}

/// QEMU user-mode networking (SLIRP): no host setup, no root.
#[derive(Default)]
pub struct UserNetwork {
    restrict: bool,
    handler: Mutex<Option<Router>>,
}

impl UserNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cut the guest off from everything but the host.
    pub fn with_restrict(mut self, restrict: bool) -> Self {
        self.restrict = restrict;
        self
    }

    /// The metadata handler, if one was installed.
    pub fn handler(&self) -> Option<Router> {
        self.handler.lock().clone()
    }
}

impl Network for UserNetwork {
    fn net_dev(&self, id: &str) -> String {
        let mut netdev = format!("user,id={}", id);
        if self.restrict {
            netdev.push_str(",restrict=on");
        }
        netdev
    }

    fn set_handler(&self, handler: Router) {
        *self.handler.lock() = Some(handler);
    }

    fn release(self: Box<Self>) {
        tracing::debug!("released user-mode network");
    }
}

impl std::fmt::Debug for UserNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserNetwork")
            .field("restrict", &self.restrict)
            .field("has_handler", &self.handler.lock().is_some())
            .finish()
    }
}
