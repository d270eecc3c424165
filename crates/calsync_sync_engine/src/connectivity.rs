//! Connectivity signal fed to the engine.

use tokio::sync::watch;

/// Whether outbound network access looks usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
    /// The network is reachable.
    Online,
    /// The network is known to be down.
    Offline,
    /// No signal yet. Treated like offline.
    #[default]
    Unknown,
}

impl Connectivity {
    /// Returns true if the engine may send.
    pub fn is_online(&self) -> bool {
        matches!(self, Connectivity::Online)
    }
}

/// Creates a connectivity channel. The platform layer keeps the sender.
pub fn channel(initial: Connectivity) -> (watch::Sender<Connectivity>, watch::Receiver<Connectivity>) {
    watch::channel(initial)
}
