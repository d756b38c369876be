//! Book-keeping for one entry of the local port pool.

use std::sync::Arc;
use std::time::Duration;

use crate::connection::AmsConnection;
use crate::dispatcher::NotificationDispatcher;
use crate::net_id::AmsAddr;

/// A notification subscription owned by a local port. Closing the port (or
///  deleting the subscription) needs all of this: the remote address and
///  handle for the delete round-trip, the dispatcher to unregister local
///  delivery, and the connection to send the delete on.
pub struct NotificationBinding {
    pub remote: AmsAddr,
    pub handle: u32,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub connection: Arc<AmsConnection>,
}

/// One slot of the local port pool. Port number zero marks a closed slot.
pub struct AmsPort {
    port: u16,
    pub timeout: Duration,
    pub notifications: Vec<NotificationBinding>,
}

impl AmsPort {
    pub fn closed(default_timeout: Duration) -> AmsPort {
        AmsPort {
            port: 0,
            timeout: default_timeout,
            notifications: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.port != 0
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn open(&mut self, port: u16) {
        debug_assert!(!self.is_open());
        self.port = port;
    }

    /// Mark the slot closed and hand its notification bindings to the caller,
    ///  who is responsible for the remote delete round-trips. The timeout
    ///  reverts to the default so a later re-open starts fresh.
    pub fn close(&mut self, default_timeout: Duration) -> Vec<NotificationBinding> {
        self.port = 0;
        self.timeout = default_timeout;
        std::mem::take(&mut self.notifications)
    }

    /// Remove one binding by its remote address and handle.
    pub fn take_notification(&mut self, remote: AmsAddr, handle: u32) -> Option<NotificationBinding> {
        let index = self.notifications.iter()
            .position(|b| b.remote == remote && b.handle == handle)?;
        Some(self.notifications.swap_remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let mut port = AmsPort::closed(Duration::from_secs(5));
        assert!(!port.is_open());
        assert_eq!(port.port(), 0);

        port.open(30004);
        assert!(port.is_open());
        assert_eq!(port.port(), 30004);

        port.timeout = Duration::from_secs(1);
        let bindings = port.close(Duration::from_secs(5));
        assert!(bindings.is_empty());
        assert!(!port.is_open());
        assert_eq!(port.timeout, Duration::from_secs(5));
    }
}
