//! The side of the device executor the session driver calls directly.
//!
//! Everything else reaches the executor through [crate::dispatch].

/// Synchronous entry points of a device executor
pub trait DeviceExecutor: Send + Sync {
    /// Cancel the URB submitted with `seqnum`, if it is still in flight.
    ///
    /// Called from the session worker; must not block on the transfer.
    fn unlink(&self, seqnum: u32);

    /// The connection is gone: drop claims on the device so the next
    /// client can import it again.
    fn release(&self) {}
}
