//! Callbacks into the exchange engine
//!
//! The SA core decides *when* a delete or notification goes out and when
//! an SA must be renegotiated; building and sending the messages is the
//! exchange engine's job. It plugs in through [`ExchangeHooks`].

use crate::sa::{Proto, SecurityAssociation};

/// Exchange engine operations the SA core calls
///
/// Every method defaults to a no-op.
pub trait ExchangeHooks: Send {
    /// Send a DELETE for `proto` of `sa` to the peer
    fn send_delete(&mut self, _sa: &SecurityAssociation, _proto: &Proto) {}

    /// Send notification `notify_type` about `sa` to the peer
    fn send_notify(&mut self, _sa: &SecurityAssociation, _notify_type: u16) {}

    /// Start a new negotiation to replace `sa`
    fn reestablish(&mut self, _sa: &SecurityAssociation) {}
}

/// Hooks that do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHooks;

impl ExchangeHooks for NullHooks {}
