//! Exchange records consumed by the SA core
//!
//! The exchange engine itself lives outside the core. This is the part of
//! an exchange that SA creation and the DOI drivers need: its identity, its
//! DOI binding with DOI-owned data, and the proposals chosen so far.

use std::fmt;
use std::sync::Arc;

use crate::cookie::{Cookies, MessageId};
use crate::doi::{Doi, ExchangeData};
use crate::payload::{ProposalPayload, TransformPayload};
use crate::sa::Phase;

/// A proposal chosen by the responder, with its accepted transform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Proposal the transform belongs to
    pub proposal: ProposalPayload,
    /// Accepted transform
    pub transform: TransformPayload,
}

/// An exchange in progress
pub struct Exchange {
    /// Exchange type
    pub exchange_type: u8,
    /// Are we the initiator?
    pub initiator: bool,
    /// Cookie pair
    pub cookies: Cookies,
    /// Message ID, zero in phase 1
    pub message_id: MessageId,
    /// Connection name, if configured
    pub name: Option<String>,
    /// Number of driver steps taken
    pub step: usize,
    /// Chosen protection suite (responder)
    pub chosen: Vec<Selection>,
    /// DOI-specific data
    pub data: ExchangeData,
    doi: Arc<dyn Doi>,
}

impl Exchange {
    /// Create an exchange bound to `doi`
    pub fn new(
        doi: Arc<dyn Doi>,
        exchange_type: u8,
        cookies: Cookies,
        message_id: MessageId,
        initiator: bool,
    ) -> Self {
        let data = doi.new_exchange_data();
        Exchange {
            exchange_type,
            initiator,
            cookies,
            message_id,
            name: None,
            step: 0,
            chosen: Vec::new(),
            data,
            doi,
        }
    }

    /// Set the connection name (builder style)
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Phase implied by the message ID
    pub fn phase(&self) -> Phase {
        Phase::from_message_id(&self.message_id)
    }

    /// DOI governing the exchange
    pub fn doi(&self) -> &Arc<dyn Doi> {
        &self.doi
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.doi.free_exchange_data(data);
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("exchange_type", &self.exchange_type)
            .field("initiator", &self.initiator)
            .field("cookies", &self.cookies)
            .field("message_id", &self.message_id)
            .field("doi", &self.doi.id())
            .field("step", &self.step)
            .finish()
    }
}
