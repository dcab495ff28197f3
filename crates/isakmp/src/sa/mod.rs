//! Security Associations
//!
//! An SA is the negotiated state of one cryptographic context: phase 1
//! (the ISAKMP control channel, keyed by cookies alone) or phase 2 (an
//! application SA negotiated under a phase 1 SA, keyed by cookies and
//! message ID).
//!
//! # Lifecycle
//!
//! ```text
//! create ──► Negotiating ──finalize──► Ready ──soft expiry──► Fading
//!                                        │                      │
//!                                        └──── newer SA ────► Replaced
//!                                                               │
//!        hard expiry / delete / last release ─────────────────► Freed
//! ```
//!
//! SAs live in the [`table`] arena and are addressed by [`SaHandle`].
//! Ownership is shared explicitly: table membership and every armed expiry
//! timer each hold one reference; the SA is torn down when the last
//! reference is released.

pub mod arena;
pub mod proto;
pub mod table;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;

use crate::cookie::{Cookies, MessageId};
use crate::credentials::{KeyState, PolicySession, ReceivedCert};
use crate::doi::{Doi, SaData};
use crate::timer::TimerId;
use crate::transport::Transport;
use crate::{Error, Result};

pub use arena::{Released, SaHandle};
pub use proto::{Proto, INITIATOR, RESPONDER};
pub use table::{ResizePolicy, SaTable};

/// Negotiation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Phase {
    /// ISAKMP SA (control channel)
    One,
    /// Application SA negotiated under an ISAKMP SA
    Two,
}

impl Phase {
    /// Numeric phase, 1 or 2
    pub fn as_u8(self) -> u8 {
        match self {
            Phase::One => 1,
            Phase::Two => 2,
        }
    }

    /// Phase implied by a message ID: zero is phase 1
    pub fn from_message_id(message_id: &MessageId) -> Self {
        if message_id.is_zero() {
            Phase::One
        } else {
            Phase::Two
        }
    }
}

/// SA flags
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SaFlags(u32);

impl SaFlags {
    /// Keys and protocol suites are final
    pub const READY: u32 = 0x01;
    /// Renegotiate instead of silently expiring
    pub const STAYALIVE: u32 = 0x02;
    /// Past soft expiry, still usable
    pub const FADING: u32 = 0x04;
    /// Superseded by a newer SA
    pub const REPLACED: u32 = 0x08;
    /// Negotiated on demand (kernel acquire)
    pub const ONDEMAND: u32 = 0x10;

    const NAMES: [(u32, &'static str); 5] = [
        (Self::READY, "ready"),
        (Self::STAYALIVE, "stayalive"),
        (Self::FADING, "fading"),
        (Self::REPLACED, "replaced"),
        (Self::ONDEMAND, "ondemand"),
    ];

    /// Create flags from raw bits
    pub fn new(bits: u32) -> Self {
        SaFlags(bits)
    }

    /// Raw bits
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Are all bits of `flag` set?
    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    /// Set `flag`
    pub fn insert(&mut self, flag: u32) {
        self.0 |= flag;
    }

    /// Clear `flag`
    pub fn remove(&mut self, flag: u32) {
        self.0 &= !flag;
    }

    /// Flag bit for a configuration name such as `"stayalive"`
    pub fn from_name(name: &str) -> Option<u32> {
        Self::NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(bit, _)| *bit)
    }
}

impl FromStr for SaFlags {
    type Err = Error;

    /// Parse a comma separated flag list, e.g. `"stayalive,ondemand"`
    fn from_str(s: &str) -> Result<Self> {
        let mut flags = SaFlags::default();
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let bit = SaFlags::from_name(name)
                .ok_or_else(|| Error::Config(format!("unknown SA flag: {}", name)))?;
            flags.insert(bit);
        }
        Ok(flags)
    }
}

impl fmt::Debug for SaFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SaFlags(0x{:x})", self.0)
    }
}

impl fmt::Display for SaFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join(","))
        }
    }
}

/// Lifecycle state derived from the flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaState {
    /// Negotiation in progress
    Negotiating,
    /// Established and usable
    Ready,
    /// Soft lifetime passed, rekey on next use
    Fading,
    /// Superseded by a newer SA
    Replaced,
}

/// Security Association
pub struct SecurityAssociation {
    cookies: Cookies,
    message_id: MessageId,
    phase: Phase,
    doi: Arc<dyn Doi>,
    transport: Option<Arc<dyn Transport>>,

    /// Negotiated protocol suites, in proposal order
    pub protos: Vec<Proto>,
    /// Lifecycle flags
    pub flags: SaFlags,
    /// Connection name from configuration
    pub name: Option<String>,
    /// Did we initiate the negotiation?
    pub initiator: bool,
    /// Exchange type that created the SA
    pub exch_type: u8,
    /// Key state from the crypto layer
    pub keystate: Option<KeyState>,
    /// Negotiated key length in bytes
    pub key_len: usize,
    /// Lifetime in seconds, zero for unlimited
    pub seconds: u64,
    /// Lifetime in kilobytes, zero for unlimited
    pub kilobytes: u64,
    /// DOI-specific data
    pub data: SaData,
    /// Initiator identity payload body
    pub id_i: Vec<u8>,
    /// Responder identity payload body
    pub id_r: Vec<u8>,
    /// Last message sent, for retransmission on duplicate requests
    pub last_sent: Option<Bytes>,
    /// Certificate received from the peer
    pub recv_cert: Option<ReceivedCert>,
    /// Public key received from the peer
    pub recv_key: Option<Vec<u8>>,
    /// Session held with the policy engine
    pub policy_session: Option<Box<dyn PolicySession>>,

    pub(crate) soft_timer: Option<TimerId>,
    pub(crate) hard_timer: Option<TimerId>,
}

impl SecurityAssociation {
    /// Create an SA bound to `doi`
    ///
    /// The phase follows from the message ID. DOI data is allocated through
    /// the DOI.
    pub fn new(cookies: Cookies, message_id: MessageId, doi: Arc<dyn Doi>) -> Self {
        let data = doi.new_sa_data();
        SecurityAssociation {
            cookies,
            message_id,
            phase: Phase::from_message_id(&message_id),
            doi,
            transport: None,
            protos: Vec::new(),
            flags: SaFlags::default(),
            name: None,
            initiator: false,
            exch_type: 0,
            keystate: None,
            key_len: 0,
            seconds: 0,
            kilobytes: 0,
            data,
            id_i: Vec::new(),
            id_r: Vec::new(),
            last_sent: None,
            recv_cert: None,
            recv_key: None,
            policy_session: None,
            soft_timer: None,
            hard_timer: None,
        }
    }

    /// Cookie pair
    pub fn cookies(&self) -> &Cookies {
        &self.cookies
    }

    /// Message ID (all-zero for phase 1)
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Negotiation phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// DOI governing this SA
    pub fn doi(&self) -> &Arc<dyn Doi> {
        &self.doi
    }

    /// Transport of a phase 1 SA
    pub fn transport(&self) -> Option<&Arc<dyn Transport>> {
        self.transport.as_ref()
    }

    pub(crate) fn set_transport(&mut self, transport: Option<Arc<dyn Transport>>) {
        self.transport = transport;
    }

    pub(crate) fn take_transport(&mut self) -> Option<Arc<dyn Transport>> {
        self.transport.take()
    }

    pub(crate) fn cookies_mut(&mut self) -> &mut Cookies {
        &mut self.cookies
    }

    /// Lifecycle state
    pub fn state(&self) -> SaState {
        if self.flags.contains(SaFlags::REPLACED) {
            SaState::Replaced
        } else if self.flags.contains(SaFlags::FADING) {
            SaState::Fading
        } else if self.flags.contains(SaFlags::READY) {
            SaState::Ready
        } else {
            SaState::Negotiating
        }
    }

    /// Is the soft expiry timer armed?
    pub fn soft_armed(&self) -> bool {
        self.soft_timer.is_some()
    }

    /// Is the hard expiry timer armed?
    pub fn hard_armed(&self) -> bool {
        self.hard_timer.is_some()
    }

    /// Proto with proposal number `no`
    pub fn proto_by_no(&self, no: u8) -> Option<&Proto> {
        self.protos.iter().find(|p| p.no == no)
    }

    /// Our identity and the peer's, in that order
    pub fn local_remote_ids(&self) -> (&[u8], &[u8]) {
        if self.initiator {
            (self.id_i.as_slice(), self.id_r.as_slice())
        } else {
            (self.id_r.as_slice(), self.id_i.as_slice())
        }
    }
}

impl fmt::Debug for SecurityAssociation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityAssociation")
            .field("cookies", &self.cookies)
            .field("message_id", &self.message_id)
            .field("phase", &self.phase)
            .field("doi", &self.doi.id())
            .field("flags", &self.flags)
            .field("name", &self.name)
            .field("protos", &self.protos)
            .field("seconds", &self.seconds)
            .finish()
    }
}
