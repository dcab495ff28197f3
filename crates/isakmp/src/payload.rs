//! Parsed inbound records handed to the SA core
//!
//! The message parser is a separate collaborator. What reaches the core is
//! already decoded: the header fields used as table keys, and the
//! proposal/transform list of an SA payload. Constants follow RFC 2408.

use crate::cookie::{Cookies, MessageId, COOKIES_LEN, MESSAGE_ID_LEN};

/// ISAKMP header size (28 bytes)
pub const ISAKMP_HDR_SIZE: usize = 28;

/// Offset of the cookie pair in the header
pub const ISAKMP_HDR_COOKIES_OFF: usize = 0;

/// Offset of the exchange type in the header
pub const ISAKMP_HDR_EXCH_TYPE_OFF: usize = 18;

/// Offset of the message ID in the header
pub const ISAKMP_HDR_MESSAGE_ID_OFF: usize = 20;

/// Exchange types (RFC 2408 Section 3.1, RFC 2409 Section 5.5)
pub mod exchange {
    /// Base exchange
    pub const BASE: u8 = 1;
    /// Identity protection (main mode)
    pub const ID_PROT: u8 = 2;
    /// Authentication only
    pub const AUTH_ONLY: u8 = 3;
    /// Aggressive mode
    pub const AGGRESSIVE: u8 = 4;
    /// Informational
    pub const INFO: u8 = 5;
    /// Quick mode (IKE phase 2)
    pub const QUICK_MODE: u8 = 32;
    /// New group mode
    pub const NEW_GROUP_MODE: u8 = 33;
}

/// Protocol identifiers (RFC 2407 Section 4.4.1)
pub mod proto {
    /// ISAKMP itself
    pub const ISAKMP: u8 = 1;
    /// IPsec AH
    pub const IPSEC_AH: u8 = 2;
    /// IPsec ESP
    pub const IPSEC_ESP: u8 = 3;
    /// IP compression
    pub const IPCOMP: u8 = 4;
}

/// Notify message types (RFC 2408 Section 3.14.1)
pub mod notify {
    /// INVALID-PAYLOAD-TYPE
    pub const INVALID_PAYLOAD_TYPE: u16 = 1;
    /// DOI-NOT-SUPPORTED
    pub const DOI_NOT_SUPPORTED: u16 = 2;
    /// SITUATION-NOT-SUPPORTED
    pub const SITUATION_NOT_SUPPORTED: u16 = 3;
    /// INVALID-EXCHANGE-TYPE
    pub const INVALID_EXCHANGE_TYPE: u16 = 7;
    /// INVALID-PROTOCOL-ID
    pub const INVALID_PROTOCOL_ID: u16 = 10;
    /// INVALID-SPI
    pub const INVALID_SPI: u16 = 11;
    /// INVALID-TRANSFORM-ID
    pub const INVALID_TRANSFORM_ID: u16 = 12;
    /// ATTRIBUTES-NOT-SUPPORTED
    pub const ATTRIBUTES_NOT_SUPPORTED: u16 = 13;
    /// NO-PROPOSAL-CHOSEN
    pub const NO_PROPOSAL_CHOSEN: u16 = 14;
    /// PAYLOAD-MALFORMED
    pub const PAYLOAD_MALFORMED: u16 = 16;
    /// INVALID-KEY-INFORMATION
    pub const INVALID_KEY_INFORMATION: u16 = 17;
    /// INVALID-ID-INFORMATION
    pub const INVALID_ID_INFORMATION: u16 = 18;
    /// Highest error notification type
    pub const ERROR_MAX: u16 = 16383;
    /// CONNECTED status notification
    pub const STATUS_CONNECTED: u16 = 16384;
}

/// Fields of an ISAKMP header used by the SA core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsakmpHeader {
    /// Initiator ‖ responder cookies
    pub cookies: Cookies,
    /// Exchange type
    pub exchange_type: u8,
    /// Message ID
    pub message_id: MessageId,
}

impl IsakmpHeader {
    /// Pick the key fields out of a raw header
    ///
    /// Returns `None` for input shorter than a header: a truncated key is
    /// simply not found, never an error.
    pub fn from_bytes(msg: &[u8]) -> Option<Self> {
        if msg.len() < ISAKMP_HDR_SIZE {
            return None;
        }
        let cookies = Cookies::from_slice(
            &msg[ISAKMP_HDR_COOKIES_OFF..ISAKMP_HDR_COOKIES_OFF + COOKIES_LEN],
        )?;
        let message_id = MessageId::from_slice(
            &msg[ISAKMP_HDR_MESSAGE_ID_OFF..ISAKMP_HDR_MESSAGE_ID_OFF + MESSAGE_ID_LEN],
        )?;
        Some(IsakmpHeader {
            cookies,
            exchange_type: msg[ISAKMP_HDR_EXCH_TYPE_OFF],
            message_id,
        })
    }
}

/// Data attribute of a transform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    /// TV format: 15-bit type, 16-bit value
    Basic {
        /// Attribute type
        attr_type: u16,
        /// Value
        value: u16,
    },
    /// TLV format
    Variable {
        /// Attribute type
        attr_type: u16,
        /// Value bytes
        value: Vec<u8>,
    },
}

impl Attribute {
    /// Create a basic attribute
    pub fn basic(attr_type: u16, value: u16) -> Self {
        Attribute::Basic { attr_type, value }
    }

    /// Create a variable-length attribute
    pub fn variable(attr_type: u16, value: impl Into<Vec<u8>>) -> Self {
        Attribute::Variable {
            attr_type,
            value: value.into(),
        }
    }

    /// Attribute type
    pub fn attr_type(&self) -> u16 {
        match self {
            Attribute::Basic { attr_type, .. } | Attribute::Variable { attr_type, .. } => {
                *attr_type
            }
        }
    }

    /// Value as an integer; variable values up to four bytes are decoded big-endian
    pub fn value_u32(&self) -> Option<u32> {
        match self {
            Attribute::Basic { value, .. } => Some(u32::from(*value)),
            Attribute::Variable { value, .. } if !value.is_empty() && value.len() <= 4 => {
                Some(value.iter().fold(0u32, |acc, &b| acc << 8 | u32::from(b)))
            }
            Attribute::Variable { .. } => None,
        }
    }
}

/// One transform of a proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformPayload {
    /// Transform number
    pub no: u8,
    /// Transform identifier
    pub id: u8,
    /// SA attributes
    pub attributes: Vec<Attribute>,
}

impl TransformPayload {
    /// Create transform without attributes
    pub fn new(no: u8, id: u8) -> Self {
        TransformPayload {
            no,
            id,
            attributes: Vec::new(),
        }
    }

    /// Add attribute (builder style)
    pub fn with_attribute(mut self, attr: Attribute) -> Self {
        self.attributes.push(attr);
        self
    }
}

/// One proposal of an SA payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalPayload {
    /// Proposal number
    pub no: u8,
    /// Protocol identifier
    pub proto: u8,
    /// Sender's SPI (may be empty)
    pub spi: Vec<u8>,
    /// Offered transforms, in preference order
    pub transforms: Vec<TransformPayload>,
}

impl ProposalPayload {
    /// Create proposal without transforms
    pub fn new(no: u8, proto: u8, spi: impl Into<Vec<u8>>) -> Self {
        ProposalPayload {
            no,
            proto,
            spi: spi.into(),
            transforms: Vec::new(),
        }
    }

    /// Add transform (builder style)
    pub fn with_transform(mut self, xf: TransformPayload) -> Self {
        self.transforms.push(xf);
        self
    }
}

/// Decoded SA payload of an inbound message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SaPayload {
    /// Encoded situation, DOI-specific
    pub situation: Vec<u8>,
    /// Proposals in the order offered
    pub proposals: Vec<ProposalPayload>,
}
