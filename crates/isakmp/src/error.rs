//! Error types for the SA core
//!
//! One error type covers table operations, lifecycle misuse, resource
//! exhaustion and DOI validation failures. Validation failures carry enough
//! information to pick the ISAKMP notify message sent back to the peer.

use std::fmt;

use crate::payload::notify;

/// Result type for SA core operations
pub type Result<T> = std::result::Result<T, Error>;

/// SA core errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid configuration
    Config(String),

    /// No DOI registered under this domain identifier
    DoiNotSupported(u32),

    /// A DOI with this domain identifier is already registered
    DoiAlreadyRegistered(u32),

    /// Security Association not found (stale handle or already deleted)
    SaNotFound(String),

    /// Resource limit reached (timers, SPIs, table size)
    ResourceExhausted(String),

    /// Operation not valid in the SA's current state
    InvalidState(String),

    /// Situation field rejected by the DOI
    SituationNotSupported(u32),

    /// Exchange type not valid for this DOI or role
    InvalidExchangeType(u8),

    /// Protocol identifier rejected by the DOI
    InvalidProtocolId(u8),

    /// SPI rejected by the DOI
    InvalidSpi(Vec<u8>),

    /// Transform identifier rejected for its protocol
    InvalidTransformId {
        /// Protocol the transform belongs to
        proto: u8,
        /// Rejected transform identifier
        transform: u8,
    },

    /// Attribute type or value rejected
    AttributesNotSupported {
        /// Attribute type
        attr_type: u16,
        /// Attribute value (basic attributes only)
        value: u32,
    },

    /// None of the offered proposals was acceptable
    NoProposalChosen,

    /// Malformed payload handed to the core
    PayloadMalformed(String),

    /// Key exchange payload rejected
    InvalidKeyInformation(String),

    /// Identification payload rejected
    InvalidIdInformation(String),

    /// Notification type rejected
    InvalidNotification(u16),

    /// Internal error (should not happen)
    Internal(String),
}

impl Error {
    /// Notify message type to send to the peer for this error, if any
    ///
    /// Only protocol-domain validation failures are reported to the peer.
    /// Local failures (configuration, resources, lookups) return `None`.
    pub fn notify_type(&self) -> Option<u16> {
        match self {
            Error::DoiNotSupported(_) => Some(notify::DOI_NOT_SUPPORTED),
            Error::SituationNotSupported(_) => Some(notify::SITUATION_NOT_SUPPORTED),
            Error::InvalidExchangeType(_) => Some(notify::INVALID_EXCHANGE_TYPE),
            Error::InvalidProtocolId(_) => Some(notify::INVALID_PROTOCOL_ID),
            Error::InvalidSpi(_) => Some(notify::INVALID_SPI),
            Error::InvalidTransformId { .. } => Some(notify::INVALID_TRANSFORM_ID),
            Error::AttributesNotSupported { .. } => Some(notify::ATTRIBUTES_NOT_SUPPORTED),
            Error::NoProposalChosen => Some(notify::NO_PROPOSAL_CHOSEN),
            Error::PayloadMalformed(_) => Some(notify::PAYLOAD_MALFORMED),
            Error::InvalidKeyInformation(_) => Some(notify::INVALID_KEY_INFORMATION),
            Error::InvalidIdInformation(_) => Some(notify::INVALID_ID_INFORMATION),
            Error::InvalidNotification(_) => Some(notify::INVALID_PAYLOAD_TYPE),
            Error::Config(_)
            | Error::DoiAlreadyRegistered(_)
            | Error::SaNotFound(_)
            | Error::ResourceExhausted(_)
            | Error::InvalidState(_)
            | Error::Internal(_) => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::DoiNotSupported(id) => write!(f, "DOI not supported: {}", id),
            Error::DoiAlreadyRegistered(id) => write!(f, "DOI already registered: {}", id),
            Error::SaNotFound(id) => write!(f, "Security Association not found: {}", id),
            Error::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::SituationNotSupported(sit) => {
                write!(f, "Situation not supported: 0x{:08x}", sit)
            }
            Error::InvalidExchangeType(t) => write!(f, "Invalid exchange type: {}", t),
            Error::InvalidProtocolId(p) => write!(f, "Invalid protocol id: {}", p),
            Error::InvalidSpi(spi) => write!(f, "Invalid SPI: {}", hex::encode(spi)),
            Error::InvalidTransformId { proto, transform } => {
                write!(
                    f,
                    "Invalid transform id {} for protocol {}",
                    transform, proto
                )
            }
            Error::AttributesNotSupported { attr_type, value } => {
                write!(
                    f,
                    "Attribute not supported: type {} value {}",
                    attr_type, value
                )
            }
            Error::NoProposalChosen => {
                write!(f, "No acceptable proposal found in negotiation")
            }
            Error::PayloadMalformed(msg) => write!(f, "Payload malformed: {}", msg),
            Error::InvalidKeyInformation(msg) => {
                write!(f, "Invalid key information: {}", msg)
            }
            Error::InvalidIdInformation(msg) => write!(f, "Invalid ID information: {}", msg),
            Error::InvalidNotification(t) => write!(f, "Invalid notification type: {}", t),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
