//! The IPsec DOI (domain 1)
//!
//! Implements the interpretation of ISAKMP for IPsec as defined in
//! RFC 2407: AH, ESP and IPCOMP protection suites, the IDENTITY_ONLY
//! situation, IPsec SA attributes and identification types.
//!
//! # SPIs
//!
//! ```text
//! ISAKMP : no SPI (the cookies identify the SA)
//! AH/ESP : 4 bytes, values 1..=255 reserved by IANA
//! IPCOMP : 2 bytes (CPI), values 1..=255 reserved
//! ```
//!
//! SPIs are handed out by an [`SpiAllocator`]. The default one draws random
//! values and remembers which are in use; a kernel-backed allocator can be
//! plugged in instead.
//!
//! # References
//!
//! - [RFC 2407](https://datatracker.ietf.org/doc/html/rfc2407) - The Internet IP Security DOI for ISAKMP

use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{BufMut, BytesMut};
use rand::RngCore;

use super::{select_proposal, Doi, ExchangeData, ProtoData, SaData};
use crate::exchange::Exchange;
use crate::payload::{exchange, notify, proto, Attribute, ProposalPayload, SaPayload, TransformPayload};
use crate::sa::{Phase, Proto, SecurityAssociation, INITIATOR, RESPONDER};
use crate::{Error, Result};

/// Situation bits (RFC 2407 Section 4.2)
pub mod sit {
    /// SIT_IDENTITY_ONLY
    pub const IDENTITY_ONLY: u32 = 1;
    /// SIT_SECRECY
    pub const SECRECY: u32 = 2;
    /// SIT_INTEGRITY
    pub const INTEGRITY: u32 = 4;
}

/// AH transform identifiers (RFC 2407 Section 4.4.3)
pub mod ah {
    /// AH_MD5
    pub const MD5: u8 = 2;
    /// AH_SHA
    pub const SHA: u8 = 3;
    /// AH_DES
    pub const DES: u8 = 4;
    /// AH_SHA2_256
    pub const SHA2_256: u8 = 5;
    /// AH_SHA2_384
    pub const SHA2_384: u8 = 6;
    /// AH_SHA2_512
    pub const SHA2_512: u8 = 7;
}

/// ESP transform identifiers (RFC 2407 Section 4.4.4)
pub mod esp {
    /// ESP_DES_IV64
    pub const DES_IV64: u8 = 1;
    /// ESP_DES
    pub const DES: u8 = 2;
    /// ESP_3DES
    pub const TRIPLE_DES: u8 = 3;
    /// ESP_NULL
    pub const NULL: u8 = 11;
    /// ESP_AES (CBC)
    pub const AES: u8 = 12;
}

/// IPCOMP transform identifiers (RFC 2407 Section 4.4.5)
pub mod ipcomp {
    /// IPCOMP_OUI
    pub const OUI: u8 = 1;
    /// IPCOMP_DEFLATE
    pub const DEFLATE: u8 = 2;
    /// IPCOMP_LZS
    pub const LZS: u8 = 3;
    /// IPCOMP_LZJH
    pub const LZJH: u8 = 4;
}

/// SA attribute types (RFC 2407 Section 4.5)
pub mod attr {
    /// SA Life Type
    pub const LIFE_TYPE: u16 = 1;
    /// SA Life Duration
    pub const LIFE_DURATION: u16 = 2;
    /// Group Description
    pub const GROUP_DESCRIPTION: u16 = 3;
    /// Encapsulation Mode
    pub const ENCAPSULATION_MODE: u16 = 4;
    /// Authentication Algorithm
    pub const AUTHENTICATION_ALGORITHM: u16 = 5;
    /// Key Length
    pub const KEY_LENGTH: u16 = 6;
    /// Key Rounds
    pub const KEY_ROUNDS: u16 = 7;
    /// Compress Dictionary Size
    pub const COMPRESS_DICTIONARY_SIZE: u16 = 8;
    /// Compress Private Algorithm
    pub const COMPRESS_PRIVATE_ALGORITHM: u16 = 9;

    /// Life type: seconds
    pub const LIFE_SECONDS: u32 = 1;
    /// Life type: kilobytes
    pub const LIFE_KILOBYTES: u32 = 2;
}

/// Identification types (RFC 2407 Section 4.6.2.1)
pub mod id {
    /// ID_IPV4_ADDR
    pub const IPV4_ADDR: u8 = 1;
    /// ID_FQDN
    pub const FQDN: u8 = 2;
    /// ID_USER_FQDN
    pub const USER_FQDN: u8 = 3;
    /// ID_IPV4_ADDR_SUBNET
    pub const IPV4_ADDR_SUBNET: u8 = 4;
    /// ID_IPV6_ADDR
    pub const IPV6_ADDR: u8 = 5;
    /// ID_IPV6_ADDR_SUBNET
    pub const IPV6_ADDR_SUBNET: u8 = 6;
    /// ID_IPV4_ADDR_RANGE
    pub const IPV4_RANGE: u8 = 7;
    /// ID_IPV6_ADDR_RANGE
    pub const IPV6_RANGE: u8 = 8;
    /// ID_DER_ASN1_DN
    pub const DER_ASN1_DN: u8 = 9;
    /// ID_DER_ASN1_GN
    pub const DER_ASN1_GN: u8 = 10;
    /// ID_KEY_ID
    pub const KEY_ID: u8 = 11;
}

/// IPsec status notifications (RFC 2407 Section 4.6.3)
pub mod status {
    /// RESPONDER-LIFETIME
    pub const RESPONDER_LIFETIME: u16 = 24576;
    /// REPLAY-STATUS
    pub const REPLAY_STATUS: u16 = 24577;
    /// INITIAL-CONTACT
    pub const INITIAL_CONTACT: u16 = 24578;
}

/// Lifetime assumed when a transform carries none (RFC 2407 Section 4.5)
pub const DEFAULT_LIFETIME_SECS: u64 = 28800;

/// SPI size for AH and ESP
pub const IPSEC_SPI_SIZE: usize = 4;

/// CPI size for IPCOMP
pub const IPCOMP_CPI_SIZE: usize = 2;

/// Highest SPI value reserved by IANA
const RESERVED_SPI_MAX: u32 = 255;

const MAX_SPI_ATTEMPTS: usize = 32;

/// Encapsulation mode of an IPsec SA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncapMode {
    /// Tunnel mode
    Tunnel,
    /// Transport mode
    Transport,
    /// Tunnel mode over UDP (NAT-T)
    UdpTunnel,
    /// Transport mode over UDP (NAT-T)
    UdpTransport,
}

impl EncapMode {
    /// Convert from attribute value
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(EncapMode::Tunnel),
            2 => Some(EncapMode::Transport),
            3 => Some(EncapMode::UdpTunnel),
            4 => Some(EncapMode::UdpTransport),
            _ => None,
        }
    }
}

/// IPsec data of an SA
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IpsecSaData {
    /// Situation the SA was negotiated under
    pub situation: u32,
    /// PFS group, when negotiated
    pub group_desc: Option<u16>,
}

/// IPsec data of a proto, decoded from the chosen transform
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IpsecProtoData {
    /// Encapsulation mode
    pub encap_mode: Option<EncapMode>,
    /// Authentication algorithm
    pub auth: Option<u16>,
    /// Key length in bits
    pub key_length: Option<u16>,
    /// Key rounds
    pub key_rounds: Option<u16>,
    /// Lifetime in seconds
    pub life_seconds: Option<u32>,
    /// Lifetime in kilobytes
    pub life_kbytes: Option<u32>,
    /// PFS group
    pub group_desc: Option<u16>,
    /// IPCOMP dictionary size
    pub compress_dict_size: Option<u16>,
}

/// IPsec data of an exchange
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IpsecExchangeData {
    /// Situation offered or accepted
    pub situation: u32,
    /// Proposal number of the chosen suite
    pub chosen_suite: Option<u8>,
}

/// Source of SPIs for IPsec protocols
pub trait SpiAllocator: Send + Sync {
    /// Allocate an unused SPI of `size` bytes for `proto`
    fn allocate(&self, proto: u8, size: usize) -> Result<Vec<u8>>;

    /// Return an SPI; false if it was not allocated here
    fn release(&self, proto: u8, spi: &[u8]) -> bool;
}

/// Random SPI allocator
///
/// Draws SPIs from the thread RNG, skipping the reserved range and values
/// already handed out.
#[derive(Default)]
pub struct RandomSpiAllocator {
    in_use: Mutex<HashSet<(u8, Vec<u8>)>>,
}

impl RandomSpiAllocator {
    /// Create allocator with no SPIs in use
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of SPIs currently allocated
    pub fn in_use(&self) -> usize {
        self.in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl SpiAllocator for RandomSpiAllocator {
    fn allocate(&self, proto: u8, size: usize) -> Result<Vec<u8>> {
        if size == 0 || size > 4 {
            return Err(Error::Internal(format!("unsupported SPI size {}", size)));
        }
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_SPI_ATTEMPTS {
            let mut spi = vec![0u8; size];
            rng.fill_bytes(&mut spi);
            let value = spi.iter().fold(0u32, |acc, &b| acc << 8 | u32::from(b));
            if value <= RESERVED_SPI_MAX {
                continue;
            }
            if in_use.insert((proto, spi.clone())) {
                return Ok(spi);
            }
        }
        Err(Error::ResourceExhausted(format!(
            "no free SPI for protocol {}",
            proto
        )))
    }

    fn release(&self, proto: u8, spi: &[u8]) -> bool {
        self.in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(proto, spi.to_vec()))
    }
}

/// The IPsec DOI
pub struct IpsecDoi {
    spis: Arc<dyn SpiAllocator>,
}

impl fmt::Debug for IpsecDoi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpsecDoi").finish_non_exhaustive()
    }
}

impl Default for IpsecDoi {
    fn default() -> Self {
        Self::new()
    }
}

impl IpsecDoi {
    /// Create the DOI with a [`RandomSpiAllocator`]
    pub fn new() -> Self {
        IpsecDoi {
            spis: Arc::new(RandomSpiAllocator::new()),
        }
    }

    /// Create the DOI with a custom SPI allocator
    pub fn with_allocator(spis: Arc<dyn SpiAllocator>) -> Self {
        IpsecDoi { spis }
    }

    fn check_phase(&self, exchange: &Exchange) -> Result<()> {
        let expected = match exchange.exchange_type {
            exchange::QUICK_MODE | exchange::NEW_GROUP_MODE => Some(Phase::Two),
            exchange::INFO => None,
            _ => Some(Phase::One),
        };
        match expected {
            Some(phase) if phase != exchange.phase() => {
                Err(Error::InvalidExchangeType(exchange.exchange_type))
            }
            _ => Ok(()),
        }
    }
}

fn basic_value(attr: &Attribute) -> Result<u32> {
    match attr {
        Attribute::Basic { value, .. } => Ok(u32::from(*value)),
        Attribute::Variable { attr_type, .. } => Err(Error::AttributesNotSupported {
            attr_type: *attr_type,
            value: 0,
        }),
    }
}

fn decode_id(id: &[u8]) -> String {
    if id.is_empty() {
        return "<none>".to_string();
    }
    if id.len() < 4 {
        return format!("<malformed {}>", hex::encode(id));
    }
    let data = &id[4..];
    let v4 = |b: &[u8]| Ipv4Addr::new(b[0], b[1], b[2], b[3]);
    let v6 = |b: &[u8]| {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&b[..16]);
        Ipv6Addr::from(octets)
    };
    match (id[0], data.len()) {
        (id::IPV4_ADDR, 4) => format!("ipv4: {}", v4(data)),
        (id::FQDN, _) => format!("fqdn: {}", String::from_utf8_lossy(data)),
        (id::USER_FQDN, _) => format!("user_fqdn: {}", String::from_utf8_lossy(data)),
        (id::IPV4_ADDR_SUBNET, 8) => {
            format!("ipv4_subnet: {}/{}", v4(&data[..4]), v4(&data[4..]))
        }
        (id::IPV6_ADDR, 16) => format!("ipv6: {}", v6(data)),
        (id::IPV6_ADDR_SUBNET, 32) => {
            format!("ipv6_subnet: {}/{}", v6(&data[..16]), v6(&data[16..]))
        }
        (id::IPV4_RANGE, 8) => format!("ipv4_range: {}-{}", v4(&data[..4]), v4(&data[4..])),
        (id::IPV6_RANGE, 32) => {
            format!("ipv6_range: {}-{}", v6(&data[..16]), v6(&data[16..]))
        }
        (other, _) => format!("<id type {}> {}", other, hex::encode(data)),
    }
}

impl Doi for IpsecDoi {
    fn id(&self) -> u32 {
        super::IPSEC_DOI
    }

    fn name(&self) -> &'static str {
        "IPSEC"
    }

    fn new_sa_data(&self) -> SaData {
        SaData::Ipsec(IpsecSaData {
            situation: sit::IDENTITY_ONLY,
            group_desc: None,
        })
    }

    fn new_exchange_data(&self) -> ExchangeData {
        ExchangeData::Ipsec(IpsecExchangeData::default())
    }

    fn new_proto_data(
        &self,
        sa: &mut SecurityAssociation,
        proposal: &ProposalPayload,
        transform: &TransformPayload,
    ) -> Result<ProtoData> {
        let mut data = IpsecProtoData::default();
        let mut life_type = None;

        for a in &transform.attributes {
            self.validate_attribute(proposal.proto, a)?;
            let value = a.value_u32().unwrap_or(0);
            match a.attr_type() {
                attr::LIFE_TYPE => life_type = Some(value),
                attr::LIFE_DURATION => match life_type.take() {
                    Some(attr::LIFE_SECONDS) => data.life_seconds = Some(value),
                    Some(_) => data.life_kbytes = Some(value),
                    None => {
                        return Err(Error::PayloadMalformed(
                            "life duration without life type".into(),
                        ))
                    }
                },
                attr::GROUP_DESCRIPTION => data.group_desc = Some(value as u16),
                attr::ENCAPSULATION_MODE => data.encap_mode = EncapMode::from_u32(value),
                attr::AUTHENTICATION_ALGORITHM => data.auth = Some(value as u16),
                attr::KEY_LENGTH => data.key_length = Some(value as u16),
                attr::KEY_ROUNDS => data.key_rounds = Some(value as u16),
                attr::COMPRESS_DICTIONARY_SIZE => data.compress_dict_size = Some(value as u16),
                _ => {}
            }
        }

        let seconds = match (data.life_seconds, data.life_kbytes) {
            (Some(s), _) => u64::from(s),
            (None, None) => DEFAULT_LIFETIME_SECS,
            (None, Some(_)) => 0,
        };
        if seconds > 0 && (sa.seconds == 0 || seconds < sa.seconds) {
            sa.seconds = seconds;
        }
        if let Some(kb) = data.life_kbytes.map(u64::from) {
            if sa.kilobytes == 0 || kb < sa.kilobytes {
                sa.kilobytes = kb;
            }
        }
        if let (Some(group), SaData::Ipsec(sa_data)) = (data.group_desc, &mut sa.data) {
            sa_data.group_desc = Some(group);
        }

        Ok(ProtoData::Ipsec(data))
    }

    fn get_spi(&self, _sa: &SecurityAssociation, proto: u8) -> Result<Vec<u8>> {
        match self.spi_size(proto) {
            0 => Ok(Vec::new()),
            size => self.spis.allocate(proto, size),
        }
    }

    fn delete_spi(&self, sa: &SecurityAssociation, proto: &Proto, index: usize) -> Result<()> {
        // Only the SPI we allocated is ours to give back
        let own = if sa.initiator { INITIATOR } else { RESPONDER };
        if index != own {
            return Ok(());
        }
        if let Some(spi) = proto.spi(index) {
            if !self.spis.release(proto.proto, spi) {
                tracing::debug!(
                    proto = proto.proto,
                    spi = %hex::encode(spi),
                    "SPI was not allocated locally"
                );
            }
        }
        Ok(())
    }

    fn spi_size(&self, proto: u8) -> usize {
        match proto {
            proto::IPSEC_AH | proto::IPSEC_ESP => IPSEC_SPI_SIZE,
            proto::IPCOMP => IPCOMP_CPI_SIZE,
            _ => 0,
        }
    }

    fn situation_size(&self) -> usize {
        4
    }

    fn encode_situation(&self, buf: &mut BytesMut) {
        buf.put_u32(sit::IDENTITY_ONLY);
    }

    fn validate_situation(&self, situation: &[u8]) -> Result<()> {
        let bytes: [u8; 4] = situation.try_into().map_err(|_| {
            Error::PayloadMalformed(format!("situation of {} bytes", situation.len()))
        })?;
        let value = u32::from_be_bytes(bytes);
        if value == sit::IDENTITY_ONLY {
            Ok(())
        } else {
            Err(Error::SituationNotSupported(value))
        }
    }

    fn validate_attribute(&self, proto: u8, a: &Attribute) -> Result<()> {
        let attr_type = a.attr_type();
        let value = a.value_u32();
        let reject = || Error::AttributesNotSupported {
            attr_type,
            value: value.unwrap_or(0),
        };
        let ok = match attr_type {
            attr::LIFE_TYPE => matches!(
                basic_value(a)?,
                attr::LIFE_SECONDS | attr::LIFE_KILOBYTES
            ),
            attr::LIFE_DURATION => value.map_or(false, |v| v > 0),
            attr::GROUP_DESCRIPTION => matches!(basic_value(a)?, 1 | 2 | 5 | 14..=18),
            attr::ENCAPSULATION_MODE => EncapMode::from_u32(basic_value(a)?).is_some(),
            attr::AUTHENTICATION_ALGORITHM => {
                proto != proto::IPCOMP && matches!(basic_value(a)?, 1 | 2 | 5 | 6 | 7)
            }
            attr::KEY_LENGTH => basic_value(a)? > 0,
            attr::KEY_ROUNDS => basic_value(a).is_ok(),
            attr::COMPRESS_DICTIONARY_SIZE => proto == proto::IPCOMP && basic_value(a).is_ok(),
            attr::COMPRESS_PRIVATE_ALGORITHM => {
                proto == proto::IPCOMP && matches!(a, Attribute::Variable { .. })
            }
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(reject())
        }
    }

    fn validate_exchange(&self, exchange_type: u8) -> Result<()> {
        match exchange_type {
            exchange::BASE
            | exchange::ID_PROT
            | exchange::AUTH_ONLY
            | exchange::AGGRESSIVE
            | exchange::INFO
            | exchange::QUICK_MODE
            | exchange::NEW_GROUP_MODE => Ok(()),
            other => Err(Error::InvalidExchangeType(other)),
        }
    }

    fn validate_id_information(&self, id_type: u8, data: &[u8]) -> Result<()> {
        let ok = match id_type {
            id::IPV4_ADDR => data.len() == 4,
            id::IPV4_ADDR_SUBNET | id::IPV4_RANGE => data.len() == 8,
            id::IPV6_ADDR => data.len() == 16,
            id::IPV6_ADDR_SUBNET | id::IPV6_RANGE => data.len() == 32,
            id::FQDN | id::USER_FQDN | id::DER_ASN1_DN | id::DER_ASN1_GN | id::KEY_ID => {
                !data.is_empty()
            }
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidIdInformation(format!(
                "type {} with {} bytes",
                id_type,
                data.len()
            )))
        }
    }

    fn validate_key_information(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() || data.len() > 1024 {
            return Err(Error::InvalidKeyInformation(format!(
                "{} bytes of key exchange data",
                data.len()
            )));
        }
        Ok(())
    }

    fn validate_notification(&self, notify_type: u16) -> Result<()> {
        match notify_type {
            1..=30
            | notify::STATUS_CONNECTED
            | status::RESPONDER_LIFETIME..=status::INITIAL_CONTACT => Ok(()),
            other => Err(Error::InvalidNotification(other)),
        }
    }

    fn validate_proto(&self, proto: u8) -> Result<()> {
        match proto {
            proto::ISAKMP | proto::IPSEC_AH | proto::IPSEC_ESP | proto::IPCOMP => Ok(()),
            other => Err(Error::InvalidProtocolId(other)),
        }
    }

    fn validate_transform_id(&self, proto: u8, transform_id: u8) -> Result<()> {
        let ok = match proto {
            proto::ISAKMP => transform_id == super::isakmp::KEY_IKE,
            proto::IPSEC_AH => (ah::MD5..=ah::SHA2_512).contains(&transform_id),
            proto::IPSEC_ESP => (esp::DES_IV64..=esp::AES).contains(&transform_id),
            proto::IPCOMP => (ipcomp::OUI..=ipcomp::LZJH).contains(&transform_id),
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidTransformId {
                proto,
                transform: transform_id,
            })
        }
    }

    fn initiator(&self, exchange: &mut Exchange) -> Result<()> {
        self.validate_exchange(exchange.exchange_type)?;
        self.check_phase(exchange)?;
        if let ExchangeData::Ipsec(data) = &mut exchange.data {
            data.situation = sit::IDENTITY_ONLY;
        }
        exchange.step += 1;
        Ok(())
    }

    fn responder(&self, exchange: &mut Exchange, offer: &SaPayload) -> Result<()> {
        self.validate_exchange(exchange.exchange_type)?;
        self.check_phase(exchange)?;
        if exchange.exchange_type != exchange::INFO {
            self.validate_situation(&offer.situation)?;
            let chosen = select_proposal(self, offer)?;
            if let ExchangeData::Ipsec(data) = &mut exchange.data {
                data.situation = sit::IDENTITY_ONLY;
                data.chosen_suite = chosen.first().map(|s| s.proposal.no);
            }
            exchange.chosen = chosen;
        }
        exchange.step += 1;
        Ok(())
    }

    fn decode_ids(&self, id_i: &[u8], id_r: &[u8]) -> String {
        format!(
            "initiator id {}, responder id {}",
            decode_id(id_i),
            decode_id(id_r)
        )
    }
}
