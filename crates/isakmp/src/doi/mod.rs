//! Domains of Interpretation
//!
//! A DOI defines how an SA payload is interpreted: which protocols and
//! transforms exist, how SPIs are sized and allocated, which situations and
//! exchanges are valid, and what extra state an SA, a proto or an exchange
//! carries. The SA core never looks at DOI-specific fields itself; all of it
//! goes through the [`Doi`] trait.
//!
//! Two domains ship with the crate:
//!
//! | Id | DOI | Module |
//! |----|-----|--------|
//! | 0  | ISAKMP (generic, no protocol suites of its own) | [`isakmp`] |
//! | 1  | IPsec (RFC 2407) | [`ipsec`] |
//!
//! DOIs are registered once in a [`DoiRegistry`] and shared read-only by
//! every SA bound to them.

pub mod ipsec;
pub mod isakmp;

use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;

use crate::exchange::{Exchange, Selection};
use crate::payload::{Attribute, ProposalPayload, SaPayload, TransformPayload};
use crate::sa::{Proto, SecurityAssociation};
use crate::{Error, Result};

pub use ipsec::{IpsecDoi, IpsecExchangeData, IpsecProtoData, IpsecSaData};
pub use isakmp::IsakmpDoi;

/// Domain identifier of the ISAKMP DOI
pub const ISAKMP_DOI: u32 = 0;

/// Domain identifier of the IPsec DOI
pub const IPSEC_DOI: u32 = 1;

/// DOI-specific SA data
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SaData {
    /// The DOI keeps no per-SA data
    #[default]
    None,
    /// IPsec DOI data
    Ipsec(IpsecSaData),
}

/// DOI-specific proto data
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProtoData {
    /// The DOI keeps no per-proto data
    #[default]
    None,
    /// IPsec DOI data
    Ipsec(IpsecProtoData),
}

/// DOI-specific exchange data
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExchangeData {
    /// The DOI keeps no per-exchange data
    #[default]
    None,
    /// IPsec DOI data
    Ipsec(IpsecExchangeData),
}

/// Domain of Interpretation
///
/// Slots with a default implementation are optional; a DOI that has no use
/// for them keeps the no-op. Validators return `Err` with the error that
/// selects the notification sent to the peer.
pub trait Doi: Send + Sync + fmt::Debug {
    /// Numeric domain identifier
    fn id(&self) -> u32;

    /// Human readable name
    fn name(&self) -> &'static str;

    /// Initial SA data
    fn new_sa_data(&self) -> SaData {
        SaData::None
    }

    /// Initial exchange data
    fn new_exchange_data(&self) -> ExchangeData {
        ExchangeData::None
    }

    /// Decode a chosen transform into proto data
    ///
    /// May update SA-wide fields such as the lifetime.
    fn new_proto_data(
        &self,
        _sa: &mut SecurityAssociation,
        _proposal: &ProposalPayload,
        _transform: &TransformPayload,
    ) -> Result<ProtoData> {
        Ok(ProtoData::None)
    }

    /// Release SA data
    fn free_sa_data(&self, _data: SaData) {}

    /// Release proto data
    fn free_proto_data(&self, _data: ProtoData) {}

    /// Release exchange data
    fn free_exchange_data(&self, _data: ExchangeData) {}

    /// Allocate our SPI for `proto`; empty when the protocol has none
    fn get_spi(&self, _sa: &SecurityAssociation, _proto: u8) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Give back SPI slot `index` of `proto`
    fn delete_spi(&self, _sa: &SecurityAssociation, _proto: &Proto, _index: usize) -> Result<()> {
        Ok(())
    }

    /// SPI size used for `proto`
    fn spi_size(&self, proto: u8) -> usize;

    /// Size of the encoded situation
    fn situation_size(&self) -> usize {
        0
    }

    /// Append our situation to `buf`
    fn encode_situation(&self, _buf: &mut BytesMut) {}

    /// Check a situation offered by the peer
    fn validate_situation(&self, situation: &[u8]) -> Result<()>;

    /// Check a transform attribute of `proto`
    fn validate_attribute(&self, _proto: u8, _attr: &Attribute) -> Result<()> {
        Ok(())
    }

    /// Check an exchange type
    fn validate_exchange(&self, exchange_type: u8) -> Result<()>;

    /// Check an identification payload
    fn validate_id_information(&self, _id_type: u8, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Check a key exchange payload
    fn validate_key_information(&self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Check a notification type
    fn validate_notification(&self, _notify_type: u16) -> Result<()> {
        Ok(())
    }

    /// Check a protocol identifier
    fn validate_proto(&self, proto: u8) -> Result<()>;

    /// Check a transform identifier of `proto`
    fn validate_transform_id(&self, proto: u8, transform_id: u8) -> Result<()>;

    /// Drive the initiator side of `exchange` one step
    fn initiator(&self, exchange: &mut Exchange) -> Result<()>;

    /// Drive the responder side of `exchange` given the peer's offer;
    /// chosen proposals are left in `exchange.chosen`
    fn responder(&self, exchange: &mut Exchange, offer: &SaPayload) -> Result<()>;

    /// Render identities for diagnostics
    fn decode_ids(&self, id_i: &[u8], id_r: &[u8]) -> String {
        format!(
            "initiator id {}, responder id {}",
            hex::encode(id_i),
            hex::encode(id_r)
        )
    }
}

/// Pick a protection suite out of `offer`
///
/// Proposals sharing a number form one suite (e.g. AH and ESP together).
/// The first suite in which every proposal has an acceptable transform and
/// a well-sized SPI wins; within a proposal the first acceptable transform
/// wins. Fails with [`Error::NoProposalChosen`] when nothing fits.
pub fn select_proposal(doi: &dyn Doi, offer: &SaPayload) -> Result<Vec<Selection>> {
    let mut numbers: Vec<u8> = Vec::new();
    for prop in &offer.proposals {
        if !numbers.contains(&prop.no) {
            numbers.push(prop.no);
        }
    }

    for no in numbers {
        let suite = offer.proposals.iter().filter(|p| p.no == no);
        let chosen: Result<Vec<Selection>> = suite
            .map(|prop| select_transform(doi, prop))
            .collect();
        match chosen {
            Ok(selections) => return Ok(selections),
            Err(e) => {
                tracing::debug!(doi = doi.id(), proposal = no, error = %e, "proposal rejected");
            }
        }
    }
    Err(Error::NoProposalChosen)
}

fn select_transform(doi: &dyn Doi, prop: &ProposalPayload) -> Result<Selection> {
    doi.validate_proto(prop.proto)?;
    if prop.spi.len() != doi.spi_size(prop.proto) {
        return Err(Error::InvalidSpi(prop.spi.clone()));
    }

    let mut last_err = Error::NoProposalChosen;
    for xf in &prop.transforms {
        let accepted = doi
            .validate_transform_id(prop.proto, xf.id)
            .and_then(|()| {
                xf.attributes
                    .iter()
                    .try_for_each(|attr| doi.validate_attribute(prop.proto, attr))
            });
        match accepted {
            Ok(()) => {
                return Ok(Selection {
                    proposal: prop.clone(),
                    transform: xf.clone(),
                })
            }
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

/// Registry of DOIs by domain identifier
#[derive(Debug, Default, Clone)]
pub struct DoiRegistry {
    dois: Vec<Arc<dyn Doi>>,
}

impl DoiRegistry {
    /// Create empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the ISAKMP and IPsec DOIs
    pub fn with_defaults() -> Self {
        DoiRegistry {
            dois: vec![Arc::new(IsakmpDoi::new()), Arc::new(IpsecDoi::new())],
        }
    }

    /// Add a DOI; its identifier must not be taken
    pub fn register(&mut self, doi: Arc<dyn Doi>) -> Result<()> {
        if self.lookup(doi.id()).is_some() {
            return Err(Error::DoiAlreadyRegistered(doi.id()));
        }
        tracing::debug!(doi = doi.id(), name = doi.name(), "DOI registered");
        self.dois.push(doi);
        Ok(())
    }

    /// DOI registered under `id`
    pub fn lookup(&self, id: u32) -> Option<Arc<dyn Doi>> {
        self.dois.iter().find(|d| d.id() == id).cloned()
    }

    /// Registered identifiers, in registration order
    pub fn ids(&self) -> Vec<u32> {
        self.dois.iter().map(|d| d.id()).collect()
    }

    /// Number of registered DOIs
    pub fn len(&self) -> usize {
        self.dois.len()
    }

    /// Is the registry empty?
    pub fn is_empty(&self) -> bool {
        self.dois.is_empty()
    }
}
