//! The ISAKMP DOI (domain 0)
//!
//! The generic domain: it knows only the ISAKMP protocol itself, which has
//! no SPIs (the cookies identify the SA), and no situation. It keeps no
//! private data. Phase 1 negotiations of a real deployment usually run
//! under the IPsec DOI; this one covers generic informational traffic.

use super::{select_proposal, Doi};
use crate::exchange::Exchange;
use crate::payload::{exchange, proto, SaPayload};
use crate::sa::Phase;
use crate::{Error, Result};

/// KEY_IKE transform identifier
pub const KEY_IKE: u8 = 1;

/// The ISAKMP DOI
#[derive(Debug, Default, Clone, Copy)]
pub struct IsakmpDoi;

impl IsakmpDoi {
    /// Create the DOI
    pub fn new() -> Self {
        IsakmpDoi
    }
}

impl Doi for IsakmpDoi {
    fn id(&self) -> u32 {
        super::ISAKMP_DOI
    }

    fn name(&self) -> &'static str {
        "ISAKMP"
    }

    fn spi_size(&self, _proto: u8) -> usize {
        0
    }

    fn validate_situation(&self, situation: &[u8]) -> Result<()> {
        if situation.is_empty() {
            Ok(())
        } else {
            Err(Error::SituationNotSupported(
                situation.iter().fold(0u32, |acc, &b| acc << 8 | u32::from(b)),
            ))
        }
    }

    fn validate_exchange(&self, exchange_type: u8) -> Result<()> {
        match exchange_type {
            exchange::BASE
            | exchange::ID_PROT
            | exchange::AUTH_ONLY
            | exchange::AGGRESSIVE
            | exchange::INFO => Ok(()),
            other => Err(Error::InvalidExchangeType(other)),
        }
    }

    fn validate_proto(&self, proto: u8) -> Result<()> {
        if proto == proto::ISAKMP {
            Ok(())
        } else {
            Err(Error::InvalidProtocolId(proto))
        }
    }

    fn validate_transform_id(&self, proto: u8, transform_id: u8) -> Result<()> {
        if proto == proto::ISAKMP && transform_id == KEY_IKE {
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
        exchange.step += 1;
        Ok(())
    }

    fn responder(&self, exchange: &mut Exchange, offer: &SaPayload) -> Result<()> {
        self.validate_exchange(exchange.exchange_type)?;
        if exchange.exchange_type != exchange::INFO {
            if exchange.phase() != Phase::One {
                return Err(Error::InvalidExchangeType(exchange.exchange_type));
            }
            self.validate_situation(&offer.situation)?;
            exchange.chosen = select_proposal(self, offer)?;
        }
        exchange.step += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookie::{Cookies, MessageId};
    use crate::payload::{ProposalPayload, TransformPayload};
    use std::sync::Arc;

    fn exchange(exchange_type: u8) -> Exchange {
        Exchange::new(
            Arc::new(IsakmpDoi::new()),
            exchange_type,
            Cookies::new([3; 16]),
            MessageId::ZERO,
            false,
        )
    }

    #[test]
    fn test_degenerate_spi() {
        let doi = IsakmpDoi::new();
        assert_eq!(doi.spi_size(proto::ISAKMP), 0);
        assert_eq!(doi.situation_size(), 0);
    }

    #[test]
    fn test_rejects_ipsec_protocols() {
        let doi = IsakmpDoi::new();
        assert!(doi.validate_proto(proto::ISAKMP).is_ok());
        assert_eq!(
            doi.validate_proto(proto::IPSEC_ESP),
            Err(Error::InvalidProtocolId(proto::IPSEC_ESP))
        );
        assert!(doi.validate_exchange(exchange::QUICK_MODE).is_err());
    }

    #[test]
    fn test_responder_selects_key_ike() {
        let doi = IsakmpDoi::new();
        let mut ex = exchange(exchange::ID_PROT);
        let offer = SaPayload {
            situation: vec![],
            proposals: vec![ProposalPayload::new(1, proto::ISAKMP, vec![])
                .with_transform(TransformPayload::new(1, KEY_IKE))],
        };
        doi.responder(&mut ex, &offer).unwrap();
        assert_eq!(ex.chosen.len(), 1);
        assert_eq!(ex.step, 1);
    }

    #[test]
    fn test_responder_rejects_situation() {
        let doi = IsakmpDoi::new();
        let mut ex = exchange(exchange::ID_PROT);
        let offer = SaPayload {
            situation: vec![0, 0, 0, 1],
            proposals: vec![],
        };
        assert_eq!(
            doi.responder(&mut ex, &offer),
            Err(Error::SituationNotSupported(1))
        );
    }

    #[test]
    fn test_info_needs_no_proposal() {
        let doi = IsakmpDoi::new();
        let mut ex = exchange(exchange::INFO);
        doi.responder(&mut ex, &SaPayload::default()).unwrap();
        assert!(ex.chosen.is_empty());
    }
}
