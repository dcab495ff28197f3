//! Protocol suites negotiated inside an SA

use std::fmt;

use crate::doi::ProtoData;

/// SPI slot of the responder
pub const RESPONDER: usize = 0;

/// SPI slot of the initiator
pub const INITIATOR: usize = 1;

/// One negotiated protocol suite (AH, ESP, IPCOMP, ...) of an SA
///
/// SPIs are kept per direction: slot 0 holds the responder's SPI, slot 1
/// the initiator's. An empty slot means no SPI, which is normal for the
/// ISAKMP protocol itself.
pub struct Proto {
    /// Protocol identifier, opaque to the core
    pub proto: u8,
    /// Proposal number, correlates initiator and responder views
    pub no: u8,
    /// SPIs, indexed by [`RESPONDER`] / [`INITIATOR`]
    pub spi: [Vec<u8>; 2],
    /// Chosen transform identifier
    pub id: u8,
    /// DOI-specific data, released through the owning DOI
    pub data: ProtoData,
}

impl Proto {
    /// Create proto without SPIs or transform
    pub fn new(no: u8, proto: u8) -> Self {
        Proto {
            proto,
            no,
            spi: [Vec::new(), Vec::new()],
            id: 0,
            data: ProtoData::None,
        }
    }

    /// SPI size of slot `index`; zero means no SPI
    pub fn spi_sz(&self, index: usize) -> usize {
        self.spi.get(index).map_or(0, Vec::len)
    }

    /// SPI in slot `index`, if set
    pub fn spi(&self, index: usize) -> Option<&[u8]> {
        self.spi
            .get(index)
            .filter(|spi| !spi.is_empty())
            .map(Vec::as_slice)
    }
}

impl fmt::Debug for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proto")
            .field("no", &self.no)
            .field("proto", &self.proto)
            .field("id", &self.id)
            .field("spi_r", &hex::encode(&self.spi[RESPONDER]))
            .field("spi_i", &hex::encode(&self.spi[INITIATOR]))
            .field("data", &self.data)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spi_slots() {
        let mut proto = Proto::new(1, 3);
        assert_eq!(proto.spi_sz(RESPONDER), 0);
        assert!(proto.spi(INITIATOR).is_none());

        proto.spi[INITIATOR] = vec![0, 0, 1, 0];
        assert_eq!(proto.spi_sz(INITIATOR), 4);
        assert_eq!(proto.spi(INITIATOR), Some(&[0u8, 0, 1, 0][..]));
        assert_eq!(proto.spi_sz(5), 0);
    }
}
