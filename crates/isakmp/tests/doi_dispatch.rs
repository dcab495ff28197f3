//! DOI Dispatch Integration Tests
//!
//! End-to-end tests for routing DOI operations through the DOI an SA is
//! bound to, with several domains registered side by side.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fynx_isakmp::doi::{select_proposal, ProtoData, SaData};
use fynx_isakmp::payload::{exchange, ProposalPayload, SaPayload, TransformPayload};
use fynx_isakmp::sa::{INITIATOR, RESPONDER};
use fynx_isakmp::{
    Cookies, Doi, Error, Exchange, MessageId, Proto, Result, SaConfig, SaManager,
    SecurityAssociation,
};

/// Protocol identifier the test domains accept
const TEST_PROTO: u8 = 7;

/// Calls a test domain has seen
#[derive(Debug, Default)]
struct Calls {
    responder: AtomicUsize,
    initiator: AtomicUsize,
    get_spi: AtomicUsize,
    delete_spi: AtomicUsize,
    free_sa_data: AtomicUsize,
    free_proto_data: AtomicUsize,
    situation: AtomicUsize,
}

impl Calls {
    fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Domain that counts every call and tags its SPIs
#[derive(Debug)]
struct CountingDoi {
    id: u32,
    name: &'static str,
    tag: u8,
    calls: Arc<Calls>,
}

impl CountingDoi {
    fn new(id: u32, name: &'static str, tag: u8) -> (Arc<Self>, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let doi = Arc::new(CountingDoi {
            id,
            name,
            tag,
            calls: Arc::clone(&calls),
        });
        (doi, calls)
    }
}

impl Doi for CountingDoi {
    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn free_sa_data(&self, _data: SaData) {
        self.calls.free_sa_data.fetch_add(1, Ordering::SeqCst);
    }

    fn free_proto_data(&self, _data: ProtoData) {
        self.calls.free_proto_data.fetch_add(1, Ordering::SeqCst);
    }

    fn get_spi(&self, _sa: &SecurityAssociation, _proto: u8) -> Result<Vec<u8>> {
        let n = self.calls.get_spi.fetch_add(1, Ordering::SeqCst);
        Ok(vec![self.tag, 0, 0, n as u8])
    }

    fn delete_spi(&self, _sa: &SecurityAssociation, _proto: &Proto, _index: usize) -> Result<()> {
        self.calls.delete_spi.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn spi_size(&self, proto: u8) -> usize {
        if proto == TEST_PROTO {
            4
        } else {
            0
        }
    }

    fn validate_situation(&self, situation: &[u8]) -> Result<()> {
        self.calls.situation.fetch_add(1, Ordering::SeqCst);
        if situation == [self.tag] {
            Ok(())
        } else {
            Err(Error::SituationNotSupported(u32::from(self.tag)))
        }
    }

    fn validate_exchange(&self, exchange_type: u8) -> Result<()> {
        match exchange_type {
            exchange::ID_PROT | exchange::QUICK_MODE => Ok(()),
            other => Err(Error::InvalidExchangeType(other)),
        }
    }

    fn validate_proto(&self, proto: u8) -> Result<()> {
        if proto == TEST_PROTO {
            Ok(())
        } else {
            Err(Error::InvalidProtocolId(proto))
        }
    }

    fn validate_transform_id(&self, proto: u8, transform_id: u8) -> Result<()> {
        if transform_id == 1 {
            Ok(())
        } else {
            Err(Error::InvalidTransformId {
                proto,
                transform: transform_id,
            })
        }
    }

    fn initiator(&self, exchange: &mut Exchange) -> Result<()> {
        self.calls.initiator.fetch_add(1, Ordering::SeqCst);
        exchange.step += 1;
        Ok(())
    }

    fn responder(&self, exchange: &mut Exchange, offer: &SaPayload) -> Result<()> {
        self.calls.responder.fetch_add(1, Ordering::SeqCst);
        self.validate_situation(&offer.situation)?;
        exchange.chosen = select_proposal(self, offer)?;
        exchange.step += 1;
        Ok(())
    }
}

/// Helper function to create an offer for a test domain
fn create_test_offer(tag: u8) -> SaPayload {
    SaPayload {
        situation: vec![tag],
        proposals: vec![ProposalPayload::new(1, TEST_PROTO, vec![0xaa, 0xbb, 0xcc, tag])
            .with_transform(TransformPayload::new(1, 2))
            .with_transform(TransformPayload::new(2, 1))],
    }
}

/// Helper function to create a quick mode exchange for `doi`
fn create_quick_mode(doi: Arc<dyn Doi>, seed: u8) -> Exchange {
    Exchange::new(
        doi,
        exchange::QUICK_MODE,
        Cookies::new([seed; 16]),
        MessageId::new([0, 0, 0, seed]),
        false,
    )
}

//
// Test Cases - Registration
//

#[test]
fn test_register_custom_domains() {
    let mut manager = SaManager::new(SaConfig::default()).unwrap();
    let (a, _) = CountingDoi::new(100, "TEST-A", 0xa0);
    let (b, _) = CountingDoi::new(200, "TEST-B", 0xb0);
    manager.register_doi(a).unwrap();
    manager.register_doi(b).unwrap();

    assert_eq!(manager.doi(100).unwrap().name(), "TEST-A");
    assert_eq!(manager.doi(200).unwrap().name(), "TEST-B");

    let (dup, _) = CountingDoi::new(100, "TEST-C", 0xc0);
    assert!(matches!(
        manager.register_doi(dup),
        Err(Error::DoiAlreadyRegistered(100))
    ));
}

#[test]
fn test_unregistered_domain_rejected() {
    let mut manager = SaManager::new(SaConfig::default()).unwrap();
    let (doi, _) = CountingDoi::new(300, "TEST-X", 0x30);
    let ex = create_quick_mode(doi, 1);
    assert!(matches!(
        manager.create(&ex, None),
        Err(Error::DoiNotSupported(300))
    ));
    assert!(manager.is_empty());
}

//
// Test Cases - Dispatch
//

#[test]
fn test_operations_route_to_bound_domain() {
    let mut manager = SaManager::new(SaConfig::default()).unwrap();
    let (a, calls_a) = CountingDoi::new(100, "TEST-A", 0xa0);
    let (b, calls_b) = CountingDoi::new(200, "TEST-B", 0xb0);
    manager.register_doi(a.clone()).unwrap();
    manager.register_doi(b.clone()).unwrap();

    let mut ex_a = create_quick_mode(a, 1);
    let sa_a = manager.create(&ex_a, None).unwrap();
    manager
        .respond(sa_a, &mut ex_a, &create_test_offer(0xa0))
        .unwrap();

    let mut ex_b = create_quick_mode(b, 2);
    let sa_b = manager.create(&ex_b, None).unwrap();
    manager
        .respond(sa_b, &mut ex_b, &create_test_offer(0xb0))
        .unwrap();

    assert_eq!(Calls::get(&calls_a.responder), 1);
    assert_eq!(Calls::get(&calls_b.responder), 1);
    assert_eq!(Calls::get(&calls_a.get_spi), 1);
    assert_eq!(Calls::get(&calls_b.get_spi), 1);

    // Our SPI comes from the SA's own domain, the peer's is kept as sent
    let proto_a = &manager.get(sa_a).unwrap().protos[0];
    assert_eq!(proto_a.id, 1);
    assert_eq!(proto_a.spi[RESPONDER], vec![0xa0, 0, 0, 0]);
    assert_eq!(proto_a.spi[INITIATOR], vec![0xaa, 0xbb, 0xcc, 0xa0]);
    let proto_b = &manager.get(sa_b).unwrap().protos[0];
    assert_eq!(proto_b.spi[RESPONDER], vec![0xb0, 0, 0, 0]);

    manager.delete(sa_a, false).unwrap();
    assert_eq!(Calls::get(&calls_a.delete_spi), 2);
    assert_eq!(Calls::get(&calls_a.free_proto_data), 1);
    assert_eq!(Calls::get(&calls_a.free_sa_data), 1);
    assert_eq!(Calls::get(&calls_b.delete_spi), 0);
    assert_eq!(Calls::get(&calls_b.free_sa_data), 0);

    manager.delete(sa_b, false).unwrap();
    assert_eq!(Calls::get(&calls_b.delete_spi), 2);
    assert_eq!(Calls::get(&calls_b.free_sa_data), 1);
}

#[test]
fn test_situation_checked_by_own_domain() {
    let mut manager = SaManager::new(SaConfig::default()).unwrap();
    let (a, calls_a) = CountingDoi::new(100, "TEST-A", 0xa0);
    let (b, calls_b) = CountingDoi::new(200, "TEST-B", 0xb0);
    manager.register_doi(a.clone()).unwrap();
    manager.register_doi(b).unwrap();

    // B's situation means nothing to A
    let mut ex = create_quick_mode(a, 3);
    let h = manager.create(&ex, None).unwrap();
    assert!(matches!(
        manager.respond(h, &mut ex, &create_test_offer(0xb0)),
        Err(Error::SituationNotSupported(_))
    ));
    assert_eq!(Calls::get(&calls_a.situation), 1);
    assert_eq!(Calls::get(&calls_b.situation), 0);
    assert!(manager.get(h).unwrap().protos.is_empty());
}

#[test]
fn test_initiator_routes_to_bound_domain() {
    let mut manager = SaManager::new(SaConfig::default()).unwrap();
    let (a, calls_a) = CountingDoi::new(100, "TEST-A", 0xa0);
    let (b, calls_b) = CountingDoi::new(200, "TEST-B", 0xb0);
    manager.register_doi(a).unwrap();
    manager.register_doi(b.clone()).unwrap();

    let mut ex = Exchange::new(
        b,
        exchange::ID_PROT,
        Cookies::new([4; 16]),
        MessageId::ZERO,
        true,
    );
    let h = manager.create(&ex, None).unwrap();
    manager.initiate(h, &mut ex).unwrap();
    assert_eq!(ex.step, 1);
    assert_eq!(Calls::get(&calls_b.initiator), 1);
    assert_eq!(Calls::get(&calls_a.initiator), 0);

    // Initiator side: our SPI goes in the initiator slot
    manager.add_proto(h, 1, TEST_PROTO).unwrap();
    let proto = &manager.get(h).unwrap().protos[0];
    assert_eq!(proto.spi[INITIATOR], vec![0xb0, 0, 0, 0]);
    assert!(proto.spi[RESPONDER].is_empty());
}
