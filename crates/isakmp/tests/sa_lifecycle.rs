//! SA Lifecycle Integration Tests
//!
//! End-to-end tests for SA creation, lookup, table growth, expiry and
//! deletion through the public `SaManager` API.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fynx_isakmp::cookie::bucket_index;
use fynx_isakmp::doi::ipsec::{ah, esp, sit};
use fynx_isakmp::doi::{IPSEC_DOI, ISAKMP_DOI};
use fynx_isakmp::payload::{exchange, proto, ProposalPayload, SaPayload, TransformPayload};
use fynx_isakmp::sa::SaTable;
use fynx_isakmp::{
    Clock, Cookies, Error, Exchange, ExchangeHooks, ManualClock, MessageId, Phase, Proto,
    ResizePolicy, SaConfig, SaFlags, SaHandle, SaManager, SaState, SecurityAssociation,
};

/// What the SA core asked the exchange engine to do
#[derive(Debug, Clone, PartialEq, Eq)]
enum HookEvent {
    Delete { proto: u8 },
    Notify { notify_type: u16 },
    Reestablish { name: Option<String> },
}

/// Hooks that record every call
#[derive(Clone, Default)]
struct RecordingHooks {
    events: Arc<Mutex<Vec<HookEvent>>>,
}

impl RecordingHooks {
    fn events(&self) -> Vec<HookEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ExchangeHooks for RecordingHooks {
    fn send_delete(&mut self, _sa: &SecurityAssociation, proto: &Proto) {
        self.events
            .lock()
            .unwrap()
            .push(HookEvent::Delete { proto: proto.proto });
    }

    fn send_notify(&mut self, _sa: &SecurityAssociation, notify_type: u16) {
        self.events
            .lock()
            .unwrap()
            .push(HookEvent::Notify { notify_type });
    }

    fn reestablish(&mut self, sa: &SecurityAssociation) {
        self.events.lock().unwrap().push(HookEvent::Reestablish {
            name: sa.name.clone(),
        });
    }
}

/// Helper function to create a manager on a manual clock
fn create_test_manager(config: SaConfig) -> (SaManager, ManualClock, RecordingHooks) {
    let clock = ManualClock::new();
    let hooks = RecordingHooks::default();
    let manager = SaManager::new(config)
        .unwrap()
        .with_clock(Arc::new(clock.clone()))
        .with_hooks(hooks.clone());
    (manager, clock, hooks)
}

/// Helper function to create a seeded default configuration
fn seeded_config() -> SaConfig {
    SaConfig::builder().with_rng_seed(7).build().unwrap()
}

/// Helper function to create a phase 1 SA with a lifetime
fn create_phase1_sa(manager: &mut SaManager, cookies: Cookies, seconds: u64) -> SaHandle {
    let doi = manager.doi(ISAKMP_DOI).unwrap();
    let ex = Exchange::new(doi, exchange::ID_PROT, cookies, MessageId::ZERO, true);
    let h = manager.create(&ex, None).unwrap();
    manager.get_mut(h).unwrap().seconds = seconds;
    h
}

/// Helper function to create an ESP + AH protection suite offer
fn create_test_esp_ah_offer() -> SaPayload {
    SaPayload {
        situation: sit::IDENTITY_ONLY.to_be_bytes().to_vec(),
        proposals: vec![
            ProposalPayload::new(1, proto::IPSEC_ESP, vec![0x10, 0x20, 0x30, 0x40])
                .with_transform(TransformPayload::new(1, esp::AES)),
            ProposalPayload::new(1, proto::IPSEC_AH, vec![0x50, 0x60, 0x70, 0x80])
                .with_transform(TransformPayload::new(1, ah::SHA)),
        ],
    }
}

/// Helper function to create cookies whose hash moves when the table doubles
///
/// Even `i` folds to `i ^ 0x40`, so bit 6 decides the bucket after the
/// first resize; odd `i` folds to `i`.
fn create_resize_cookies(i: u8) -> Cookies {
    let mut bytes = [0u8; 16];
    bytes[0] = i;
    if i % 2 == 0 {
        bytes[2] = 0x40;
    }
    Cookies::new(bytes)
}

//
// Test Cases - Phase 1
//

#[test]
fn test_phase1_create_lookup_expire() {
    let (mut manager, clock, hooks) = create_test_manager(seeded_config());
    let mut bytes = [0u8; 16];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = i as u8 + 1;
    }
    let cookies = Cookies::new(bytes);

    let start = clock.now();
    let h = create_phase1_sa(&mut manager, cookies, 100);
    assert_eq!(manager.lookup(&cookies, None), Some(h));
    assert_eq!(manager.get(h).unwrap().phase(), Phase::One);

    manager.finalize(h, None, "").unwrap();
    let (soft, hard) = manager.expirations(h);
    let soft = soft.unwrap() - start;
    assert!(soft >= Duration::from_secs(85) && soft < Duration::from_secs(95));
    assert_eq!(hard.unwrap() - start, Duration::from_secs(100));

    clock.advance(Duration::from_secs(100));
    assert_eq!(manager.run_timers(), 2);

    // Gone, and phase 1 deletes are never announced
    assert!(manager.lookup(&cookies, None).is_none());
    assert!(!manager.contains(h));
    assert!(hooks.events().is_empty());

    let stats = manager.metrics().snapshot();
    assert_eq!(stats.soft_expirations, 1);
    assert_eq!(stats.hard_expirations, 1);
    assert_eq!(stats.sa_active, 0);
}

#[test]
fn test_phase1_lookup_by_header() {
    let (mut manager, _, _) = create_test_manager(seeded_config());
    let cookies = Cookies::new([0xa5; 16]);
    let h = create_phase1_sa(&mut manager, cookies, 0);

    let mut msg = vec![0u8; 28];
    msg[..16].copy_from_slice(cookies.as_bytes());
    msg[18] = exchange::ID_PROT;
    assert_eq!(manager.lookup_by_header(&msg, false), Some(h));

    // A truncated header is simply not found
    assert!(manager.lookup_by_header(&msg[..20], false).is_none());
}

#[test]
fn test_stayalive_rekey_then_replace() {
    let (mut manager, clock, hooks) = create_test_manager(seeded_config());
    let old = create_phase1_sa(&mut manager, Cookies::new([1; 16]), 100);
    manager.finalize(old, Some("east"), "stayalive").unwrap();

    // Soft expiry asks for a new negotiation
    clock.advance(Duration::from_secs(95));
    assert_eq!(manager.run_timers(), 1);
    assert_eq!(
        hooks.events(),
        vec![HookEvent::Reestablish {
            name: Some("east".to_string())
        }]
    );

    // The new SA supersedes the old one
    let new = create_phase1_sa(&mut manager, Cookies::new([2; 16]), 100);
    manager.finalize(new, Some("EAST"), "stayalive").unwrap();
    assert_eq!(manager.get(old).unwrap().state(), SaState::Replaced);
    assert_eq!(manager.lookup_by_name("east", Phase::One), Some(new));

    // Replaced SAs die at hard expiry without another rekey
    clock.advance(Duration::from_secs(5));
    assert_eq!(manager.run_timers(), 1);
    assert!(!manager.contains(old));
    assert_eq!(hooks.events().len(), 1);
    assert_eq!(manager.metrics().snapshot().rekeys, 1);
}

#[test]
fn test_stayalive_hard_expiry_rekeys() {
    let (mut manager, clock, hooks) = create_test_manager(seeded_config());
    let h = create_phase1_sa(&mut manager, Cookies::new([3; 16]), 60);
    manager.finalize(h, Some("west"), "stayalive").unwrap();

    clock.advance(Duration::from_secs(60));
    assert_eq!(manager.run_timers(), 2);

    let reestablished = hooks
        .events()
        .iter()
        .filter(|e| matches!(e, HookEvent::Reestablish { .. }))
        .count();
    assert_eq!(reestablished, 2);
    assert!(!manager.contains(h));
}

//
// Test Cases - Phase 2
//

#[test]
fn test_phase2_lookup_by_message_id() {
    let (mut manager, _, _) = create_test_manager(seeded_config());
    let cookies = Cookies::new([0x33; 16]);
    let mid = MessageId::new([9, 9, 9, 9]);
    let doi = manager.doi(IPSEC_DOI).unwrap();
    let ex = Exchange::new(doi, exchange::QUICK_MODE, cookies, mid, false);
    let h = manager.create(&ex, None).unwrap();

    assert_eq!(manager.lookup(&cookies, Some(&mid)), Some(h));
    assert!(manager.lookup(&cookies, None).is_none());
    assert!(manager.lookup(&cookies, Some(&MessageId::ZERO)).is_none());
    assert!(manager
        .lookup(&cookies, Some(&MessageId::new([9, 9, 9, 8])))
        .is_none());
}

#[test]
fn test_phase2_hard_expiry_sends_deletes() {
    let (mut manager, clock, hooks) = create_test_manager(seeded_config());
    let doi = manager.doi(IPSEC_DOI).unwrap();
    let mut ex = Exchange::new(
        doi,
        exchange::QUICK_MODE,
        Cookies::new([0x44; 16]),
        MessageId::new([0, 0, 1, 0]),
        false,
    );
    let h = manager.create(&ex, None).unwrap();
    manager.respond(h, &mut ex, &create_test_esp_ah_offer()).unwrap();

    let sa = manager.get(h).unwrap();
    assert_eq!(sa.protos.len(), 2);
    assert_eq!(sa.seconds, 28800);

    manager.finalize(h, None, "").unwrap();
    clock.advance(Duration::from_secs(28800));
    assert_eq!(manager.run_timers(), 2);

    assert_eq!(
        hooks.events(),
        vec![
            HookEvent::Delete {
                proto: proto::IPSEC_ESP
            },
            HookEvent::Delete {
                proto: proto::IPSEC_AH
            },
        ]
    );
    assert!(!manager.contains(h));
    assert_eq!(manager.metrics().snapshot().deletes_sent, 2);
}

#[test]
fn test_phase2_rejected_offer_notifies() {
    let (mut manager, _, hooks) = create_test_manager(seeded_config());
    let doi = manager.doi(IPSEC_DOI).unwrap();
    let mut ex = Exchange::new(
        doi,
        exchange::QUICK_MODE,
        Cookies::new([0x55; 16]),
        MessageId::new([0, 0, 0, 2]),
        false,
    );
    let h = manager.create(&ex, None).unwrap();

    let mut offer = create_test_esp_ah_offer();
    for prop in &mut offer.proposals {
        prop.transforms = vec![TransformPayload::new(1, 0xee)];
    }
    assert!(manager.respond(h, &mut ex, &offer).is_err());
    assert!(manager.get(h).unwrap().protos.is_empty());
    assert!(matches!(
        hooks.events().as_slice(),
        [HookEvent::Notify { .. }]
    ));
}

//
// Test Cases - Table Growth
//

#[test]
fn test_resize_keep_buckets_strands_moved_sas() {
    let config = SaConfig::builder()
        .with_rng_seed(1)
        .with_resize_policy(ResizePolicy::KeepBuckets)
        .build()
        .unwrap();
    let (mut manager, _, _) = create_test_manager(config);

    let handles: Vec<(Cookies, SaHandle)> = (0..10)
        .map(|i| {
            let cookies = create_resize_cookies(i);
            (cookies, create_phase1_sa(&mut manager, cookies, 0))
        })
        .collect();
    assert_eq!(manager.table().bucket_count(), 64);

    manager.resize().unwrap();
    assert_eq!(manager.table().bucket_count(), 128);

    let mut stranded = 0;
    for (cookies, h) in &handles {
        let moved = bucket_index(cookies, None, 127) != bucket_index(cookies, None, 63);
        if moved {
            stranded += 1;
            assert!(manager.lookup(cookies, None).is_none());
        } else {
            assert_eq!(manager.lookup(cookies, None), Some(*h));
        }
        // Still linked and reachable by a full walk
        assert_eq!(manager.find(|sa| sa.cookies() == cookies), Some(*h));
    }
    assert_eq!(stranded, 5);
    assert_eq!(manager.len(), 10);

    // Deletion follows the recorded bucket
    for (_, h) in handles {
        manager.delete(h, false).unwrap();
    }
    assert!(manager.is_empty());
}

#[test]
fn test_resize_rehash_keeps_everything_reachable() {
    let config = SaConfig::builder()
        .with_rng_seed(1)
        .with_resize_policy(ResizePolicy::Rehash)
        .build()
        .unwrap();
    let (mut manager, _, _) = create_test_manager(config);

    let handles: Vec<(Cookies, SaHandle)> = (0..10)
        .map(|i| {
            let cookies = create_resize_cookies(i);
            (cookies, create_phase1_sa(&mut manager, cookies, 0))
        })
        .collect();

    manager.resize().unwrap();
    assert_eq!(manager.table().bucket_count(), 128);
    for (cookies, h) in &handles {
        assert_eq!(manager.lookup(cookies, None), Some(*h));
    }
    assert_eq!(manager.metrics().snapshot().table_resizes, 1);
}

#[test]
fn test_resize_stops_at_limit() {
    let mut table = SaTable::new(2, 3, ResizePolicy::Rehash).unwrap();
    table.resize().unwrap();
    assert_eq!(table.bucket_count(), 8);
    assert!(matches!(table.resize(), Err(Error::ResourceExhausted(_))));
    assert_eq!(table.bucket_count(), 8);
}

//
// Test Cases - Deletion and Reference Counting
//

#[test]
fn test_delete_is_idempotent() {
    let (mut manager, _, _) = create_test_manager(seeded_config());
    let h = create_phase1_sa(&mut manager, Cookies::new([6; 16]), 0);

    manager.delete(h, false).unwrap();
    assert!(matches!(manager.delete(h, false), Err(Error::SaNotFound(_))));

    let stats = manager.metrics().snapshot();
    assert_eq!(stats.sa_deleted, 1);
    assert_eq!(stats.sa_freed, 1);
}

#[test]
fn test_reference_release_round_trip() {
    let (mut manager, _, _) = create_test_manager(seeded_config());
    let cookies = Cookies::new([7; 16]);
    let h = create_phase1_sa(&mut manager, cookies, 0);

    assert_eq!(manager.reference(h).unwrap(), 2);
    manager.release(h).unwrap();
    assert_eq!(manager.refcnt(h), Some(1));
    assert_eq!(manager.lookup(&cookies, None), Some(h));

    // A holder keeps the SA alive past deletion
    manager.reference(h).unwrap();
    manager.delete(h, false).unwrap();
    assert!(manager.lookup(&cookies, None).is_none());
    assert!(manager.get(h).is_some());
    manager.release(h).unwrap();
    assert!(manager.get(h).is_none());
}

#[test]
fn test_many_sas_all_found() {
    let (mut manager, _, _) = create_test_manager(seeded_config());
    let cookies: Vec<Cookies> = (0..200).map(|_| Cookies::random_initiator()).collect();
    let handles: Vec<SaHandle> = cookies
        .iter()
        .map(|c| create_phase1_sa(&mut manager, *c, 0))
        .collect();

    for (c, h) in cookies.iter().zip(&handles) {
        assert_eq!(manager.lookup(c, None), Some(*h));
    }
    assert_eq!(manager.shutdown(), 200);
    assert!(manager.is_empty());
}

#[test]
fn test_flags_survive_report() {
    let (mut manager, _, _) = create_test_manager(seeded_config());
    let h = create_phase1_sa(&mut manager, Cookies::new([8; 16]), 0);
    manager.finalize(h, Some("north"), "ondemand").unwrap();

    let sa = manager.get(h).unwrap();
    assert!(sa.flags.contains(SaFlags::READY));
    assert!(sa.flags.contains(SaFlags::ONDEMAND));

    let report = manager.report();
    assert!(report.contains("north"));
    assert!(report.contains("0808080808080808"));
}
