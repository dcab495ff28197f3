//! The SA manager
//!
//! [`SaManager`] owns every piece of SA state: the table with its arena,
//! the DOI registry, the expiry timer queue and the hooks into the
//! exchange engine. All mutation goes through `&mut self`, so there is
//! exactly one writer at a time; the async [`driver`](crate::driver) shares
//! it behind a `tokio::sync::Mutex`.
//!
//! # Ownership
//!
//! ```text
//!            ┌──────── table share (1) ────────┐
//!  SaHandle ─┼──────── soft timer  (0/1) ──────┼──► refcnt ──0──► teardown
//!            ├──────── hard timer  (0/1) ──────┤
//!            └──────── callers (reference) ────┘
//! ```
//!
//! Teardown order: protos (SPIs back to the DOI, then proto data), SA data,
//! identities, received certificate (through its handler), received key,
//! policy session, name, key state, transport.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::SaConfig;
use crate::cookie::{Cookies, MessageId, COOKIE_LEN};
use crate::credentials::CertHandlers;
use crate::doi::{Doi, DoiRegistry};
use crate::exchange::Exchange;
use crate::expiry::ExpiryEvent;
use crate::hooks::{ExchangeHooks, NullHooks};
use crate::logging;
use crate::metrics::SaMetrics;
use crate::payload::{exchange, IsakmpHeader, ProposalPayload, SaPayload, TransformPayload};
use crate::sa::{
    Phase, Proto, Released, SaFlags, SaHandle, SaTable, SecurityAssociation, INITIATOR, RESPONDER,
};
use crate::timer::{Clock, SystemClock, TimerQueue};
use crate::transport::Transport;
use crate::{Error, Result};

/// Owning context of all SAs
pub struct SaManager {
    pub(crate) config: SaConfig,
    pub(crate) table: SaTable,
    dois: DoiRegistry,
    pub(crate) timers: TimerQueue<ExpiryEvent>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) rng: StdRng,
    pub(crate) hooks: Box<dyn ExchangeHooks>,
    certs: CertHandlers,
    pub(crate) metrics: SaMetrics,
}

/// Phase an exchange type belongs to; `None` when it may run in either
fn exchange_phase(exchange_type: u8) -> Option<Phase> {
    match exchange_type {
        exchange::BASE | exchange::ID_PROT | exchange::AUTH_ONLY | exchange::AGGRESSIVE => {
            Some(Phase::One)
        }
        exchange::QUICK_MODE | exchange::NEW_GROUP_MODE => Some(Phase::Two),
        _ => None,
    }
}

/// Do both handles point at the same DOI instance?
fn same_doi(a: &Arc<dyn Doi>, b: &Arc<dyn Doi>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl SaManager {
    /// Create manager with the ISAKMP and IPsec DOIs registered
    ///
    /// Fails with [`Error::Config`] if the configuration is invalid.
    pub fn new(config: SaConfig) -> Result<Self> {
        config.validate()?;
        let table = SaTable::new(
            config.bucket_bits,
            config.max_bucket_bits,
            config.resize_policy,
        )?;
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        tracing::debug!(
            buckets = table.bucket_count(),
            policy = ?config.resize_policy,
            "SA manager created"
        );
        Ok(SaManager {
            timers: TimerQueue::new(config.max_timers),
            config,
            table,
            dois: DoiRegistry::with_defaults(),
            clock: Arc::new(SystemClock),
            rng,
            hooks: Box::new(NullHooks),
            certs: CertHandlers::new(),
            metrics: SaMetrics::new(),
        })
    }

    /// Replace the exchange engine hooks
    pub fn with_hooks(mut self, hooks: impl ExchangeHooks + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    /// Replace the clock used for expirations
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the DOI registry
    pub fn with_registry(mut self, dois: DoiRegistry) -> Self {
        self.dois = dois;
        self
    }

    /// Register a DOI
    pub fn register_doi(&mut self, doi: Arc<dyn Doi>) -> Result<()> {
        self.dois.register(doi)
    }

    /// DOI registered under `id`
    pub fn doi(&self, id: u32) -> Option<Arc<dyn Doi>> {
        self.dois.lookup(id)
    }

    /// Certificate handlers used at teardown
    pub fn cert_handlers_mut(&mut self) -> &mut CertHandlers {
        &mut self.certs
    }

    /// Configuration in use
    pub fn config(&self) -> &SaConfig {
        &self.config
    }

    /// Metrics
    pub fn metrics(&self) -> &SaMetrics {
        &self.metrics
    }

    /// The SA table
    pub fn table(&self) -> &SaTable {
        &self.table
    }

    /// Create an SA for `exchange` and link it into the table
    ///
    /// The SA's reference count is 1 (the table share). The exchange must
    /// be bound to the DOI instance registered under its id. Phase 1
    /// exchange types need an all-zero message ID, phase 2 types a
    /// non-zero one. On failure nothing is left in the table.
    pub fn create(
        &mut self,
        exchange: &Exchange,
        transport: Option<Arc<dyn Transport>>,
    ) -> Result<SaHandle> {
        let doi = exchange.doi();
        let doi = match self.dois.lookup(doi.id()) {
            Some(registered) if same_doi(&registered, doi) => registered,
            _ => return Err(Error::DoiNotSupported(doi.id())),
        };
        let phase = exchange.phase();
        if let Some(expected) = exchange_phase(exchange.exchange_type) {
            if expected != phase {
                return Err(Error::InvalidState(format!(
                    "exchange type {} is phase {} but message ID {:?} implies phase {}",
                    exchange.exchange_type,
                    expected.as_u8(),
                    exchange.message_id,
                    phase.as_u8()
                )));
            }
        }

        let mut sa = SecurityAssociation::new(exchange.cookies, exchange.message_id, doi.clone());
        sa.initiator = exchange.initiator;
        sa.exch_type = exchange.exchange_type;
        sa.name = exchange.name.clone();
        sa.set_transport(transport);

        let h = self.table.alloc(sa);
        if let Err(e) = self.table.insert(h) {
            if let Some(Released::Freed(sa)) = self.table.release(h).ok() {
                self.teardown(sa);
            }
            return Err(e);
        }

        self.metrics.record_sa_created();
        logging::log_sa_created(
            exchange.cookies.as_bytes(),
            exchange.message_id.as_bytes(),
            phase.as_u8(),
            doi.name(),
        );
        Ok(h)
    }

    /// Find an SA by cookies, and message ID for phase 2
    pub fn lookup(&self, cookies: &Cookies, message_id: Option<&MessageId>) -> Option<SaHandle> {
        let found = self.table.lookup(cookies, message_id);
        self.metrics.record_lookup(found.is_some());
        found
    }

    /// Find the SA a raw message belongs to
    ///
    /// With `phase2` the header's message ID is part of the key. A buffer
    /// shorter than an ISAKMP header finds nothing.
    pub fn lookup_by_header(&self, msg: &[u8], phase2: bool) -> Option<SaHandle> {
        let Some(hdr) = IsakmpHeader::from_bytes(msg) else {
            self.metrics.record_lookup(false);
            return None;
        };
        let message_id = if phase2 { Some(&hdr.message_id) } else { None };
        self.lookup(&hdr.cookies, message_id)
    }

    /// Find a phase 1 SA by initiator cookie alone
    ///
    /// Used before the responder cookie is known.
    pub fn lookup_from_icookie(&self, icookie: &[u8]) -> Option<SaHandle> {
        if icookie.len() != COOKIE_LEN {
            return None;
        }
        self.table
            .find(|sa| sa.phase() == Phase::One && sa.cookies().icookie() == icookie)
    }

    /// Find a phase 1 SA with `peer`
    ///
    /// SAs marked REPLACED are skipped, so a peer with a renegotiated SA
    /// resolves to the new one.
    pub fn lookup_by_peer(&self, peer: SocketAddr) -> Option<SaHandle> {
        self.table.find(|sa| {
            sa.phase() == Phase::One
                && !sa.flags.contains(SaFlags::REPLACED)
                && sa.transport().map_or(false, |t| t.peer_addr() == peer)
        })
    }

    /// Find a ready, unreplaced SA by connection name (case-insensitive)
    pub fn lookup_by_name(&self, name: &str, phase: Phase) -> Option<SaHandle> {
        self.table.find(|sa| {
            sa.phase() == phase
                && sa.flags.contains(SaFlags::READY)
                && !sa.flags.contains(SaFlags::REPLACED)
                && sa
                    .name
                    .as_deref()
                    .map_or(false, |n| n.eq_ignore_ascii_case(name))
        })
    }

    /// First SA matching `pred`, scanning every bucket
    pub fn find<F>(&self, pred: F) -> Option<SaHandle>
    where
        F: FnMut(&SecurityAssociation) -> bool,
    {
        self.table.find(pred)
    }

    /// SA behind `h`
    pub fn get(&self, h: SaHandle) -> Option<&SecurityAssociation> {
        self.table.get(h)
    }

    /// Mutable SA behind `h`
    ///
    /// Use [`rekey_identity`](Self::rekey_identity) to change the cookies
    /// of a linked SA.
    pub fn get_mut(&mut self, h: SaHandle) -> Option<&mut SecurityAssociation> {
        self.table.get_mut(h)
    }

    /// Is `h` linked into the table?
    pub fn contains(&self, h: SaHandle) -> bool {
        self.table.contains(h)
    }

    /// Reference count of `h`
    pub fn refcnt(&self, h: SaHandle) -> Option<u32> {
        self.table.refcnt(h)
    }

    /// Take a reference on `h`
    pub fn reference(&mut self, h: SaHandle) -> Result<u32> {
        self.table.reference(h)
    }

    /// Drop a reference on `h`; the last one tears the SA down
    pub fn release(&mut self, h: SaHandle) -> Result<()> {
        if let Released::Freed(sa) = self.table.release(h)? {
            self.teardown(sa);
        }
        Ok(())
    }

    pub(crate) fn teardown(&mut self, mut sa: SecurityAssociation) {
        logging::log_sa_freed(sa.cookies().as_bytes(), sa.message_id().as_bytes());
        let doi = sa.doi().clone();

        for mut proto in std::mem::take(&mut sa.protos) {
            self.release_proto(&doi, &sa, &mut proto);
        }
        doi.free_sa_data(std::mem::take(&mut sa.data));
        sa.id_i.clear();
        sa.id_r.clear();
        if let Some(cert) = sa.recv_cert.take() {
            self.certs.release(cert);
        }
        sa.recv_key = None;
        if let Some(mut session) = sa.policy_session.take() {
            session.close();
        }
        sa.name = None;
        sa.keystate = None;
        sa.last_sent = None;
        sa.take_transport();

        self.metrics.record_sa_freed();
    }

    fn release_proto(&self, doi: &Arc<dyn Doi>, sa: &SecurityAssociation, proto: &mut Proto) {
        for index in [RESPONDER, INITIATOR] {
            if proto.spi_sz(index) == 0 {
                continue;
            }
            if let Err(e) = doi.delete_spi(sa, proto, index) {
                tracing::warn!(
                    proto = proto.proto,
                    spi = %hex::encode(&proto.spi[index]),
                    error = %e,
                    "failed to release SPI"
                );
            }
            proto.spi[index].clear();
        }
        doi.free_proto_data(std::mem::take(&mut proto.data));
    }

    /// Offer protocol `proto` under proposal `no` (initiator side)
    ///
    /// Our SPI comes from the DOI and goes into the initiator slot.
    pub fn add_proto(&mut self, h: SaHandle, no: u8, proto: u8) -> Result<()> {
        let sa = self
            .table
            .get_mut(h)
            .ok_or_else(|| Error::SaNotFound(h.to_string()))?;
        let doi = sa.doi().clone();
        doi.validate_proto(proto)?;

        let mut p = Proto::new(no, proto);
        p.spi[INITIATOR] = doi.get_spi(sa, proto)?;
        logging::log_proto_added(sa.cookies().as_bytes(), proto, no, &p.spi[INITIATOR]);
        sa.protos.push(p);
        Ok(())
    }

    /// Record the transform chosen for `proposal`
    ///
    /// As responder a new proto is created holding the peer's SPI and one
    /// allocated by the DOI; if that fails only the new proto is undone.
    /// As initiator the proto offered earlier under the same proposal
    /// number is completed with the responder's SPI.
    pub fn add_transform(
        &mut self,
        h: SaHandle,
        proposal: &ProposalPayload,
        transform: &TransformPayload,
        initiator: bool,
    ) -> Result<()> {
        let sa = self
            .table
            .get_mut(h)
            .ok_or_else(|| Error::SaNotFound(h.to_string()))?;
        let doi = sa.doi().clone();

        if initiator {
            let index = sa
                .protos
                .iter()
                .position(|p| p.no == proposal.no && p.proto == proposal.proto)
                .ok_or_else(|| {
                    Error::InvalidState(format!(
                        "no proto {} offered under proposal {}",
                        proposal.proto, proposal.no
                    ))
                })?;
            let data = doi.new_proto_data(sa, proposal, transform)?;
            let p = &mut sa.protos[index];
            p.spi[RESPONDER] = proposal.spi.clone();
            p.id = transform.id;
            p.data = data;
            return Ok(());
        }

        let mut p = Proto::new(proposal.no, proposal.proto);
        p.id = transform.id;
        p.spi[INITIATOR] = proposal.spi.clone();
        p.spi[RESPONDER] = doi.get_spi(sa, proposal.proto)?;
        match doi.new_proto_data(sa, proposal, transform) {
            Ok(data) => {
                p.data = data;
                logging::log_proto_added(
                    sa.cookies().as_bytes(),
                    p.proto,
                    p.no,
                    &p.spi[RESPONDER],
                );
                sa.protos.push(p);
                Ok(())
            }
            Err(e) => {
                if p.spi_sz(RESPONDER) > 0 {
                    if let Err(err) = doi.delete_spi(sa, &p, RESPONDER) {
                        tracing::warn!(error = %err, "failed to release SPI of rejected proto");
                    }
                }
                Err(e)
            }
        }
    }

    /// Run the responder side of `exchange` against the peer's offer
    ///
    /// The chosen transforms are recorded on `h`. A validation failure is
    /// reported to the peer with the matching notification.
    pub fn respond(
        &mut self,
        h: SaHandle,
        exchange: &mut Exchange,
        offer: &SaPayload,
    ) -> Result<()> {
        let doi = exchange.doi().clone();
        let result = doi.responder(exchange, offer).and_then(|()| {
            exchange
                .chosen
                .iter()
                .try_for_each(|sel| self.add_transform(h, &sel.proposal, &sel.transform, false))
        });
        if let Err(e) = &result {
            if *e == Error::NoProposalChosen {
                self.metrics.record_proposal_rejected();
            }
            self.report_failure(h, doi.as_ref(), "responder", e);
        }
        result
    }

    /// Run the initiator side of `exchange` one step
    pub fn initiate(&mut self, h: SaHandle, exchange: &mut Exchange) -> Result<()> {
        let doi = exchange.doi().clone();
        let result = doi.initiator(exchange);
        if let Err(e) = &result {
            self.report_failure(h, doi.as_ref(), "initiator", e);
        }
        result
    }

    fn report_failure(&mut self, h: SaHandle, doi: &dyn Doi, what: &str, e: &Error) {
        let notify_type = e.notify_type();
        logging::log_validation_failed(doi.name(), what, &e.to_string(), notify_type);
        if let (Some(code), Some(sa)) = (notify_type, self.table.get(h)) {
            self.hooks.send_notify(sa, code);
        }
    }

    /// Learn the responder cookie of a phase 1 SA
    ///
    /// The SA is moved to the bucket of its complete cookie pair, and
    /// takes `transport` if one is given.
    pub fn rekey_identity(
        &mut self,
        h: SaHandle,
        rcookie: [u8; COOKIE_LEN],
        transport: Option<Arc<dyn Transport>>,
    ) -> Result<()> {
        let sa = self
            .table
            .get(h)
            .ok_or_else(|| Error::SaNotFound(h.to_string()))?;
        if sa.phase() != Phase::One {
            return Err(Error::InvalidState(format!(
                "SA {} is phase 2, its cookies are fixed",
                h
            )));
        }
        let old = *sa.cookies();
        self.table.relink(h, |sa| {
            sa.cookies_mut().set_rcookie(rcookie);
            if transport.is_some() {
                sa.set_transport(transport);
            }
        })?;
        if let Some(sa) = self.table.get(h) {
            logging::log_sa_upgraded(old.as_bytes(), sa.cookies().as_bytes());
        }
        Ok(())
    }

    /// Mark the SA established
    ///
    /// Sets READY plus the configured flags (a comma separated list such
    /// as `"stayalive,ondemand"`), marks older SAs of the same connection
    /// as replaced and arms the expiry timers.
    pub fn finalize(&mut self, h: SaHandle, name: Option<&str>, flag_names: &str) -> Result<()> {
        let flags: SaFlags = flag_names.parse()?;
        let sa = self
            .table
            .get_mut(h)
            .ok_or_else(|| Error::SaNotFound(h.to_string()))?;
        if let Some(name) = name {
            sa.name = Some(name.to_string());
        }
        sa.flags.insert(SaFlags::READY | flags.bits());
        logging::log_sa_ready(
            sa.cookies().as_bytes(),
            sa.name.as_deref(),
            &sa.flags.to_string(),
            sa.seconds,
        );

        for old in self.superseded_by(h) {
            self.mark_replaced(old)?;
            if let (Some(o), Some(n)) = (self.table.get(old), self.table.get(h)) {
                logging::log_sa_replaced(
                    o.cookies().as_bytes(),
                    n.cookies().as_bytes(),
                    n.name.as_deref(),
                );
            }
        }

        self.setup_expirations(h)
    }

    fn superseded_by(&self, h: SaHandle) -> Vec<SaHandle> {
        let Some(new) = self.table.get(h) else {
            return Vec::new();
        };
        let Some(name) = new.name.as_deref() else {
            return Vec::new();
        };
        let ids = new.local_remote_ids();
        self.table
            .iter()
            .filter(|&(other, sa)| {
                other != h
                    && sa.phase() == new.phase()
                    && sa.flags.contains(SaFlags::READY)
                    && !sa.flags.contains(SaFlags::REPLACED)
                    && sa
                        .name
                        .as_deref()
                        .map_or(false, |n| n.eq_ignore_ascii_case(name))
                    && sa.local_remote_ids() == ids
            })
            .map(|(other, _)| other)
            .collect()
    }

    /// Flag the SA as superseded
    pub fn mark_replaced(&mut self, h: SaHandle) -> Result<()> {
        let sa = self
            .table
            .get_mut(h)
            .ok_or_else(|| Error::SaNotFound(h.to_string()))?;
        sa.flags.insert(SaFlags::REPLACED);
        Ok(())
    }

    /// Renegotiate a phase 1 SA and delete the old one
    pub fn rekey_p1(&mut self, h: SaHandle) -> Result<()> {
        let sa = self
            .table
            .get_mut(h)
            .ok_or_else(|| Error::SaNotFound(h.to_string()))?;
        if sa.phase() != Phase::One {
            return Err(Error::InvalidState(format!("SA {} is not phase 1", h)));
        }
        sa.flags.insert(SaFlags::REPLACED);
        self.hooks.reestablish(sa);
        self.metrics.record_rekey();
        self.delete(h, true)
    }

    /// Remove the SA from the table
    ///
    /// With `notify`, a phase 2 SA sends a DELETE per proto; phase 1 SAs
    /// never do. Both expiry timers are cancelled first. The SA is torn
    /// down once no other references remain. Deleting an SA that is no
    /// longer in the table fails with [`Error::SaNotFound`].
    pub fn delete(&mut self, h: SaHandle, notify: bool) -> Result<()> {
        if !self.table.contains(h) {
            return Err(Error::SaNotFound(h.to_string()));
        }
        let sa = self
            .table
            .get(h)
            .ok_or_else(|| Error::SaNotFound(h.to_string()))?;
        logging::log_sa_deleted(sa.cookies().as_bytes(), sa.phase().as_u8(), notify);
        if notify && sa.phase() != Phase::One {
            for proto in &sa.protos {
                self.hooks.send_delete(sa, proto);
                self.metrics.record_delete_sent();
            }
        }

        self.cancel_expirations(h)?;
        self.metrics.record_sa_deleted();
        if let Released::Freed(sa) = self.table.remove(h)? {
            self.teardown(sa);
        }
        Ok(())
    }

    /// Human readable dump of every SA in the table
    pub fn report(&self) -> String {
        let mut out = String::new();
        for (h, sa) in self.table.iter() {
            let _ = writeln!(
                out,
                "SA {} cookies {} msgid {} phase {} doi {} flags {} refcnt {} name {} lifetime {}s/{}KB",
                h,
                hex::encode(sa.cookies().as_bytes()),
                hex::encode(sa.message_id().as_bytes()),
                sa.phase().as_u8(),
                sa.doi().name(),
                sa.flags,
                self.table.refcnt(h).unwrap_or(0),
                sa.name.as_deref().unwrap_or("<unnamed>"),
                sa.seconds,
                sa.kilobytes,
            );
            if let Some(t) = sa.transport() {
                let _ = writeln!(out, "  transport {}", t.decode_ids());
            }
            if !sa.id_i.is_empty() || !sa.id_r.is_empty() {
                let _ = writeln!(out, "  {}", sa.doi().decode_ids(&sa.id_i, &sa.id_r));
            }
            for p in &sa.protos {
                let _ = writeln!(
                    out,
                    "  proto {} no {} transform {} spi_r {} spi_i {}",
                    p.proto,
                    p.no,
                    p.id,
                    hex::encode(&p.spi[RESPONDER]),
                    hex::encode(&p.spi[INITIATOR]),
                );
            }
        }
        logging::log_sa_report(&out);
        out
    }

    /// Double the table size
    pub fn resize(&mut self) -> Result<()> {
        self.table.resize()?;
        self.metrics.record_table_resize();
        logging::log_table_resized(self.table.bucket_count(), self.table.len());
        Ok(())
    }

    /// Delete every SA without notifying peers; returns how many
    pub fn shutdown(&mut self) -> usize {
        let handles = self.table.handles();
        let mut deleted = 0;
        for h in handles {
            match self.delete(h, false) {
                Ok(()) => deleted += 1,
                Err(e) => tracing::debug!(sa = %h, error = %e, "skipped during shutdown"),
            }
        }
        deleted
    }

    /// Earliest pending expiry
    pub fn next_expiry(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Time left until the earliest pending expiry, by the manager's clock
    pub fn time_to_next_expiry(&self) -> Option<Duration> {
        self.timers
            .next_deadline()
            .map(|at| at.saturating_duration_since(self.clock.now()))
    }

    /// Number of pending expiry timers
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Number of SAs in the table
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Is the table empty?
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl std::fmt::Debug for SaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaManager")
            .field("sas", &self.table.len())
            .field("buckets", &self.table.bucket_count())
            .field("timers", &self.timers.len())
            .field("dois", &self.dois.ids())
            .finish()
    }
}
