//! SA lifetime expiration
//!
//! Every SA with a lifetime gets two timers when it is finalized:
//!
//! ```text
//! arm ─────────────── soft ──────── hard
//!  0        [0.85, 0.95) * seconds   seconds
//! ```
//!
//! - **Soft**: a STAYALIVE SA that has not been replaced is renegotiated;
//!   any other SA is marked FADING so it gets replaced on next use.
//! - **Hard**: a STAYALIVE SA that has not been replaced is marked
//!   REPLACED and renegotiated; then the SA is deleted, notifying the peer
//!   (phase 2 only).
//!
//! Each armed timer holds one reference on its SA, dropped when it fires
//! or is cancelled.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::logging;
use crate::manager::SaManager;
use crate::sa::{Released, SaFlags, SaHandle};
use crate::{Error, Result};

/// Which of the two lifetimes ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryKind {
    /// Advisory, triggers rekeying
    Soft,
    /// Final, the SA goes away
    Hard,
}

impl ExpiryKind {
    fn as_str(self) -> &'static str {
        match self {
            ExpiryKind::Soft => "soft",
            ExpiryKind::Hard => "hard",
        }
    }
}

/// Scheduled expiration of one SA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryEvent {
    /// SA the timer belongs to
    pub sa: SaHandle,
    /// Soft or hard
    pub kind: ExpiryKind,
}

impl SaManager {
    /// Arm the soft and hard timers of `h`
    ///
    /// Does nothing for an SA without a lifetime, or one whose lifetime
    /// overflows the clock, and leaves already armed timers alone. If a timer cannot be registered the SA is deleted and
    /// the registration error returned.
    pub fn setup_expirations(&mut self, h: SaHandle) -> Result<()> {
        let sa = self
            .table
            .get(h)
            .ok_or_else(|| Error::SaNotFound(h.to_string()))?;
        if sa.seconds == 0 {
            return Ok(());
        }
        let seconds = sa.seconds;
        let (soft_armed, hard_armed) = (sa.soft_armed(), sa.hard_armed());
        let now = self.clock.now();

        // A deadline past what the clock can represent never comes
        let Some(hard_at) = now.checked_add(Duration::from_secs(seconds)) else {
            logging::log_lifetime_unbounded(sa.cookies().as_bytes(), seconds);
            return Ok(());
        };

        if !soft_armed {
            let fraction = self
                .rng
                .gen_range(self.config.soft_expiry_min..self.config.soft_expiry_max);
            let soft_at = Duration::try_from_secs_f64(seconds as f64 * fraction)
                .ok()
                .and_then(|d| now.checked_add(d))
                .unwrap_or(hard_at);
            self.arm(h, soft_at, ExpiryKind::Soft)?;
        }
        if !hard_armed {
            self.arm(h, hard_at, ExpiryKind::Hard)?;
        }
        Ok(())
    }

    fn arm(&mut self, h: SaHandle, at: Instant, kind: ExpiryKind) -> Result<()> {
        let id = match self.timers.schedule(at, ExpiryEvent { sa: h, kind }) {
            Ok(id) => id,
            Err(e) => {
                self.metrics.record_timer_failure();
                if let Some(sa) = self.table.get(h) {
                    logging::log_timer_failure(sa.cookies().as_bytes(), kind.as_str(), &e.to_string());
                }
                if let Err(err) = self.delete(h, true) {
                    tracing::debug!(sa = %h, error = %err, "SA already gone");
                }
                return Err(e);
            }
        };
        self.table.reference(h)?;
        if let Some(sa) = self.table.get_mut(h) {
            match kind {
                ExpiryKind::Soft => sa.soft_timer = Some(id),
                ExpiryKind::Hard => sa.hard_timer = Some(id),
            }
        }
        self.metrics.record_timer_armed();
        tracing::debug!(sa = %h, timer = %id, kind = kind.as_str(), "expiry armed");
        Ok(())
    }

    /// Cancel both timers of `h`, dropping their references
    pub(crate) fn cancel_expirations(&mut self, h: SaHandle) -> Result<()> {
        let sa = self
            .table
            .get_mut(h)
            .ok_or_else(|| Error::SaNotFound(h.to_string()))?;
        let timers = [sa.soft_timer.take(), sa.hard_timer.take()];
        for id in timers.into_iter().flatten() {
            if self.timers.cancel(id).is_some() {
                if let Released::Freed(sa) = self.table.release(h)? {
                    self.teardown(sa);
                }
            }
        }
        Ok(())
    }

    /// Deadlines of the soft and hard timers of `h`
    pub fn expirations(&self, h: SaHandle) -> (Option<Instant>, Option<Instant>) {
        let Some(sa) = self.table.get(h) else {
            return (None, None);
        };
        (
            sa.soft_timer.and_then(|id| self.timers.deadline(id)),
            sa.hard_timer.and_then(|id| self.timers.deadline(id)),
        )
    }

    /// Fire every timer that is due; returns how many fired
    pub fn run_timers(&mut self) -> usize {
        let now = self.clock.now();
        let mut fired = 0;
        while let Some((_, event)) = self.timers.pop_due(now) {
            self.fire(event);
            fired += 1;
        }
        fired
    }

    fn fire(&mut self, event: ExpiryEvent) {
        let h = event.sa;
        let Some(sa) = self.table.get_mut(h) else {
            tracing::debug!(sa = %h, "expiry for freed SA ignored");
            return;
        };
        match event.kind {
            ExpiryKind::Soft => sa.soft_timer = None,
            ExpiryKind::Hard => sa.hard_timer = None,
        }

        // The timer's share goes first
        match self.table.release(h) {
            Ok(Released::Alive(_)) => {}
            Ok(Released::Freed(sa)) => {
                self.teardown(sa);
                return;
            }
            Err(e) => {
                tracing::warn!(sa = %h, error = %e, "expiry release failed");
                return;
            }
        }

        match event.kind {
            ExpiryKind::Soft => self.soft_expire(h),
            ExpiryKind::Hard => self.hard_expire(h),
        }
    }

    fn soft_expire(&mut self, h: SaHandle) {
        let Some(sa) = self.table.get_mut(h) else {
            return;
        };
        self.metrics.record_soft_expired();
        let rekey = sa.flags.contains(SaFlags::STAYALIVE) && !sa.flags.contains(SaFlags::REPLACED);
        if rekey {
            self.hooks.reestablish(sa);
            self.metrics.record_rekey();
        } else {
            sa.flags.insert(SaFlags::FADING);
        }
        logging::log_sa_expired(sa.cookies().as_bytes(), ExpiryKind::Soft.as_str(), rekey);
    }

    fn hard_expire(&mut self, h: SaHandle) {
        let Some(sa) = self.table.get_mut(h) else {
            return;
        };
        self.metrics.record_hard_expired();
        let rekey = sa.flags.contains(SaFlags::STAYALIVE) && !sa.flags.contains(SaFlags::REPLACED);
        if rekey {
            sa.flags.insert(SaFlags::REPLACED);
            self.hooks.reestablish(sa);
            self.metrics.record_rekey();
        }
        logging::log_sa_expired(sa.cookies().as_bytes(), ExpiryKind::Hard.as_str(), rekey);

        if let Err(e) = self.delete(h, true) {
            tracing::debug!(sa = %h, error = %e, "SA gone before hard expiry");
        }
    }
}
