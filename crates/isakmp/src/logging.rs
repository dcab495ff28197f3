//! Structured logging for SA management
//!
//! Provides structured, contextual logging using the `tracing` framework.
//! Cookies and message IDs are rendered in hex.
//!
//! # Log Levels
//!
//! - **DEBUG**: Proto registration, lookups, timer bookkeeping
//! - **INFO**: SA creation, finalisation, expiry, deletion
//! - **WARN**: Validation failures, timer registration failures
//!
//! # Example
//!
//! ```no_run
//! use fynx_isakmp::logging;
//!
//! tracing_subscriber::fmt()
//!     .with_env_filter("fynx_isakmp=debug")
//!     .init();
//!
//! logging::log_sa_created(&[0x01; 16], &[0; 4], 1, "IPSEC");
//! ```

use tracing::{debug, info, warn};

/// Log SA creation
///
/// # Arguments
///
/// * `cookies` - Initiator and responder cookies
/// * `message_id` - Message ID, zero for phase 1
/// * `phase` - 1 or 2
/// * `doi` - DOI name
pub fn log_sa_created(cookies: &[u8], message_id: &[u8], phase: u8, doi: &str) {
    info!(
        cookies = %hex::encode(cookies),
        message_id = %hex::encode(message_id),
        phase = phase,
        doi = doi,
        "SA created"
    );
}

/// Log SA finalisation
///
/// # Arguments
///
/// * `cookies` - Cookies of the SA
/// * `name` - Connection name, if any
/// * `flags` - Flags after finalisation
/// * `seconds` - Lifetime in seconds
pub fn log_sa_ready(cookies: &[u8], name: Option<&str>, flags: &str, seconds: u64) {
    info!(
        cookies = %hex::encode(cookies),
        name = name.unwrap_or("-"),
        flags = flags,
        lifetime_secs = seconds,
        "SA ready"
    );
}

/// Log SA deletion
///
/// # Arguments
///
/// * `cookies` - Cookies of the SA
/// * `phase` - 1 or 2
/// * `notify` - Whether the peer is told
pub fn log_sa_deleted(cookies: &[u8], phase: u8, notify: bool) {
    info!(
        cookies = %hex::encode(cookies),
        phase = phase,
        notify = notify,
        "SA deleted"
    );
}

/// Log SA teardown after the last reference is gone
pub fn log_sa_freed(cookies: &[u8], message_id: &[u8]) {
    debug!(
        cookies = %hex::encode(cookies),
        message_id = %hex::encode(message_id),
        "SA freed"
    );
}

/// Log expiry
///
/// # Arguments
///
/// * `cookies` - Cookies of the SA
/// * `kind` - "soft" or "hard"
/// * `rekey` - Whether a renegotiation was requested
pub fn log_sa_expired(cookies: &[u8], kind: &str, rekey: bool) {
    info!(
        cookies = %hex::encode(cookies),
        kind = kind,
        rekey = rekey,
        "SA expired"
    );
}

/// Log a phase 1 SA learning its responder cookie
pub fn log_sa_upgraded(old_cookies: &[u8], new_cookies: &[u8]) {
    info!(
        old_cookies = %hex::encode(old_cookies),
        new_cookies = %hex::encode(new_cookies),
        "SA upgraded"
    );
}

/// Log an SA superseded by a newer one
pub fn log_sa_replaced(old_cookies: &[u8], new_cookies: &[u8], name: Option<&str>) {
    info!(
        old_cookies = %hex::encode(old_cookies),
        new_cookies = %hex::encode(new_cookies),
        name = name.unwrap_or("-"),
        "SA replaced"
    );
}

/// Log a proto added to an SA
///
/// # Arguments
///
/// * `cookies` - Cookies of the SA
/// * `proto` - Protocol identifier
/// * `no` - Proposal number
/// * `spi` - Local SPI, empty if none
pub fn log_proto_added(cookies: &[u8], proto: u8, no: u8, spi: &[u8]) {
    debug!(
        cookies = %hex::encode(cookies),
        proto = proto,
        proposal = no,
        spi = %hex::encode(spi),
        "Proto added"
    );
}

/// Log a DOI validation failure
///
/// # Arguments
///
/// * `doi` - DOI name
/// * `what` - What was being validated
/// * `error` - Error message
/// * `notify_type` - Notification sent to the peer, if any
pub fn log_validation_failed(doi: &str, what: &str, error: &str, notify_type: Option<u16>) {
    warn!(
        doi = doi,
        what = what,
        error = error,
        notify_type = notify_type,
        "Validation failed"
    );
}

/// Log a timer that could not be armed
pub fn log_timer_failure(cookies: &[u8], kind: &str, error: &str) {
    warn!(
        cookies = %hex::encode(cookies),
        kind = kind,
        error = error,
        "Expiry timer registration failed, deleting SA"
    );
}

/// Log a lifetime too long to schedule; the SA is left without expiry
pub fn log_lifetime_unbounded(cookies: &[u8], seconds: u64) {
    warn!(
        cookies = %hex::encode(cookies),
        lifetime_secs = seconds,
        "Lifetime beyond clock range, expiry not armed"
    );
}

/// Log a table resize
pub fn log_table_resized(buckets: usize, linked: usize) {
    info!(buckets = buckets, linked = linked, "SA table resized");
}

/// Log the SA report, one event per line
pub fn log_sa_report(report: &str) {
    for line in report.lines() {
        debug!(target: "fynx_isakmp::report", "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_functions() {
        // Output needs a subscriber; these only check the calls execute
        let cookies = [0x11u8; 16];
        log_sa_created(&cookies, &[0; 4], 1, "IPSEC");
        log_sa_ready(&cookies, Some("east"), "ready,stayalive", 3600);
        log_sa_ready(&cookies, None, "ready", 0);
        log_sa_deleted(&cookies, 2, true);
        log_sa_freed(&cookies, &[0, 0, 0, 1]);
        log_sa_expired(&cookies, "soft", true);
        log_sa_upgraded(&cookies, &[0x22; 16]);
        log_sa_replaced(&cookies, &[0x22; 16], Some("east"));
        log_proto_added(&cookies, 3, 1, &[0xde, 0xad, 0xbe, 0xef]);
        log_validation_failed("IPSEC", "situation", "not supported", Some(3));
        log_validation_failed("ISAKMP", "proposal", "no proposal chosen", None);
        log_timer_failure(&cookies, "hard", "too many timers");
        log_lifetime_unbounded(&cookies, u64::MAX);
        log_table_resized(128, 10);
        log_sa_report("SA #0.0\nSA #1.0");
    }

    #[test]
    fn test_logging_with_subscriber() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            log_sa_created(&[0x01; 16], &[0; 4], 1, "ISAKMP");
            log_sa_report("line one\nline two");
        });
    }
}
