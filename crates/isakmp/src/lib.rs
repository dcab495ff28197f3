//! ISAKMP security association core for the Fynx security ecosystem.
//!
//! This crate tracks every in-progress and established ISAKMP/IKE
//! negotiation of a key management daemon:
//!
//! - **SA table** - cookie-indexed hash table over reference-counted SAs
//! - **DOI dispatch** - pluggable Domains of Interpretation (ISAKMP, IPsec)
//! - **Lifetimes** - soft/hard expiry with rekey scheduling
//!
//! Wire encoding, cryptography and policy evaluation live elsewhere; they
//! reach the core through [`payload`] records, [`credentials`] and the
//! [`ExchangeHooks`] trait.
//!
//! # Architecture
//!
//! ```text
//! inbound message (cookies, message ID)
//!        ↓
//!   SaManager ── lookup / create ──► SaTable ──► SecurityAssociation
//!        │                                          │
//!        ├── Doi (validate, SPIs, proto data) ◄─────┘
//!        │
//!        └── TimerQueue ── soft: rekey / fading
//!                       └─ hard: delete (+ DELETE notify in phase 2)
//! ```
//!
//! # Features
//!
//! - `runtime` (default) - tokio task firing expirations ([`driver`])
//! - `serde` - serialization of configuration and metrics snapshots
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use fynx_isakmp::{Cookies, Exchange, MessageId, SaConfig, SaManager};
//! use fynx_isakmp::payload::exchange;
//!
//! let mut manager = SaManager::new(SaConfig::default()).unwrap();
//! let doi = manager.doi(fynx_isakmp::doi::IPSEC_DOI).unwrap();
//!
//! let cookies = Cookies::new([1; 16]);
//! let ex = Exchange::new(doi, exchange::ID_PROT, cookies, MessageId::ZERO, true);
//! let sa = manager.create(&ex, None).unwrap();
//!
//! assert_eq!(manager.lookup(&cookies, None), Some(sa));
//! manager.delete(sa, false).unwrap();
//! assert!(manager.lookup(&cookies, None).is_none());
//! ```
//!
//! # References
//!
//! - [RFC 2408](https://datatracker.ietf.org/doc/html/rfc2408) - ISAKMP
//! - [RFC 2407](https://datatracker.ietf.org/doc/html/rfc2407) - The Internet IP Security DOI for ISAKMP
//! - [RFC 2409](https://datatracker.ietf.org/doc/html/rfc2409) - IKE

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod cookie;
pub mod credentials;
pub mod doi;
#[cfg(feature = "runtime")]
pub mod driver;
pub mod error;
pub mod exchange;
pub mod expiry;
pub mod hooks;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod payload;
pub mod sa;
pub mod timer;
pub mod transport;

pub use config::{SaConfig, SaConfigBuilder};
pub use cookie::{Cookies, MessageId};
pub use doi::{Doi, DoiRegistry};
#[cfg(feature = "runtime")]
pub use driver::ExpiryTask;
pub use error::{Error, Result};
pub use exchange::{Exchange, Selection};
pub use expiry::{ExpiryEvent, ExpiryKind};
pub use hooks::{ExchangeHooks, NullHooks};
pub use manager::SaManager;
pub use metrics::{MetricsSnapshot, SaMetrics};
pub use sa::{Phase, Proto, ResizePolicy, SaFlags, SaHandle, SaState, SecurityAssociation};
pub use timer::{Clock, ManualClock, SystemClock};
