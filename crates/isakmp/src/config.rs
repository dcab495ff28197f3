//! SA manager configuration
//!
//! Provides [`SaConfig`] and its builder.

use crate::sa::ResizePolicy;
use crate::{Error, Result};

/// Default table size, as a power of two
pub const DEFAULT_BUCKET_BITS: u8 = 6;

/// Largest table size; the cookie fold hash is 16 bits wide
pub const MAX_BUCKET_BITS: u8 = 16;

/// Default lower bound of the soft expiry fraction
pub const DEFAULT_SOFT_EXPIRY_MIN: f64 = 0.85;

/// Default upper bound (exclusive) of the soft expiry fraction
pub const DEFAULT_SOFT_EXPIRY_MAX: f64 = 0.95;

/// Default limit of pending expiry timers
pub const DEFAULT_MAX_TIMERS: usize = 65536;

/// SA manager configuration
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SaConfig {
    /// Initial table size is `1 << bucket_bits`
    pub bucket_bits: u8,

    /// Table stops growing at `1 << max_bucket_bits`
    pub max_bucket_bits: u8,

    /// What happens to existing entries when the table grows
    pub resize_policy: ResizePolicy,

    /// Soft expiry happens at a uniform random fraction of the lifetime
    /// in `[soft_expiry_min, soft_expiry_max)`
    pub soft_expiry_min: f64,

    /// See `soft_expiry_min`
    pub soft_expiry_max: f64,

    /// Pending timer limit; registrations past it fail
    pub max_timers: usize,

    /// Seed for the expiry jitter RNG, random when unset
    pub rng_seed: Option<u64>,
}

impl Default for SaConfig {
    fn default() -> Self {
        SaConfig {
            bucket_bits: DEFAULT_BUCKET_BITS,
            max_bucket_bits: MAX_BUCKET_BITS,
            resize_policy: ResizePolicy::default(),
            soft_expiry_min: DEFAULT_SOFT_EXPIRY_MIN,
            soft_expiry_max: DEFAULT_SOFT_EXPIRY_MAX,
            max_timers: DEFAULT_MAX_TIMERS,
            rng_seed: None,
        }
    }
}

impl SaConfig {
    /// Create builder
    pub fn builder() -> SaConfigBuilder {
        SaConfigBuilder::new()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.bucket_bits == 0 {
            return Err(Error::Config("bucket_bits must be at least 1".into()));
        }
        if self.max_bucket_bits > MAX_BUCKET_BITS {
            return Err(Error::Config(format!(
                "max_bucket_bits cannot exceed {}",
                MAX_BUCKET_BITS
            )));
        }
        if self.bucket_bits > self.max_bucket_bits {
            return Err(Error::Config(
                "bucket_bits cannot exceed max_bucket_bits".into(),
            ));
        }
        if !(self.soft_expiry_min > 0.0
            && self.soft_expiry_min < self.soft_expiry_max
            && self.soft_expiry_max <= 1.0)
        {
            return Err(Error::Config(format!(
                "soft expiry window [{}, {}) must lie within (0, 1]",
                self.soft_expiry_min, self.soft_expiry_max
            )));
        }
        if self.max_timers == 0 {
            return Err(Error::Config("max_timers must be positive".into()));
        }
        Ok(())
    }
}

/// Builder for [`SaConfig`]
#[derive(Default)]
pub struct SaConfigBuilder {
    bucket_bits: Option<u8>,
    max_bucket_bits: Option<u8>,
    resize_policy: Option<ResizePolicy>,
    soft_expiry: Option<(f64, f64)>,
    max_timers: Option<usize>,
    rng_seed: Option<u64>,
}

impl SaConfigBuilder {
    /// Create new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set initial table size as a power of two
    pub fn with_bucket_bits(mut self, bits: u8) -> Self {
        self.bucket_bits = Some(bits);
        self
    }

    /// Set maximum table size as a power of two
    pub fn with_max_bucket_bits(mut self, bits: u8) -> Self {
        self.max_bucket_bits = Some(bits);
        self
    }

    /// Set resize policy
    pub fn with_resize_policy(mut self, policy: ResizePolicy) -> Self {
        self.resize_policy = Some(policy);
        self
    }

    /// Set soft expiry window
    pub fn with_soft_expiry(mut self, min: f64, max: f64) -> Self {
        self.soft_expiry = Some((min, max));
        self
    }

    /// Set pending timer limit
    pub fn with_max_timers(mut self, max: usize) -> Self {
        self.max_timers = Some(max);
        self
    }

    /// Seed the expiry jitter RNG
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Build SaConfig with validation
    pub fn build(self) -> Result<SaConfig> {
        let defaults = SaConfig::default();
        let (soft_expiry_min, soft_expiry_max) = self
            .soft_expiry
            .unwrap_or((defaults.soft_expiry_min, defaults.soft_expiry_max));
        let config = SaConfig {
            bucket_bits: self.bucket_bits.unwrap_or(defaults.bucket_bits),
            max_bucket_bits: self.max_bucket_bits.unwrap_or(defaults.max_bucket_bits),
            resize_policy: self.resize_policy.unwrap_or(defaults.resize_policy),
            soft_expiry_min,
            soft_expiry_max,
            max_timers: self.max_timers.unwrap_or(defaults.max_timers),
            rng_seed: self.rng_seed,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bucket_bits, 6);
        assert_eq!(config.resize_policy, ResizePolicy::KeepBuckets);
    }

    #[test]
    fn test_builder() {
        let config = SaConfig::builder()
            .with_bucket_bits(4)
            .with_max_bucket_bits(8)
            .with_resize_policy(ResizePolicy::Rehash)
            .with_max_timers(10)
            .with_rng_seed(7)
            .build()
            .unwrap();
        assert_eq!(config.bucket_bits, 4);
        assert_eq!(config.max_bucket_bits, 8);
        assert_eq!(config.resize_policy, ResizePolicy::Rehash);
        assert_eq!(config.max_timers, 10);
        assert_eq!(config.rng_seed, Some(7));
    }

    #[test]
    fn test_builder_rejects_bad_bits() {
        assert!(SaConfig::builder().with_bucket_bits(0).build().is_err());
        assert!(SaConfig::builder().with_max_bucket_bits(17).build().is_err());
        assert!(SaConfig::builder()
            .with_bucket_bits(9)
            .with_max_bucket_bits(8)
            .build()
            .is_err());
    }

    #[test]
    fn test_builder_rejects_bad_soft_window() {
        assert!(SaConfig::builder().with_soft_expiry(0.9, 0.8).build().is_err());
        assert!(SaConfig::builder().with_soft_expiry(0.0, 0.5).build().is_err());
        assert!(SaConfig::builder().with_soft_expiry(0.5, 1.5).build().is_err());
        assert!(SaConfig::builder().with_max_timers(0).build().is_err());
    }
}
