//! Why a cache lookup did not produce a usable result.
//!
//! Every failed probe gets exactly one `PipCacheMissType`, and each type
//! feeds exactly one counter.  The counters live in a `CacheMissCounters`
//! that the scheduler passes around explicitly, so concurrent builds (and
//! tests) don't share state.

use crate::pip::PipId;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
#[repr(u8)]
pub enum PipCacheMissType {
    /// Unset.  Recording it is a bug.
    #[default]
    Invalid = 0,
    MissForDescriptorsDueToStrongFingerprints,
    MissForDescriptorsDueToWeakFingerprints,
    MissForDescriptorsDueToAugmentedWeakFingerprints,
    MissForDescriptorsDueToArtificialMissOptions,
    MissForCacheEntry,
    MissDueToInvalidDescriptors,
    MissForProcessMetadata,
    MissForProcessMetadataFromHistoricMetadata,
    MissForProcessOutputContent,
    MissForProcessConfiguredUncacheable,
    Hit,
}

impl PipCacheMissType {
    /// Every tag that denotes an actual miss.
    pub const ALL_CACHE_MISSES: [PipCacheMissType; 10] = [
        PipCacheMissType::MissForDescriptorsDueToStrongFingerprints,
        PipCacheMissType::MissForDescriptorsDueToWeakFingerprints,
        PipCacheMissType::MissForDescriptorsDueToAugmentedWeakFingerprints,
        PipCacheMissType::MissForDescriptorsDueToArtificialMissOptions,
        PipCacheMissType::MissForCacheEntry,
        PipCacheMissType::MissDueToInvalidDescriptors,
        PipCacheMissType::MissForProcessMetadata,
        PipCacheMissType::MissForProcessMetadataFromHistoricMetadata,
        PipCacheMissType::MissForProcessOutputContent,
        PipCacheMissType::MissForProcessConfiguredUncacheable,
    ];

    pub fn is_miss(self) -> bool {
        !matches!(self, PipCacheMissType::Invalid | PipCacheMissType::Hit)
    }

    /// The counter this tag increments.  Panics on `Invalid`.
    pub fn to_counter(self) -> PipExecutorCounter {
        use PipCacheMissType::*;
        use PipExecutorCounter as C;
        match self {
            MissForDescriptorsDueToStrongFingerprints => {
                C::CacheMissesForDescriptorsDueToStrongFingerprints
            }
            MissForDescriptorsDueToWeakFingerprints => C::CacheMissesForDescriptorsDueToWeakFingerprints,
            MissForDescriptorsDueToAugmentedWeakFingerprints => {
                C::CacheMissesForDescriptorsDueToAugmentedWeakFingerprints
            }
            MissForDescriptorsDueToArtificialMissOptions => {
                C::CacheMissesForDescriptorsDueToArtificialMissOptions
            }
            MissForCacheEntry => C::CacheMissesForCacheEntry,
            MissDueToInvalidDescriptors => C::CacheMissesDueToInvalidDescriptors,
            MissForProcessMetadata => C::CacheMissesForProcessMetadata,
            MissForProcessMetadataFromHistoricMetadata => {
                C::CacheMissesForProcessMetadataFromHistoricMetadata
            }
            MissForProcessOutputContent => C::CacheMissesForProcessOutputContent,
            MissForProcessConfiguredUncacheable => C::CacheMissesForProcessConfiguredUncacheable,
            Hit => C::CacheHits,
            Invalid => panic!("cache miss type was never assigned"),
        }
    }
}

/// Build-summary counters fed by cache lookups.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(usize)]
pub enum PipExecutorCounter {
    CacheMissesForDescriptorsDueToStrongFingerprints,
    CacheMissesForDescriptorsDueToWeakFingerprints,
    CacheMissesForDescriptorsDueToAugmentedWeakFingerprints,
    CacheMissesForDescriptorsDueToArtificialMissOptions,
    CacheMissesForCacheEntry,
    CacheMissesDueToInvalidDescriptors,
    CacheMissesForProcessMetadata,
    CacheMissesForProcessMetadataFromHistoricMetadata,
    CacheMissesForProcessOutputContent,
    CacheMissesForProcessConfiguredUncacheable,
    CacheHits,
}

const COUNTER_COUNT: usize = PipExecutorCounter::CacheHits as usize + 1;

/// A set of monotonically increasing counters, one per `PipExecutorCounter`.
#[derive(Debug, Default)]
pub struct CacheMissCounters {
    counts: [AtomicU64; COUNTER_COUNT],
}

impl CacheMissCounters {
    pub fn new() -> Self {
        CacheMissCounters::default()
    }

    /// Records one probe outcome.  Panics on `Invalid`.
    pub fn record(&self, miss: PipCacheMissType) {
        self.counts[miss.to_counter() as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Classifies and records the lookup for `pip`, returning the miss, if
    /// any, for per-pip diagnostics.
    pub fn record_lookup(&self, pip: PipId, probe: &CacheProbe) -> Option<PipCacheMissInfo> {
        let miss_type = classify(probe);
        self.record(miss_type);
        if miss_type.is_miss() {
            Some(PipCacheMissInfo { pip, miss_type })
        } else {
            None
        }
    }

    pub fn get(&self, counter: PipExecutorCounter) -> u64 {
        self.counts[counter as usize].load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.get(PipExecutorCounter::CacheHits)
    }

    pub fn total_misses(&self) -> u64 {
        PipCacheMissType::ALL_CACHE_MISSES
            .iter()
            .map(|m| self.get(m.to_counter()))
            .sum()
    }

    /// Non-zero miss counters, for the build summary.
    pub fn nonzero_misses(&self) -> Vec<(PipCacheMissType, u64)> {
        PipCacheMissType::ALL_CACHE_MISSES
            .iter()
            .map(|&m| (m, self.get(m.to_counter())))
            .filter(|&(_, n)| n > 0)
            .collect()
    }
}

/// A miss attributed to a pip, kept for per-pip diagnostics.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PipCacheMissInfo {
    pub pip: PipId,
    pub miss_type: PipCacheMissType,
}

/// What a cache lookup found, step by step.  Fields are only meaningful if
/// the lookup got that far.
#[derive(Debug, Clone, Default)]
pub struct CacheProbe {
    pub configured_uncacheable: bool,
    pub artificial_miss: bool,
    pub weak_fingerprint_matched: bool,
    /// `None` when the pip has no augmented weak fingerprint.
    pub augmented_weak_fingerprint_matched: Option<bool>,
    pub strong_fingerprint_matched: bool,
    pub descriptor_valid: bool,
    pub cache_entry_retrieved: bool,
    /// `Some(true)` if metadata was found, `Some(false)` if not, `None` if
    /// metadata was served from historic metadata and that lookup decides.
    pub metadata_retrieved: Option<bool>,
    pub historic_metadata_retrieved: bool,
    pub output_content_available: bool,
}

/// Classifies a probe, checking each stage in the order the lookup performs
/// them: the first failing stage names the miss.
pub fn classify(probe: &CacheProbe) -> PipCacheMissType {
    use PipCacheMissType::*;
    if probe.configured_uncacheable {
        return MissForProcessConfiguredUncacheable;
    }
    if probe.artificial_miss {
        return MissForDescriptorsDueToArtificialMissOptions;
    }
    if !probe.weak_fingerprint_matched {
        return MissForDescriptorsDueToWeakFingerprints;
    }
    if probe.augmented_weak_fingerprint_matched == Some(false) {
        return MissForDescriptorsDueToAugmentedWeakFingerprints;
    }
    if !probe.strong_fingerprint_matched {
        return MissForDescriptorsDueToStrongFingerprints;
    }
    if !probe.descriptor_valid {
        return MissDueToInvalidDescriptors;
    }
    if !probe.cache_entry_retrieved {
        return MissForCacheEntry;
    }
    match probe.metadata_retrieved {
        None if !probe.historic_metadata_retrieved => {
            return MissForProcessMetadataFromHistoricMetadata
        }
        Some(false) => return MissForProcessMetadata,
        _ => {}
    }
    if !probe.output_content_available {
        return MissForProcessOutputContent;
    }
    Hit
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn counters_disjoint() {
        let counters: HashSet<PipExecutorCounter> = PipCacheMissType::ALL_CACHE_MISSES
            .iter()
            .map(|m| m.to_counter())
            .collect();
        assert_eq!(counters.len(), PipCacheMissType::ALL_CACHE_MISSES.len());
        assert!(!counters.contains(&PipExecutorCounter::CacheHits));
        assert_eq!(PipCacheMissType::Hit.to_counter(), PipExecutorCounter::CacheHits);
    }

    #[test]
    fn all_misses_excludes_sentinels() {
        for m in PipCacheMissType::ALL_CACHE_MISSES {
            assert!(m.is_miss());
        }
        assert!(!PipCacheMissType::ALL_CACHE_MISSES.contains(&PipCacheMissType::Invalid));
        assert!(!PipCacheMissType::ALL_CACHE_MISSES.contains(&PipCacheMissType::Hit));
        assert_eq!(PipCacheMissType::default(), PipCacheMissType::Invalid);
        assert_eq!(PipCacheMissType::Invalid as u8, 0);
    }

    #[test]
    #[should_panic(expected = "never assigned")]
    fn invalid_is_a_bug() {
        CacheMissCounters::new().record(PipCacheMissType::Invalid);
    }

    #[test]
    fn record_increments_one_counter() {
        let c = CacheMissCounters::new();
        c.record(PipCacheMissType::MissForCacheEntry);
        c.record(PipCacheMissType::MissForCacheEntry);
        c.record(PipCacheMissType::Hit);
        assert_eq!(c.get(PipExecutorCounter::CacheMissesForCacheEntry), 2);
        assert_eq!(c.hits(), 1);
        assert_eq!(c.total_misses(), 2);
        assert_eq!(
            c.nonzero_misses(),
            vec![(PipCacheMissType::MissForCacheEntry, 2)]
        );
    }

    #[test]
    fn record_lookup_attributes_misses() {
        let c = CacheMissCounters::new();
        let pip = PipId::from(3usize);
        assert_eq!(c.record_lookup(pip, &full_hit()), None);
        let stale = CacheProbe {
            output_content_available: false,
            ..full_hit()
        };
        assert_eq!(
            c.record_lookup(pip, &stale),
            Some(PipCacheMissInfo {
                pip,
                miss_type: PipCacheMissType::MissForProcessOutputContent
            })
        );
        assert_eq!(c.hits(), 1);
        assert_eq!(c.total_misses(), 1);
    }

    fn full_hit() -> CacheProbe {
        CacheProbe {
            weak_fingerprint_matched: true,
            strong_fingerprint_matched: true,
            descriptor_valid: true,
            cache_entry_retrieved: true,
            metadata_retrieved: Some(true),
            output_content_available: true,
            ..Default::default()
        }
    }

    #[test]
    fn classify_hit() {
        assert_eq!(classify(&full_hit()), PipCacheMissType::Hit);
    }

    #[test]
    fn classify_first_failing_stage() {
        use PipCacheMissType::*;
        let probe = CacheProbe {
            strong_fingerprint_matched: false,
            output_content_available: false,
            ..full_hit()
        };
        assert_eq!(classify(&probe), MissForDescriptorsDueToStrongFingerprints);

        let probe = CacheProbe {
            configured_uncacheable: true,
            artificial_miss: true,
            ..full_hit()
        };
        assert_eq!(classify(&probe), MissForProcessConfiguredUncacheable);

        let probe = CacheProbe {
            weak_fingerprint_matched: false,
            ..Default::default()
        };
        assert_eq!(classify(&probe), MissForDescriptorsDueToWeakFingerprints);

        let probe = CacheProbe {
            augmented_weak_fingerprint_matched: Some(false),
            ..full_hit()
        };
        assert_eq!(classify(&probe), MissForDescriptorsDueToAugmentedWeakFingerprints);

        let probe = CacheProbe {
            metadata_retrieved: None,
            historic_metadata_retrieved: false,
            ..full_hit()
        };
        assert_eq!(classify(&probe), MissForProcessMetadataFromHistoricMetadata);

        let probe = CacheProbe {
            metadata_retrieved: None,
            historic_metadata_retrieved: true,
            output_content_available: false,
            ..full_hit()
        };
        assert_eq!(classify(&probe), MissForProcessOutputContent);
    }
}
