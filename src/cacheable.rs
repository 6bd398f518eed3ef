//! The cache-relevant view of a pip.
//!
//! Cache lookup and storage only need a pip's declared inputs and outputs,
//! its weak fingerprint and two policy flags.  `CacheablePip` exposes exactly
//! that, so the lookup path treats every cacheable pip kind the same way.

use crate::cache_miss::CacheProbe;
use crate::fingerprint::{PipFingerprinter, WeakContentFingerprint};
use crate::pip::{DirectoryArtifact, FileArtifact, Ipc, Pip, PipKind, Process};
use anyhow::bail;
use rustc_hash::FxHashSet;

/// Deliberately bypasses the cache for a sample of pips, to exercise
/// cache-miss paths in testing.
#[derive(Debug, Clone, Default)]
pub struct ArtificialCacheMissOptions {
    /// Fraction of pips that miss, in [0, 1].
    pub rate: f64,
    pub seed: u64,
    /// Miss for the pips *not* sampled instead.
    pub inverted: bool,
    /// Pips that always miss regardless of rate.
    pub forced_misses: FxHashSet<u64>,
}

impl ArtificialCacheMissOptions {
    /// Parses `rate[~seed]`, e.g. "0.1" or "0.25~42".  A leading '~' inverts
    /// the sample.
    pub fn parse(spec: &str) -> anyhow::Result<Self> {
        let (inverted, spec) = match spec.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, spec),
        };
        let (rate, seed) = match spec.split_once('~') {
            Some((rate, seed)) => (rate, Some(seed)),
            None => (spec, None),
        };
        let rate: f64 = match rate.parse() {
            Ok(r) => r,
            Err(e) => bail!("invalid artificial miss rate {:?}: {}", rate, e),
        };
        if !(0.0..=1.0).contains(&rate) {
            bail!("artificial miss rate {} outside [0, 1]", rate);
        }
        let seed = match seed {
            None => 0,
            Some(s) => match s.parse() {
                Ok(s) => s,
                Err(e) => bail!("invalid artificial miss seed {:?}: {}", s, e),
            },
        };
        Ok(ArtificialCacheMissOptions {
            rate,
            seed,
            inverted,
            forced_misses: FxHashSet::default(),
        })
    }

    /// Deterministic per pip and seed, so reruns miss on the same pips.
    pub fn should_miss(&self, semi_stable_hash: u64) -> bool {
        if self.forced_misses.contains(&semi_stable_hash) {
            return true;
        }
        let mixed = mix64(self.seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ semi_stable_hash);
        // Top 53 bits as a uniform sample in [0, 1).
        let sample = (mixed >> 11) as f64 / (1u64 << 53) as f64;
        (sample < self.rate) != self.inverted
    }
}

/// splitmix64 finalizer.
fn mix64(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// The slice of the execution environment that cache lookup depends on.
pub trait ExecutionEnvironment: Sync {
    fn fingerprinter(&self) -> &dyn PipFingerprinter;

    /// Whether to force a miss for this pip, for fault-injection testing.
    fn should_have_artificial_miss(&self, pip: &Pip) -> bool;
}

/// Capability interface over the cacheable pip kinds.
pub trait CacheablePip {
    fn pip(&self) -> &Pip;
    fn dependencies(&self) -> &[FileArtifact];
    fn outputs(&self) -> &[FileArtifact];
    fn directory_dependencies(&self) -> &[DirectoryArtifact];
    fn directory_outputs(&self) -> &[DirectoryArtifact];
    fn compute_weak_fingerprint(&self) -> WeakContentFingerprint;
    fn should_have_artificial_miss(&self) -> bool;
    fn disable_cache_lookup(&self) -> bool;

    /// The pip must never reuse nor populate the cache.
    fn is_configured_uncacheable(&self) -> bool {
        false
    }

    fn semi_stable_hash(&self) -> u64 {
        self.pip().semi_stable_hash
    }
}

pub struct CacheableProcess<'a> {
    pip: &'a Pip,
    process: &'a Process,
    env: &'a dyn ExecutionEnvironment,
}

impl<'a> CacheableProcess<'a> {
    pub fn new(pip: &'a Pip, process: &'a Process, env: &'a dyn ExecutionEnvironment) -> Self {
        CacheableProcess { pip, process, env }
    }

    pub fn process(&self) -> &Process {
        self.process
    }
}

impl<'a> CacheablePip for CacheableProcess<'a> {
    fn pip(&self) -> &Pip {
        self.pip
    }

    fn dependencies(&self) -> &[FileArtifact] {
        &self.process.dependencies
    }

    fn outputs(&self) -> &[FileArtifact] {
        &self.process.outputs
    }

    fn directory_dependencies(&self) -> &[DirectoryArtifact] {
        &self.process.directory_dependencies
    }

    fn directory_outputs(&self) -> &[DirectoryArtifact] {
        &self.process.directory_outputs
    }

    fn compute_weak_fingerprint(&self) -> WeakContentFingerprint {
        self.env.fingerprinter().compute_weak_fingerprint(self.pip)
    }

    fn should_have_artificial_miss(&self) -> bool {
        self.env.should_have_artificial_miss(self.pip)
    }

    fn disable_cache_lookup(&self) -> bool {
        self.process.options.disable_cache_lookup
    }

    fn is_configured_uncacheable(&self) -> bool {
        self.process.options.uncacheable
    }
}

pub struct CacheableIpc<'a> {
    pip: &'a Pip,
    ipc: &'a Ipc,
    env: &'a dyn ExecutionEnvironment,
}

impl<'a> CacheablePip for CacheableIpc<'a> {
    fn pip(&self) -> &Pip {
        self.pip
    }

    fn dependencies(&self) -> &[FileArtifact] {
        &self.ipc.dependencies
    }

    fn outputs(&self) -> &[FileArtifact] {
        std::slice::from_ref(&self.ipc.output)
    }

    fn directory_dependencies(&self) -> &[DirectoryArtifact] {
        &[]
    }

    fn directory_outputs(&self) -> &[DirectoryArtifact] {
        &[]
    }

    fn compute_weak_fingerprint(&self) -> WeakContentFingerprint {
        self.env.fingerprinter().compute_weak_fingerprint(self.pip)
    }

    fn should_have_artificial_miss(&self) -> bool {
        self.env.should_have_artificial_miss(self.pip)
    }

    fn disable_cache_lookup(&self) -> bool {
        self.ipc.disable_cache_lookup
    }
}

/// The cacheable view of `pip`, or `None` for kinds that are never looked
/// up in the cache (copies, writes and service lifecycle pips are cheap or
/// side-effecting and always run).
pub fn cacheable_pip<'a>(
    pip: &'a Pip,
    env: &'a dyn ExecutionEnvironment,
) -> Option<Box<dyn CacheablePip + 'a>> {
    match &pip.kind {
        PipKind::Process(process) => Some(Box::new(CacheableProcess::new(pip, process, env))),
        PipKind::Ipc(ipc) => Some(Box::new(CacheableIpc { pip, ipc, env })),
        PipKind::CopyFile(_) | PipKind::WriteFile(_) | PipKind::Service(_) => None,
    }
}

/// The policy stages of a cache probe for `pip`.  Lookup stages start out
/// failed; the caller fills them in as the lookup progresses.  A pip with
/// cache lookup disabled counts as an artificial miss.
pub fn policy_probe(pip: &dyn CacheablePip) -> CacheProbe {
    CacheProbe {
        configured_uncacheable: pip.is_configured_uncacheable(),
        artificial_miss: pip.should_have_artificial_miss() || pip.disable_cache_lookup(),
        ..Default::default()
    }
}

/// An `ExecutionEnvironment` made of a fingerprinter plus artificial miss
/// options.
pub struct SimpleEnvironment<F> {
    pub fingerprinter: F,
    pub artificial_misses: ArtificialCacheMissOptions,
}

impl<F: PipFingerprinter> ExecutionEnvironment for SimpleEnvironment<F> {
    fn fingerprinter(&self) -> &dyn PipFingerprinter {
        &self.fingerprinter
    }

    fn should_have_artificial_miss(&self, pip: &Pip) -> bool {
        self.artificial_misses.should_miss(pip.semi_stable_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::StaticShapeFingerprinter;
    use crate::pip::testing::*;
    use crate::cache_miss::{classify, PipCacheMissType};
    use crate::paths::PathTable;
    use crate::pip::{CopyFile, PipGraphBuilder};

    fn env<'a>(paths: &'a PathTable, rate: &str) -> SimpleEnvironment<StaticShapeFingerprinter<'a>> {
        SimpleEnvironment {
            fingerprinter: StaticShapeFingerprinter::new(paths),
            artificial_misses: ArtificialCacheMissOptions::parse(rate).unwrap(),
        }
    }

    fn ipc(b: &mut PipGraphBuilder, disable_cache_lookup: bool) -> Pip {
        Pip::new(
            5,
            "publish",
            PipKind::Ipc(Ipc {
                moniker: "drop".into(),
                message: "add /out/pkg".into(),
                dependencies: vec![FileArtifact::output(b.path("/out/pkg"))],
                output: FileArtifact::output(b.path("/out/publish.log")),
                disable_cache_lookup,
                preferred_worker: None,
            }),
        )
    }

    #[test]
    fn parse_options() {
        let o = ArtificialCacheMissOptions::parse("0.25~42").unwrap();
        assert_eq!(o.rate, 0.25);
        assert_eq!(o.seed, 42);
        assert!(!o.inverted);
        let o = ArtificialCacheMissOptions::parse("~1").unwrap();
        assert!(o.inverted);
        assert_eq!(o.rate, 1.0);
        assert!(ArtificialCacheMissOptions::parse("1.5").is_err());
        assert!(ArtificialCacheMissOptions::parse("x").is_err());
        assert!(ArtificialCacheMissOptions::parse("0.1~x").is_err());
    }

    #[test]
    fn miss_rate_extremes() {
        let all = ArtificialCacheMissOptions::parse("1").unwrap();
        let none = ArtificialCacheMissOptions::parse("0").unwrap();
        let inverted_none = ArtificialCacheMissOptions::parse("~0").unwrap();
        for hash in 0..100u64 {
            assert!(all.should_miss(hash));
            assert!(!none.should_miss(hash));
            assert!(inverted_none.should_miss(hash));
        }
    }

    #[test]
    fn miss_rate_is_deterministic_and_roughly_right() {
        let o = ArtificialCacheMissOptions::parse("0.5~7").unwrap();
        let misses = (0..2000u64).filter(|&h| o.should_miss(h)).count();
        assert!(misses > 800 && misses < 1200, "{}", misses);
        for h in 0..50u64 {
            assert_eq!(o.should_miss(h), o.should_miss(h));
        }
        let mut forced = ArtificialCacheMissOptions::default();
        forced.forced_misses.insert(9);
        assert!(forced.should_miss(9));
        assert!(!forced.should_miss(10));
    }

    #[test]
    fn process_view() {
        let mut b = PipGraphBuilder::new();
        let mut p = process(&mut b, 3, &["/src/a"], &["/out/b"]);
        p.options.disable_cache_lookup = true;
        let pip = Pip::new(3, "p", PipKind::Process(p));
        let env = SimpleEnvironment {
            fingerprinter: StaticShapeFingerprinter::new(&b.paths),
            artificial_misses: ArtificialCacheMissOptions::parse("1").unwrap(),
        };
        let view = cacheable_pip(&pip, &env).unwrap();
        assert_eq!(view.outputs(), pip.file_outputs());
        assert_eq!(view.dependencies(), pip.file_dependencies());
        assert!(view.disable_cache_lookup());
        assert!(view.should_have_artificial_miss());
        assert!(!view.is_configured_uncacheable());
        assert_eq!(view.semi_stable_hash(), 3);
        assert_eq!(
            view.compute_weak_fingerprint(),
            env.fingerprinter.compute_weak_fingerprint(&pip)
        );
    }

    #[test]
    fn ipc_view() {
        let mut b = PipGraphBuilder::new();
        let pip = ipc(&mut b, false);
        let no_lookup = ipc(&mut b, true);
        let env = env(&b.paths, "0");
        let view = cacheable_pip(&pip, &env).unwrap();
        assert_eq!(view.outputs(), pip.file_outputs());
        assert_eq!(view.outputs().len(), 1);
        assert_eq!(view.dependencies(), pip.file_dependencies());
        assert!(view.directory_dependencies().is_empty());
        assert!(view.directory_outputs().is_empty());
        assert!(!view.disable_cache_lookup());
        assert!(!view.should_have_artificial_miss());
        assert!(!view.is_configured_uncacheable());
        assert_eq!(view.semi_stable_hash(), 5);
        assert_eq!(
            view.compute_weak_fingerprint(),
            env.fingerprinter.compute_weak_fingerprint(&pip)
        );

        let view = cacheable_pip(&no_lookup, &env).unwrap();
        assert!(view.disable_cache_lookup());
    }

    #[test]
    fn policy_drives_classification() {
        let mut b = PipGraphBuilder::new();
        let mut p = process(&mut b, 3, &["/src/a"], &["/out/b"]);
        p.options.uncacheable = true;
        let uncacheable = Pip::new(3, "p", PipKind::Process(p));
        let plain = Pip::new(4, "q", PipKind::Process(process(&mut b, 4, &[], &["/out/c"])));
        let no_lookup = ipc(&mut b, true);

        let quiet = env(&b.paths, "0");
        let probe = policy_probe(&*cacheable_pip(&uncacheable, &quiet).unwrap());
        assert_eq!(
            classify(&probe),
            PipCacheMissType::MissForProcessConfiguredUncacheable
        );
        let probe = policy_probe(&*cacheable_pip(&no_lookup, &quiet).unwrap());
        assert_eq!(
            classify(&probe),
            PipCacheMissType::MissForDescriptorsDueToArtificialMissOptions
        );
        let probe = policy_probe(&*cacheable_pip(&plain, &quiet).unwrap());
        assert!(!probe.configured_uncacheable && !probe.artificial_miss);
        assert_eq!(
            classify(&probe),
            PipCacheMissType::MissForDescriptorsDueToWeakFingerprints
        );

        let all = env(&b.paths, "1");
        let probe = policy_probe(&*cacheable_pip(&plain, &all).unwrap());
        assert_eq!(
            classify(&probe),
            PipCacheMissType::MissForDescriptorsDueToArtificialMissOptions
        );
    }

    #[test]
    fn copy_is_not_cacheable() {
        let mut b = PipGraphBuilder::new();
        let pip = Pip::new(
            1,
            "copy",
            PipKind::CopyFile(CopyFile {
                source: FileArtifact::source(b.path("/a")),
                destination: FileArtifact::output(b.path("/b")),
            }),
        );
        let env = SimpleEnvironment {
            fingerprinter: StaticShapeFingerprinter::new(&b.paths),
            artificial_misses: ArtificialCacheMissOptions::default(),
        };
        assert!(cacheable_pip(&pip, &env).is_none());
    }
}
