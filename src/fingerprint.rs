//! Fingerprints identify a pip's execution for cache lookup.
//!
//! The weak fingerprint covers what is statically declared about a pip; the
//! strong fingerprint additionally covers the content of the inputs the pip
//! was actually observed to read.  Computing production-grade content hashes
//! belongs to the fingerprinter collaborator, so this module defines the
//! interface plus a simple shape hasher suitable for tests and simulation.

use crate::paths::{PathId, PathTable};
use crate::pip::{DirectoryArtifact, FileArtifact, Pip, PipKind};
use std::hash::{Hash, Hasher};

pub const FINGERPRINT_LENGTH: usize = 16;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct Fingerprint(pub [u8; FINGERPRINT_LENGTH]);

impl Fingerprint {
    pub const ZERO: Fingerprint = Fingerprint([0; FINGERPRINT_LENGTH]);

    fn from_halves(hi: u64, lo: u64) -> Self {
        let mut bytes = [0u8; FINGERPRINT_LENGTH];
        bytes[..8].copy_from_slice(&hi.to_be_bytes());
        bytes[8..].copy_from_slice(&lo.to_be_bytes());
        Fingerprint(bytes)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct WeakContentFingerprint(pub Fingerprint);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct StrongContentFingerprint(pub Fingerprint);

/// Hash of a file's content.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ContentHash(pub u64);

impl ContentHash {
    /// Marker for a path that was probed but does not exist.
    pub const ABSENT_FILE: ContentHash = ContentHash(0);

    pub fn of(bytes: &[u8]) -> Self {
        let mut h = std::collections::hash_map::DefaultHasher::new();
        bytes.hash(&mut h);
        // Never collide with the absent marker.
        ContentHash(h.finish() | 1)
    }
}

/// Computes the weak fingerprint of a pip.  Implementations must be pure
/// functions of the pip's declared shape.
pub trait PipFingerprinter: Sync {
    fn compute_weak_fingerprint(&self, pip: &Pip) -> WeakContentFingerprint;
}

/// Sink for the parts of a pip that contribute to its weak fingerprint.
/// Indirected as a trait so a second implementation can record the parts
/// instead of hashing them, for explaining fingerprint differences.
pub trait FingerprintHasher {
    fn write_str(&mut self, name: &str, value: &str);
    fn write_u64(&mut self, name: &str, value: u64);
    fn write_files(&mut self, name: &str, paths: &PathTable, files: &[FileArtifact]);
    fn write_directories(&mut self, name: &str, paths: &PathTable, dirs: &[DirectoryArtifact]);
}

const UNIT_SEPARATOR: u8 = 0x1F;

/// Two independently salted hashers, so the result fills a whole
/// `Fingerprint`.
struct TerseHash {
    hi: std::collections::hash_map::DefaultHasher,
    lo: std::collections::hash_map::DefaultHasher,
}

impl Default for TerseHash {
    fn default() -> Self {
        let mut hash = TerseHash {
            hi: Default::default(),
            lo: Default::default(),
        };
        hash.hi.write_u8(b'H');
        hash.lo.write_u8(b'L');
        hash
    }
}

impl TerseHash {
    fn write(&mut self, bytes: &[u8]) {
        self.hi.write(bytes);
        self.lo.write(bytes);
    }

    fn write_separator(&mut self) {
        self.write(&[UNIT_SEPARATOR]);
    }

    fn finish(&self) -> Fingerprint {
        Fingerprint::from_halves(self.hi.finish(), self.lo.finish())
    }
}

impl FingerprintHasher for TerseHash {
    fn write_str(&mut self, name: &str, value: &str) {
        self.write(name.as_bytes());
        self.write_separator();
        self.write(value.as_bytes());
        self.write_separator();
    }

    fn write_u64(&mut self, name: &str, value: u64) {
        self.write(name.as_bytes());
        self.write(&value.to_le_bytes());
        self.write_separator();
    }

    fn write_files(&mut self, name: &str, paths: &PathTable, files: &[FileArtifact]) {
        self.write(name.as_bytes());
        // Declaration order must not matter.
        let mut sorted: Vec<(String, u32)> = files
            .iter()
            .map(|f| (paths.expand(f.path), f.rewrite_count))
            .collect();
        sorted.sort();
        for (path, rewrite) in sorted {
            self.write(path.as_bytes());
            self.write(&rewrite.to_le_bytes());
        }
        self.write_separator();
    }

    fn write_directories(&mut self, name: &str, paths: &PathTable, dirs: &[DirectoryArtifact]) {
        self.write(name.as_bytes());
        let mut sorted: Vec<(String, u8)> = dirs
            .iter()
            .map(|d| (paths.expand(d.path), d.kind as u8))
            .collect();
        sorted.sort();
        for (path, kind) in sorted {
            self.write(path.as_bytes());
            self.write(&[kind]);
        }
        self.write_separator();
    }
}

fn hash_pip_with_hasher<H: FingerprintHasher>(hasher: &mut H, paths: &PathTable, pip: &Pip) {
    match &pip.kind {
        PipKind::Process(p) => hash_process(hasher, paths, p),
        PipKind::Service(s) => {
            hasher.write_u64("Shutdown", s.is_shutdown as u64);
            hash_process(hasher, paths, &s.process);
        }
        PipKind::CopyFile(c) => {
            hasher.write_files("Source", paths, std::slice::from_ref(&c.source));
            hasher.write_files("Destination", paths, std::slice::from_ref(&c.destination));
        }
        PipKind::WriteFile(w) => {
            hasher.write_files("Destination", paths, std::slice::from_ref(&w.destination));
            hasher.write_str("Contents", &w.contents);
        }
        PipKind::Ipc(ipc) => {
            hasher.write_str("Moniker", &ipc.moniker);
            hasher.write_str("Message", &ipc.message);
            hasher.write_files("Dependencies", paths, &ipc.dependencies);
            hasher.write_files("Output", paths, std::slice::from_ref(&ipc.output));
        }
    }
}

fn hash_process<H: FingerprintHasher>(hasher: &mut H, paths: &PathTable, p: &crate::pip::Process) {
    hasher.write_files("Executable", paths, std::slice::from_ref(&p.executable));
    hasher.write_str("WorkingDirectory", &paths.expand(p.working_directory));
    for arg in &p.arguments {
        hasher.write_str("Argument", arg);
    }
    let mut env: Vec<&(String, String)> = p.environment.iter().collect();
    env.sort();
    for (k, v) in env {
        hasher.write_str(k, v);
    }
    hasher.write_files("Dependencies", paths, &p.dependencies);
    hasher.write_files("Outputs", paths, &p.outputs);
    hasher.write_directories("DirectoryDependencies", paths, &p.directory_dependencies);
    hasher.write_directories("DirectoryOutputs", paths, &p.directory_outputs);
}

/// Hashes a pip's declared shape: command line, environment and declared
/// inputs/outputs, but never file content.
pub struct StaticShapeFingerprinter<'a> {
    paths: &'a PathTable,
}

impl<'a> StaticShapeFingerprinter<'a> {
    pub fn new(paths: &'a PathTable) -> Self {
        StaticShapeFingerprinter { paths }
    }
}

impl<'a> PipFingerprinter for StaticShapeFingerprinter<'a> {
    fn compute_weak_fingerprint(&self, pip: &Pip) -> WeakContentFingerprint {
        let mut hasher = TerseHash::default();
        hash_pip_with_hasher(&mut hasher, self.paths, pip);
        WeakContentFingerprint(hasher.finish())
    }
}

/// Records fingerprint inputs as readable lines, for diagnosing why two
/// weak fingerprints differ.
#[derive(Default)]
pub struct ExplainHash {
    pub lines: Vec<String>,
}

impl FingerprintHasher for ExplainHash {
    fn write_str(&mut self, name: &str, value: &str) {
        self.lines.push(format!("{}: {}", name, value));
    }

    fn write_u64(&mut self, name: &str, value: u64) {
        self.lines.push(format!("{}: {:#x}", name, value));
    }

    fn write_files(&mut self, name: &str, paths: &PathTable, files: &[FileArtifact]) {
        for f in files {
            self.lines
                .push(format!("{}: {} @{}", name, paths.expand(f.path), f.rewrite_count));
        }
    }

    fn write_directories(&mut self, name: &str, paths: &PathTable, dirs: &[DirectoryArtifact]) {
        for d in dirs {
            self.lines
                .push(format!("{}: {} ({:?})", name, paths.expand(d.path), d.kind));
        }
    }
}

pub fn explain_weak_fingerprint(paths: &PathTable, pip: &Pip) -> Vec<String> {
    let mut explain = ExplainHash::default();
    hash_pip_with_hasher(&mut explain, paths, pip);
    explain.lines
}

/// Refines a weak fingerprint with the content of the inputs that were
/// actually observed.  Input order does not matter.
pub fn compute_strong_fingerprint(
    weak: WeakContentFingerprint,
    paths: &PathTable,
    observed_inputs: &[(PathId, ContentHash)],
) -> StrongContentFingerprint {
    let mut hasher = TerseHash::default();
    hasher.write(&weak.0 .0);
    hasher.write_separator();
    let mut sorted: Vec<(String, ContentHash)> = observed_inputs
        .iter()
        .map(|&(p, h)| (paths.expand(p), h))
        .collect();
    sorted.sort();
    for (path, hash) in sorted {
        hasher.write(path.as_bytes());
        hasher.write(&hash.0.to_le_bytes());
        hasher.write_separator();
    }
    StrongContentFingerprint(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pip::testing::*;
    use crate::pip::PipGraphBuilder;

    fn pip_with(b: &mut PipGraphBuilder, args: &[&str], ins: &[&str]) -> Pip {
        let mut p = process(b, 7, ins, &["/out/o"]);
        p.arguments = args.iter().map(|s| s.to_string()).collect();
        Pip::new(7, "p", PipKind::Process(p))
    }

    #[test]
    fn weak_depends_on_shape() {
        let mut b = PipGraphBuilder::new();
        let a = pip_with(&mut b, &["-c"], &["/src/a", "/src/b"]);
        let same = pip_with(&mut b, &["-c"], &["/src/b", "/src/a"]);
        let other_args = pip_with(&mut b, &["-O2"], &["/src/a", "/src/b"]);
        let other_ins = pip_with(&mut b, &["-c"], &["/src/a"]);
        let fp = StaticShapeFingerprinter::new(&b.paths);
        let wa = fp.compute_weak_fingerprint(&a);
        assert_eq!(wa, fp.compute_weak_fingerprint(&same));
        assert_ne!(wa, fp.compute_weak_fingerprint(&other_args));
        assert_ne!(wa, fp.compute_weak_fingerprint(&other_ins));
    }

    #[test]
    fn weak_ignores_pip_identity() {
        let mut b = PipGraphBuilder::new();
        let a = pip_with(&mut b, &["-c"], &["/src/a"]);
        let mut twin = pip_with(&mut b, &["-c"], &["/src/a"]);
        twin.semi_stable_hash = 8;
        twin.description = "twin".into();
        let fp = StaticShapeFingerprinter::new(&b.paths);
        assert_eq!(
            fp.compute_weak_fingerprint(&a),
            fp.compute_weak_fingerprint(&twin)
        );
    }

    #[test]
    fn strong_refines_weak() {
        let mut b = PipGraphBuilder::new();
        let a = b.path("/src/a");
        let c = b.path("/src/c");
        let weak = WeakContentFingerprint(Fingerprint([3; FINGERPRINT_LENGTH]));
        let s1 = compute_strong_fingerprint(
            weak,
            &b.paths,
            &[(a, ContentHash::of(b"x")), (c, ContentHash::of(b"y"))],
        );
        let s2 = compute_strong_fingerprint(
            weak,
            &b.paths,
            &[(c, ContentHash::of(b"y")), (a, ContentHash::of(b"x"))],
        );
        let s3 = compute_strong_fingerprint(
            weak,
            &b.paths,
            &[(a, ContentHash::of(b"changed")), (c, ContentHash::of(b"y"))],
        );
        assert_eq!(s1, s2);
        assert_ne!(s1, s3);
    }

    #[test]
    fn explain_lists_inputs() {
        let mut b = PipGraphBuilder::new();
        let a = pip_with(&mut b, &["-c"], &["/src/a"]);
        let lines = explain_weak_fingerprint(&b.paths, &a);
        assert!(lines.contains(&"Argument: -c".to_string()), "{:?}", lines);
        assert!(lines.contains(&"Dependencies: /src/a @0".to_string()));
    }

    #[test]
    fn display_hex() {
        let fp = Fingerprint::from_halves(0x0102030405060708, 0xff);
        assert_eq!(fp.to_string(), "010203040506070800000000000000ff");
        assert_ne!(ContentHash::of(b""), ContentHash::ABSENT_FILE);
    }
}
