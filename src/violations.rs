//! Decides whether a pip's observed file accesses make its outputs unsafe
//! to cache.
//!
//! The analyzer is shared by every pip of a build.  It remembers who wrote
//! which path so that two pips writing the same file are caught no matter
//! which of them finishes first.  Each pip is analyzed exactly once, after
//! execution (or after replay from the cache) and before its outputs are
//! committed to the cache.
//!
//! When several classifications apply to one path, the first match wins:
//!
//! 1. writes: double write with differing content, then undeclared output,
//!    then same-content double write;
//! 2. reads of a path the pip itself wrote are not violations;
//! 3. reads of another pip's output: undeclared ordered read if that pip is
//!    a transitive dependency, read race otherwise;
//! 4. reads of anything else undeclared: undeclared read;
//! 5. absent path probes under another pip's output directory.

use crate::file_access::{
    AllowlistedAccess, DynamicOutputs, FileMaterializationInfo, OutputContent,
    ReportedFileAccess,
};
use crate::fingerprint::ContentHash;
use crate::graph::DirectedGraph;
use crate::paths::PathId;
use crate::pip::{DoubleWritePolicy, FileArtifact, Pip, PipGraph, PipId, Process};
use crate::traversal::{NodeVisitor, VisitationTracker};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use rustc_hash::{FxHashMap, FxHashSet};
use std::cell::OnceCell;
use tracing::{debug, error, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ViolationType {
    /// Read of a path that is neither declared nor produced by any pip.
    UndeclaredRead,
    /// Read of an upstream pip's output that was not declared as input.
    UndeclaredOrderedRead,
    /// Read of an output of a pip that is not ordered before the reader.
    ReadRace,
    /// Write outside every declared output and output directory.
    UndeclaredOutput,
    /// Two pips wrote the same path.
    DoubleWrite,
    /// Probe of an absent path inside an unordered pip's output directory.
    AbsentPathProbeUnderOutputDir,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ReportedViolation {
    pub kind: ViolationType,
    pub path: PathId,
    pub violator: PipId,
    /// The other pip involved, for double writes and races.
    pub related: Option<PipId>,
    /// Build-breaking, as opposed to logged only.
    pub is_error: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AnalyzePipViolationsResult {
    pub is_violation_clean: bool,
    pub pip_is_safe_to_cache: bool,
}

impl AnalyzePipViolationsResult {
    pub const NO_VIOLATIONS: AnalyzePipViolationsResult = AnalyzePipViolationsResult {
        is_violation_clean: true,
        pip_is_safe_to_cache: true,
    };

    fn add_error(&mut self) {
        self.is_violation_clean = false;
    }

    fn mark_unsafe(&mut self) {
        self.pip_is_safe_to_cache = false;
    }
}

/// Same-content double writes that were let through, keyed by the file this
/// pip wrote.  Cache convergence re-checks them.
pub type AllowedSameContentDoubleWrites =
    FxHashMap<FileArtifact, (FileMaterializationInfo, ReportedViolation)>;

#[derive(Debug)]
pub struct PipViolationAnalysis {
    pub result: AnalyzePipViolationsResult,
    /// Every violation found, errors and non-errors alike.
    pub violations: Vec<ReportedViolation>,
    pub allowed_same_content_double_writes: AllowedSameContentDoubleWrites,
}

/// Everything observed about one pip run.
#[derive(Debug, Default, Clone, Copy)]
pub struct PipObservations<'a> {
    /// Accesses the sandbox found not covered by the pip's manifest.
    pub violations: &'a [ReportedFileAccess],
    pub allowlisted_accesses: &'a [AllowlistedAccess],
    pub exclusive_opaque_directory_content: &'a [DynamicOutputs],
    pub shared_opaque_directory_write_accesses: &'a [DynamicOutputs],
    /// Undeclared reads that policy allowed, e.g. of source files.
    pub allowed_undeclared_reads: &'a [PathId],
    pub absent_path_probes_under_output_dirs: &'a [PathId],
    pub outputs_content: &'a [OutputContent],
}

#[derive(Debug, Clone, Copy)]
struct RecordedWrite {
    pip: PipId,
    content: Option<ContentHash>,
}

pub struct FileMonitoringViolationAnalyzer<'g> {
    graph: &'g PipGraph,
    /// Last known writer of every path written so far, declared or not.
    writers: DashMap<PathId, RecordedWrite>,
    analyzed: DashSet<PipId>,
}

/// Per-call state: one pip being analyzed.
struct Analysis<'a, 'g> {
    analyzer: &'a FileMonitoringViolationAnalyzer<'g>,
    id: PipId,
    pip: &'g Pip,
    process: Option<&'g Process>,
    upstream: OnceCell<VisitationTracker>,
    contents: FxHashMap<PathId, FileMaterializationInfo>,
    result: AnalyzePipViolationsResult,
    violations: Vec<ReportedViolation>,
    allowed: AllowedSameContentDoubleWrites,
}

impl<'g> FileMonitoringViolationAnalyzer<'g> {
    pub fn new(graph: &'g PipGraph) -> Self {
        FileMonitoringViolationAnalyzer {
            graph,
            writers: DashMap::new(),
            analyzed: DashSet::new(),
        }
    }

    fn begin(&self, id: PipId, outputs_content: &[OutputContent]) -> Analysis<'_, 'g> {
        assert!(
            self.analyzed.insert(id),
            "{} analyzed for violations twice",
            self.graph.pip(id).format_hash()
        );
        let pip = self.graph.pip(id);
        Analysis {
            analyzer: self,
            id,
            pip,
            process: pip.as_process(),
            upstream: OnceCell::new(),
            contents: outputs_content
                .iter()
                .map(|o| (o.file.path, o.info))
                .collect(),
            result: AnalyzePipViolationsResult::NO_VIOLATIONS,
            violations: Vec::new(),
            allowed: FxHashMap::default(),
        }
    }

    /// Analyzes a freshly executed pip.
    pub fn analyze_pip_violations(
        &self,
        id: PipId,
        observed: &PipObservations,
    ) -> PipViolationAnalysis {
        let mut a = self.begin(id, observed.outputs_content);
        a.check_allowlisted(observed.allowlisted_accesses);
        let written = a.check_writes(observed);
        a.check_reads(observed, &written);
        a.check_allowed_undeclared_reads(observed.allowed_undeclared_reads, &written);
        a.check_absent_probes(observed.absent_path_probes_under_output_dirs);
        a.finish()
    }

    /// Analyzes a pip replayed from the cache.  There is no live sandbox
    /// report, so only the recorded dynamic accesses are checked.
    pub fn analyze_dynamic_violations(
        &self,
        id: PipId,
        exclusive_opaque_directory_content: &[DynamicOutputs],
        shared_opaque_directory_write_accesses: &[DynamicOutputs],
        allowed_undeclared_reads: &[PathId],
        absent_path_probes_under_output_dirs: &[PathId],
        outputs_content: &[OutputContent],
    ) -> PipViolationAnalysis {
        let observed = PipObservations {
            exclusive_opaque_directory_content,
            shared_opaque_directory_write_accesses,
            allowed_undeclared_reads,
            absent_path_probes_under_output_dirs,
            outputs_content,
            ..Default::default()
        };
        self.analyze_pip_violations(id, &observed)
    }

    /// Re-checks same-content double writes once cache convergence settled
    /// the pip's final outputs.  A write whose converged content no longer
    /// matches the other writer's becomes an error.
    pub fn analyze_double_writes_on_cache_convergence(
        &self,
        id: PipId,
        converged_content: &[OutputContent],
        allowed: &AllowedSameContentDoubleWrites,
    ) -> PipViolationAnalysis {
        let pip = self.graph.pip(id);
        let converged: FxHashMap<PathId, FileMaterializationInfo> = converged_content
            .iter()
            .map(|o| (o.file.path, o.info))
            .collect();

        // Paths this pip owns now carry the converged content, so later
        // writers compare against what actually ends up in the cache.
        for (&path, info) in &converged {
            if let Some(mut w) = self.writers.get_mut(&path) {
                if w.pip == id {
                    w.content = Some(info.hash);
                }
            }
        }

        let mut result = AnalyzePipViolationsResult::NO_VIOLATIONS;
        let mut violations = Vec::new();
        let mut still_allowed = FxHashMap::default();
        for (file, (info, violation)) in allowed {
            match converged.get(&file.path) {
                Some(c) if c.hash != info.hash => {
                    let promoted = ReportedViolation {
                        is_error: true,
                        ..*violation
                    };
                    error!(
                        pip = %pip.format_hash(),
                        path = %self.graph.paths().expand(file.path),
                        "double write: content diverged after cache convergence"
                    );
                    result.add_error();
                    result.mark_unsafe();
                    violations.push(promoted);
                }
                _ => {
                    still_allowed.insert(*file, (*info, *violation));
                }
            }
        }
        PipViolationAnalysis {
            result,
            violations,
            allowed_same_content_double_writes: still_allowed,
        }
    }

    /// The pip currently recorded as the writer of `path`, if any.
    pub fn writer_of(&self, path: PathId) -> Option<PipId> {
        self.writers.get(&path).map(|w| w.pip)
    }
}

impl<'a, 'g> Analysis<'a, 'g> {
    fn graph(&self) -> &'g PipGraph {
        self.analyzer.graph
    }

    fn double_write_policy(&self) -> DoubleWritePolicy {
        self.process
            .map(|p| p.options.double_write_policy)
            .unwrap_or_default()
    }

    /// True if `other` is a transitive dependency of the analyzed pip.
    fn is_upstream(&self, other: PipId) -> bool {
        let graph = self.graph().graph();
        let tracker = self.upstream.get_or_init(|| {
            let tracker = VisitationTracker::new(graph);
            NodeVisitor::new(graph).visit_transitive_dependencies(
                std::iter::once(self.id.node()),
                &tracker,
                |_| true,
            );
            tracker
        });
        other != self.id && graph.is_valid(other.node()) && tracker.was_visited(other.node())
    }

    fn is_untracked(&self, path: PathId) -> bool {
        let paths = self.graph().paths();
        match self.process {
            None => false,
            Some(p) => {
                p.untracked_paths.contains(&path) || paths.is_within_any(path, &p.untracked_scopes)
            }
        }
    }

    fn is_declared_input(&self, path: PathId) -> bool {
        let paths = self.graph().paths();
        self.pip.file_dependencies().iter().any(|f| f.path == path)
            || self
                .pip
                .directory_dependencies()
                .iter()
                .any(|d| paths.is_within(path, d.path))
    }

    fn is_declared_output(&self, path: PathId) -> bool {
        self.pip.file_outputs().iter().any(|f| f.path == path)
    }

    fn is_within_output_directory(&self, path: PathId) -> bool {
        let paths = self.graph().paths();
        self.pip
            .directory_outputs()
            .iter()
            .any(|d| paths.is_within(path, d.path))
    }

    fn report(&mut self, violation: ReportedViolation, makes_unsafe: bool) {
        let path = self.graph().paths().expand(violation.path);
        let related = violation.related.map(|r| self.graph().pip(r).format_hash());
        if violation.is_error {
            error!(
                pip = %self.pip.format_hash(),
                kind = ?violation.kind,
                %path,
                related = ?related,
                "file access violation"
            );
            self.result.add_error();
        } else {
            warn!(
                pip = %self.pip.format_hash(),
                kind = ?violation.kind,
                %path,
                related = ?related,
                "file access violation (not an error)"
            );
        }
        if makes_unsafe {
            self.result.mark_unsafe();
        }
        self.violations.push(violation);
    }

    fn check_allowlisted(&mut self, allowlisted: &[AllowlistedAccess]) {
        for access in allowlisted {
            if !access.cacheable {
                debug!(
                    pip = %self.pip.format_hash(),
                    path = %self.graph().paths().expand(access.access.path),
                    "non-cacheable allowlisted access"
                );
                self.result.mark_unsafe();
            }
        }
    }

    /// Classifies every write and records it.  Returns the set of paths the
    /// pip wrote.
    fn check_writes(&mut self, observed: &PipObservations) -> FxHashSet<PathId> {
        let mut written = FxHashSet::default();
        let pip = self.pip;

        for file in pip.file_outputs() {
            if written.insert(file.path) {
                self.record_write(*file);
            }
        }

        let dynamic = observed
            .exclusive_opaque_directory_content
            .iter()
            .chain(observed.shared_opaque_directory_write_accesses);
        for outputs in dynamic {
            let declared = pip
                .directory_outputs()
                .iter()
                .any(|d| d.path == outputs.directory.path);
            for file in &outputs.files {
                if !written.insert(file.path) {
                    continue;
                }
                let paths = self.graph().paths();
                if declared && paths.is_within(file.path, outputs.directory.path) {
                    self.record_write(*file);
                } else {
                    self.undeclared_write(*file);
                }
            }
        }

        for access in observed.violations {
            if !access.access.is_write() || !written.insert(access.path) {
                continue;
            }
            let file = FileArtifact::output(access.path);
            if self.is_untracked(access.path) {
                continue;
            }
            if self.is_declared_output(access.path) || self.is_within_output_directory(access.path)
            {
                self.record_write(file);
            } else {
                self.undeclared_write(file);
            }
        }

        written
    }

    fn undeclared_write(&mut self, file: FileArtifact) {
        // Record first: a double write with differing content takes
        // precedence and is reported by record_write.
        let collided = self.record_write(file);
        if !collided {
            self.report(
                ReportedViolation {
                    kind: ViolationType::UndeclaredOutput,
                    path: file.path,
                    violator: self.id,
                    related: None,
                    is_error: true,
                },
                true,
            );
        }
    }

    /// Registers this pip as writer of `file`, reporting a double write if
    /// another pip wrote it already.  Returns true if a double write with
    /// differing content (or an erroring policy) was reported.
    fn record_write(&mut self, file: FileArtifact) -> bool {
        let content = self.contents.get(&file.path).map(|i| i.hash);
        let previous = match self.analyzer.writers.entry(file.path) {
            Entry::Vacant(v) => {
                v.insert(RecordedWrite {
                    pip: self.id,
                    content,
                });
                None
            }
            Entry::Occupied(mut o) => {
                if o.get().pip == self.id {
                    o.get_mut().content = content;
                    None
                } else {
                    Some(*o.get())
                }
            }
        };
        let previous = match previous {
            None => return false,
            Some(p) => p,
        };

        let same_content = matches!((content, previous.content), (Some(a), Some(b)) if a == b);
        let violation = ReportedViolation {
            kind: ViolationType::DoubleWrite,
            path: file.path,
            violator: self.id,
            related: Some(previous.pip),
            is_error: true,
        };
        match (self.double_write_policy(), same_content) {
            (DoubleWritePolicy::AllowSameContentDoubleWrites, true) => {
                let info = self.contents[&file.path];
                let violation = ReportedViolation {
                    is_error: false,
                    ..violation
                };
                self.report(violation, false);
                self.allowed.insert(file, (info, violation));
                false
            }
            (DoubleWritePolicy::UnsafeFirstDoubleWriteWins, _) => {
                let violation = ReportedViolation {
                    is_error: false,
                    ..violation
                };
                self.report(violation, true);
                false
            }
            _ => {
                self.report(violation, true);
                true
            }
        }
    }

    /// The pip that wrote or declared `path`, other than the analyzed pip.
    fn foreign_writer(&self, path: PathId) -> Option<PipId> {
        let graph = self.graph();
        let static_producer = graph
            .producer_of(path)
            .or_else(|| graph.directory_producer_of(path).map(|(_, pip)| pip));
        static_producer
            .or_else(|| self.analyzer.writer_of(path))
            .filter(|&p| p != self.id)
    }

    fn check_read_of_foreign_output(&mut self, path: PathId) -> bool {
        let writer = match self.foreign_writer(path) {
            None => return false,
            Some(w) => w,
        };
        let (kind, makes_unsafe) = if self.is_upstream(writer) {
            (ViolationType::UndeclaredOrderedRead, false)
        } else {
            (ViolationType::ReadRace, true)
        };
        self.report(
            ReportedViolation {
                kind,
                path,
                violator: self.id,
                related: Some(writer),
                is_error: true,
            },
            makes_unsafe,
        );
        true
    }

    /// Non-cacheable allowlist matches were already accounted for by
    /// `check_allowlisted`.
    fn is_allowlisted_read(path: PathId, observed: &PipObservations) -> bool {
        observed
            .allowlisted_accesses
            .iter()
            .any(|a| a.access.path == path && !a.access.access.is_write())
    }

    fn check_reads(&mut self, observed: &PipObservations, written: &FxHashSet<PathId>) {
        let mut seen = FxHashSet::default();
        for access in observed.violations {
            if access.access.is_write() || !seen.insert(access.path) {
                continue;
            }
            let path = access.path;
            if written.contains(&path)
                || self.is_declared_input(path)
                || self.is_declared_output(path)
                || self.is_within_output_directory(path)
                || self.is_untracked(path)
                || Self::is_allowlisted_read(path, observed)
            {
                continue;
            }
            let allowed = observed.allowed_undeclared_reads;
            if self.graph().paths().is_within_any(path, allowed) {
                // Exact entries are checked by check_allowed_undeclared_reads.
                if !allowed.contains(&path) {
                    self.check_read_of_foreign_output(path);
                }
                continue;
            }
            if self.check_read_of_foreign_output(path) {
                continue;
            }
            self.report(
                ReportedViolation {
                    kind: ViolationType::UndeclaredRead,
                    path,
                    violator: self.id,
                    related: None,
                    is_error: true,
                },
                false,
            );
        }
    }

    fn check_allowed_undeclared_reads(&mut self, reads: &[PathId], written: &FxHashSet<PathId>) {
        for &path in reads {
            if written.contains(&path) || self.is_untracked(path) {
                continue;
            }
            self.check_read_of_foreign_output(path);
        }
    }

    fn check_absent_probes(&mut self, probes: &[PathId]) {
        for &path in probes {
            if self.is_within_output_directory(path) || self.is_untracked(path) {
                continue;
            }
            let owner = self
                .graph()
                .directory_producer_of(path)
                .map(|(_, pip)| pip)
                .or_else(|| self.analyzer.writer_of(path))
                .filter(|&p| p != self.id);
            if let Some(owner) = owner {
                if !self.is_upstream(owner) {
                    self.report(
                        ReportedViolation {
                            kind: ViolationType::AbsentPathProbeUnderOutputDir,
                            path,
                            violator: self.id,
                            related: Some(owner),
                            is_error: false,
                        },
                        true,
                    );
                }
            }
        }
    }

    fn finish(self) -> PipViolationAnalysis {
        PipViolationAnalysis {
            result: self.result,
            violations: self.violations,
            allowed_same_content_double_writes: self.allowed,
        }
    }
}
