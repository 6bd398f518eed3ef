//! The pip model: declared units of build work and the graph between them.
//!
//! Pips are built once by the graph builder and never change afterwards.
//! Every pip owns exactly one node in the scheduling graph, and pip ids
//! and node ids coincide.

use crate::densemap::{DenseMap, Index};
use crate::graph::{DenseGraph, DirectedGraph, GraphBuilder, NodeId};
use crate::paths::{PathId, PathTable};
use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;

/// A pip's identity within one build; the same number as its graph node.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PipId(u32);

impl PipId {
    pub fn node(self) -> NodeId {
        NodeId::from(self.0 as usize)
    }
}

impl From<NodeId> for PipId {
    fn from(node: NodeId) -> PipId {
        PipId(node.raw())
    }
}

impl Index for PipId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}

impl From<usize> for PipId {
    fn from(u: usize) -> PipId {
        PipId::from(NodeId::from(u))
    }
}

/// A file at a given version.  Rewrite count 0 is a source file; each pip
/// that rewrites a file in place produces the next version.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct FileArtifact {
    pub path: PathId,
    pub rewrite_count: u32,
}

impl FileArtifact {
    pub fn source(path: PathId) -> Self {
        FileArtifact {
            path,
            rewrite_count: 0,
        }
    }

    pub fn output(path: PathId) -> Self {
        FileArtifact {
            path,
            rewrite_count: 1,
        }
    }

    pub fn is_output(&self) -> bool {
        self.rewrite_count > 0
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DirectoryKind {
    /// Sealed directory of source files.
    SourceSealed,
    /// Output directory whose whole content belongs to a single pip.
    ExclusiveOpaque,
    /// Output directory that several pips may write into.
    SharedOpaque,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct DirectoryArtifact {
    pub path: PathId,
    pub kind: DirectoryKind,
}

/// What to do when two pips write the same path.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum DoubleWritePolicy {
    /// Every double write is an error, even with identical content.
    DoubleWritesAreErrors,
    /// Identical content is tolerated; differing content is an error.
    #[default]
    AllowSameContentDoubleWrites,
    /// The first writer wins and the pip is never cached.
    UnsafeFirstDoubleWriteWins,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Always run, never consult the cache.
    pub disable_cache_lookup: bool,
    /// Never reuse results from the cache nor store them.
    pub uncacheable: bool,
    pub double_write_policy: DoubleWritePolicy,
    /// Worker the pip prefers to run on, if any.
    pub preferred_worker: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Process {
    pub executable: FileArtifact,
    pub arguments: Vec<String>,
    pub working_directory: PathId,
    pub environment: Vec<(String, String)>,
    pub dependencies: Vec<FileArtifact>,
    pub outputs: Vec<FileArtifact>,
    pub directory_dependencies: Vec<DirectoryArtifact>,
    pub directory_outputs: Vec<DirectoryArtifact>,
    /// Directories whose accesses are neither tracked nor reported.
    pub untracked_scopes: Vec<PathId>,
    pub untracked_paths: Vec<PathId>,
    pub options: ProcessOptions,
}

impl Process {
    pub fn new(executable: FileArtifact, working_directory: PathId) -> Self {
        Process {
            executable,
            arguments: Vec::new(),
            working_directory,
            environment: Vec::new(),
            dependencies: vec![executable],
            outputs: Vec::new(),
            directory_dependencies: Vec::new(),
            directory_outputs: Vec::new(),
            untracked_scopes: Vec::new(),
            untracked_paths: Vec::new(),
            options: ProcessOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CopyFile {
    pub source: FileArtifact,
    pub destination: FileArtifact,
}

#[derive(Debug, Clone)]
pub struct WriteFile {
    pub destination: FileArtifact,
    pub contents: String,
}

/// A call to a long-running service over IPC.
#[derive(Debug, Clone)]
pub struct Ipc {
    pub moniker: String,
    pub message: String,
    pub dependencies: Vec<FileArtifact>,
    pub output: FileArtifact,
    pub disable_cache_lookup: bool,
    pub preferred_worker: Option<u32>,
}

/// Start or stop of a service process.
#[derive(Debug, Clone)]
pub struct Service {
    pub process: Process,
    pub is_shutdown: bool,
}

#[derive(Debug, Clone)]
pub enum PipKind {
    Process(Process),
    CopyFile(CopyFile),
    WriteFile(WriteFile),
    Ipc(Ipc),
    Service(Service),
}

#[derive(Debug, Clone)]
pub struct Pip {
    /// Identity that stays stable across builds.
    pub semi_stable_hash: u64,
    pub description: String,
    pub kind: PipKind,
}

impl Pip {
    pub fn new(semi_stable_hash: u64, description: impl Into<String>, kind: PipKind) -> Self {
        Pip {
            semi_stable_hash,
            description: description.into(),
            kind,
        }
    }

    /// Short form used in log messages.
    pub fn format_hash(&self) -> String {
        format!("Pip{:016X}", self.semi_stable_hash)
    }

    pub fn as_process(&self) -> Option<&Process> {
        match &self.kind {
            PipKind::Process(p) => Some(p),
            PipKind::Service(s) => Some(&s.process),
            _ => None,
        }
    }

    pub fn preferred_worker(&self) -> Option<u32> {
        match &self.kind {
            PipKind::Process(p) => p.options.preferred_worker,
            PipKind::Service(s) => s.process.options.preferred_worker,
            PipKind::Ipc(ipc) => ipc.preferred_worker,
            PipKind::CopyFile(_) | PipKind::WriteFile(_) => None,
        }
    }

    /// Declared file inputs.
    pub fn file_dependencies(&self) -> &[FileArtifact] {
        match &self.kind {
            PipKind::Process(p) => &p.dependencies,
            PipKind::Service(s) => &s.process.dependencies,
            PipKind::CopyFile(c) => std::slice::from_ref(&c.source),
            PipKind::WriteFile(_) => &[],
            PipKind::Ipc(ipc) => &ipc.dependencies,
        }
    }

    /// Declared file outputs.
    pub fn file_outputs(&self) -> &[FileArtifact] {
        match &self.kind {
            PipKind::Process(p) => &p.outputs,
            PipKind::Service(s) => &s.process.outputs,
            PipKind::CopyFile(c) => std::slice::from_ref(&c.destination),
            PipKind::WriteFile(w) => std::slice::from_ref(&w.destination),
            PipKind::Ipc(ipc) => std::slice::from_ref(&ipc.output),
        }
    }

    pub fn directory_dependencies(&self) -> &[DirectoryArtifact] {
        self.as_process()
            .map(|p| p.directory_dependencies.as_slice())
            .unwrap_or(&[])
    }

    pub fn directory_outputs(&self) -> &[DirectoryArtifact] {
        self.as_process()
            .map(|p| p.directory_outputs.as_slice())
            .unwrap_or(&[])
    }
}

/// All pips of a build, their dependency graph, and the paths they use.
pub struct PipGraph {
    pips: DenseMap<PipId, Pip>,
    graph: DenseGraph,
    paths: PathTable,
    file_producers: FxHashMap<PathId, PipId>,
    directory_producers: FxHashMap<PathId, PipId>,
}

impl PipGraph {
    pub fn pip(&self, id: PipId) -> &Pip {
        &self.pips[id]
    }

    pub fn pips(&self) -> impl Iterator<Item = (PipId, &Pip)> {
        self.pips.iter()
    }

    pub fn len(&self) -> usize {
        self.pips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pips.is_empty()
    }

    pub fn graph(&self) -> &DenseGraph {
        &self.graph
    }

    pub fn paths(&self) -> &PathTable {
        &self.paths
    }

    /// The pip that statically declares `path` as a file output.
    pub fn producer_of(&self, path: PathId) -> Option<PipId> {
        self.file_producers.get(&path).copied()
    }

    /// The pip that declares an output directory containing `path`.
    pub fn directory_producer_of(&self, path: PathId) -> Option<(PathId, PipId)> {
        self.paths
            .ancestors(path)
            .find_map(|dir| self.directory_producers.get(&dir).map(|&pip| (dir, pip)))
    }

    pub fn dependencies(&self, id: PipId) -> impl Iterator<Item = PipId> + '_ {
        self.graph
            .incoming_edges(id.node())
            .iter()
            .map(|&n| PipId::from(n))
    }

    pub fn dependents(&self, id: PipId) -> impl Iterator<Item = PipId> + '_ {
        self.graph
            .outgoing_edges(id.node())
            .iter()
            .map(|&n| PipId::from(n))
    }
}

/// Builds a `PipGraph`.  Producers must be added before their consumers.
#[derive(Default)]
pub struct PipGraphBuilder {
    pips: DenseMap<PipId, Pip>,
    builder: GraphBuilder,
    pub paths: PathTable,
    file_producers: FxHashMap<PathId, PipId>,
    directory_producers: FxHashMap<PathId, PipId>,
}

impl PipGraphBuilder {
    pub fn new() -> Self {
        PipGraphBuilder::default()
    }

    pub fn path(&mut self, path: &str) -> PathId {
        self.paths.add(path)
    }

    /// Adds a pip, wiring an edge from the producer of every declared input.
    /// A rejected pip leaves the builder unchanged.
    pub fn add_pip(&mut self, pip: Pip) -> anyhow::Result<PipId> {
        for out in pip.file_outputs() {
            if let Some(&other) = self.file_producers.get(&out.path) {
                bail!(
                    "double link: {} is produced by both {:?} and {}",
                    self.paths.expand(out.path),
                    self.pips[other].description,
                    pip.description
                );
            }
        }
        for dir in pip.directory_outputs() {
            if dir.kind != DirectoryKind::ExclusiveOpaque {
                continue;
            }
            if let Some(&other) = self.directory_producers.get(&dir.path) {
                bail!(
                    "exclusive opaque directory {} is produced by both {:?} and {}",
                    self.paths.expand(dir.path),
                    self.pips[other].description,
                    pip.description
                );
            }
        }

        let mut producers = Vec::new();
        for dep in pip.file_dependencies() {
            if let Some(&producer) = self.file_producers.get(&dep.path) {
                producers.push(producer);
            } else if dep.is_output() && !pip.file_outputs().contains(dep) {
                bail!(
                    "{} consumes {} which no pip produces",
                    pip.description,
                    self.paths.expand(dep.path)
                );
            }
        }
        for dir in pip.directory_dependencies() {
            if let Some(&producer) = self.directory_producers.get(&dir.path) {
                producers.push(producer);
            }
        }

        let node = self.builder.add_node();
        let id = PipId::from(node);
        for producer in producers {
            // Both ends exist and the new node has no dependents yet, so this
            // can neither fail nor close a cycle.
            self.builder
                .add_edge(producer.node(), node)
                .map_err(|err| anyhow!("{}: {}", pip.description, err))?;
        }
        for out in pip.file_outputs() {
            self.file_producers.insert(out.path, id);
        }
        for dir in pip.directory_outputs() {
            self.directory_producers.entry(dir.path).or_insert(id);
        }

        let pushed = self.pips.push(pip);
        debug_assert_eq!(pushed, id);
        Ok(id)
    }

    pub fn build(self) -> anyhow::Result<PipGraph> {
        let graph = self.builder.seal()?;
        Ok(PipGraph {
            pips: self.pips,
            graph,
            paths: self.paths,
            file_producers: self.file_producers,
            directory_producers: self.directory_producers,
        })
    }
}

#[cfg(test)]
pub mod testing {
    //! Helpers for building small pip graphs in tests.

    use super::*;

    pub fn process(
        b: &mut PipGraphBuilder,
        hash: u64,
        ins: &[&str],
        outs: &[&str],
    ) -> Process {
        let exe = FileArtifact::source(b.path("/bin/tool"));
        let cwd = b.path("/work");
        let mut p = Process::new(exe, cwd);
        p.arguments = vec![format!("--id={}", hash)];
        p.dependencies
            .extend(ins.iter().map(|i| FileArtifact::source(b.path(i))));
        p.outputs = outs.iter().map(|o| FileArtifact::output(b.path(o))).collect();
        p
    }

    pub fn add_process(b: &mut PipGraphBuilder, hash: u64, process: Process) -> PipId {
        b.add_pip(Pip::new(
            hash,
            format!("process {}", hash),
            PipKind::Process(process),
        ))
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn edges_from_declared_files() {
        let mut b = PipGraphBuilder::new();
        let p1 = process(&mut b, 1, &["/src/a.c"], &["/out/a.o"]);
        let a = add_process(&mut b, 1, p1);
        let mut p2 = process(&mut b, 2, &[], &["/out/app"]);
        p2.dependencies
            .push(FileArtifact::output(b.path("/out/a.o")));
        let app = add_process(&mut b, 2, p2);
        let g = b.build().unwrap();

        assert_eq!(g.dependencies(app).collect::<Vec<_>>(), vec![a]);
        assert_eq!(g.dependents(a).collect::<Vec<_>>(), vec![app]);
        let ao = g.paths().get("/out/a.o").unwrap();
        assert_eq!(g.producer_of(ao), Some(a));
    }

    #[test]
    fn double_link_rejected() {
        let mut b = PipGraphBuilder::new();
        let p1 = process(&mut b, 1, &[], &["/out/x"]);
        add_process(&mut b, 1, p1);
        let p2 = process(&mut b, 2, &[], &["/out/x"]);
        let err = b
            .add_pip(Pip::new(2, "second", PipKind::Process(p2)))
            .unwrap_err();
        assert!(err.to_string().contains("double link"), "{}", err);
        let g = b.build().unwrap();
        assert_eq!(g.len(), 1);
        assert_eq!(g.graph().node_count(), 1);
    }

    #[test]
    fn missing_producer_rejected() {
        let mut b = PipGraphBuilder::new();
        let mut p = process(&mut b, 1, &[], &[]);
        p.dependencies.push(FileArtifact::output(b.path("/out/nope")));
        assert!(b.add_pip(Pip::new(1, "p", PipKind::Process(p))).is_err());
    }

    #[test]
    fn directory_edges() {
        let mut b = PipGraphBuilder::new();
        let dir = b.path("/out/gen");
        let mut p1 = process(&mut b, 1, &[], &[]);
        p1.directory_outputs.push(DirectoryArtifact {
            path: dir,
            kind: DirectoryKind::SharedOpaque,
        });
        let writer = add_process(&mut b, 1, p1);
        let mut p2 = process(&mut b, 2, &[], &[]);
        p2.directory_dependencies.push(DirectoryArtifact {
            path: dir,
            kind: DirectoryKind::SharedOpaque,
        });
        let reader = add_process(&mut b, 2, p2);
        let g = b.build().unwrap();
        assert_eq!(g.dependencies(reader).collect::<Vec<_>>(), vec![writer]);

        let file = g.paths().get("/out/gen").unwrap();
        assert_eq!(g.directory_producer_of(file), Some((dir, writer)));
    }

    #[test]
    fn kind_accessors() {
        let mut b = PipGraphBuilder::new();
        let src = FileArtifact::source(b.path("/src/in.txt"));
        let dst = FileArtifact::output(b.path("/out/in.txt"));
        let pip = Pip::new(
            0xAB,
            "copy",
            PipKind::CopyFile(CopyFile {
                source: src,
                destination: dst,
            }),
        );
        assert_eq!(pip.file_dependencies(), &[src]);
        assert_eq!(pip.file_outputs(), &[dst]);
        assert!(pip.as_process().is_none());
        assert!(pip.directory_outputs().is_empty());
        assert_eq!(pip.format_hash(), "Pip00000000000000AB");
    }
}
