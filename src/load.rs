//! Loads scheduling graphs from a small text format, for the command line
//! tools and benchmarks.
//!
//! One node per line: `name: dep dep ...`.  `name@N` pins the node to
//! worker N.  Nodes may be used as dependencies before they are defined.
//! `#` starts a comment.

use crate::densemap::DenseMap;
use crate::graph::{DenseGraph, GraphBuilder, GraphError, NodeId};
use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;

#[derive(Debug)]
pub struct LoadedGraph {
    pub graph: DenseGraph,
    pub names: DenseMap<NodeId, String>,
    pub preferred_workers: DenseMap<NodeId, Option<u32>>,
    ids: FxHashMap<String, NodeId>,
}

impl LoadedGraph {
    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.names[id]
    }

    /// Resolves node names, failing on the first unknown one.
    pub fn lookup_all<'a>(
        &self,
        names: impl IntoIterator<Item = &'a String>,
    ) -> anyhow::Result<Vec<NodeId>> {
        names
            .into_iter()
            .map(|n| self.lookup(n).ok_or_else(|| anyhow!("unknown node {:?}", n)))
            .collect()
    }
}

#[derive(Default)]
struct Loader {
    builder: GraphBuilder,
    names: DenseMap<NodeId, String>,
    preferred_workers: DenseMap<NodeId, Option<u32>>,
    defined: Vec<bool>,
    ids: FxHashMap<String, NodeId>,
}

impl Loader {
    fn node(&mut self, name: &str) -> NodeId {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.builder.add_node();
        self.names.push(name.to_string());
        self.preferred_workers.push(None);
        self.defined.push(false);
        self.ids.insert(name.to_string(), id);
        id
    }

    fn line(&mut self, lineno: usize, line: &str) -> anyhow::Result<()> {
        let line = match line.find('#') {
            Some(i) => &line[..i],
            None => line,
        };
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }
        let (head, deps) = match line.split_once(':') {
            Some(parts) => parts,
            None => bail!("line {}: expected 'name: deps', got {:?}", lineno, line),
        };
        let (name, worker) = match head.trim().split_once('@') {
            None => (head.trim(), None),
            Some((name, worker)) => match worker.parse::<u32>() {
                Ok(w) => (name, Some(w)),
                Err(err) => bail!("line {}: bad worker {:?}: {}", lineno, worker, err),
            },
        };
        if name.is_empty() || name.contains(char::is_whitespace) {
            bail!("line {}: bad node name {:?}", lineno, name);
        }
        let id = self.node(name);
        if std::mem::replace(&mut self.defined[id.raw() as usize], true) {
            bail!("line {}: {:?} defined twice", lineno, name);
        }
        self.preferred_workers[id] = worker;
        for dep in deps.split_whitespace() {
            let dep_id = self.node(dep);
            if dep_id == id {
                bail!("line {}: {:?} depends on itself", lineno, name);
            }
            self.builder.add_edge(dep_id, id)?;
        }
        Ok(())
    }

    fn finish(self) -> anyhow::Result<LoadedGraph> {
        let names = self.names;
        let graph = self.builder.seal().map_err(|err| match err {
            GraphError::Cycle(n, witness) => {
                anyhow!("dependency cycle through {} nodes, including {:?}", n, names[witness])
            }
            err => err.into(),
        })?;
        Ok(LoadedGraph {
            graph,
            names,
            preferred_workers: self.preferred_workers,
            ids: self.ids,
        })
    }
}

pub fn parse(text: &str) -> anyhow::Result<LoadedGraph> {
    let mut loader = Loader::default();
    for (i, line) in text.lines().enumerate() {
        loader.line(i + 1, line)?;
    }
    loader.finish()
}

pub fn read(path: &str) -> anyhow::Result<LoadedGraph> {
    let text = std::fs::read_to_string(path).map_err(|err| anyhow!("read {}: {}", path, err))?;
    parse(&text).map_err(|err| anyhow!("{}: {}", path, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DirectedGraph;

    #[test]
    fn parse_graph() {
        let g = parse(
            "# a diamond
             top: left right
             left: base   # trailing comment
             right@1: base
             base:
            ",
        )
        .unwrap();
        assert_eq!(g.graph.node_count(), 4);
        let base = g.lookup("base").unwrap();
        let top = g.lookup("top").unwrap();
        assert_eq!(g.graph.outgoing_edges(base).len(), 2);
        assert_eq!(g.graph.incoming_edges(top).len(), 2);
        assert_eq!(g.preferred_workers[g.lookup("right").unwrap()], Some(1));
        assert_eq!(g.preferred_workers[top], None);
        assert_eq!(g.name(top), "top");
    }

    #[test]
    fn undefined_dependency_is_a_leaf() {
        let g = parse("a: b").unwrap();
        let b = g.lookup("b").unwrap();
        assert!(g.graph.incoming_edges(b).is_empty());
    }

    #[test]
    fn errors() {
        let err = |text: &str| parse(text).unwrap_err().to_string();
        assert!(err("a b").contains("line 1"));
        assert!(err("a: b\na: c").contains("defined twice"));
        assert!(err("a: a").contains("itself"));
        assert!(err("a@x: b").contains("bad worker"));
        assert!(err("a: b\nb: c\nc: a").contains("cycle"));
    }

    #[test]
    fn lookup_all() {
        let g = parse("a:\nb: a").unwrap();
        let ids = g.lookup_all(&["b".to_string(), "a".to_string()]).unwrap();
        assert_eq!(ids, vec![g.lookup("b").unwrap(), g.lookup("a").unwrap()]);
        let err = g.lookup_all(&["a".to_string(), "zz".to_string()]).unwrap_err();
        assert!(err.to_string().contains("zz"));
    }
}
