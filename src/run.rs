//! Command line driver.

use crate::cache_miss::{CacheMissCounters, CacheProbe};
use crate::cacheable::ArtificialCacheMissOptions;
use crate::dispatcher::{
    DispatchContext, DispatcherConfig, DispatcherKind, DispatcherQueue, NestedDispatcherQueue,
    RunnablePip,
};
use crate::graph::{DirectedGraph, NodeId};
use crate::load::{self, LoadedGraph};
use crate::perf::{
    expected_priority, ExecutionLevel, HistoricPerfDataTable, ProcessPipExecutionPerformance,
    ProcessPipHistoricPerfData,
};
use crate::pip::PipId;
use crate::trace;
use crate::traversal::{NodeVisitor, VisitationTracker};
use anyhow::{anyhow, bail};
use argh::FromArgs;
use rustc_hash::{FxHashSet, FxHasher};
use std::hash::Hasher;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(FromArgs)]
/// Inspect and exercise the cache-dispatch core of a build orchestrator.
struct Opts {
    /// debugging tools, "-d list" to list
    #[argh(option, short = 'd')]
    debug: Option<String>,

    /// log debug messages (RUST_LOG takes precedence)
    #[argh(switch, short = 'v')]
    verbose: bool,

    #[argh(subcommand)]
    command: Option<Command>,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Perf(PerfArgs),
    Closure(ClosureArgs),
    Simulate(SimulateArgs),
}

#[derive(FromArgs)]
/// Dump a historic performance data file.
#[argh(subcommand, name = "perf")]
struct PerfArgs {
    /// path to the data file
    #[argh(positional)]
    db: String,
}

#[derive(FromArgs)]
/// Print the transitive dependencies (or dependents) of nodes in a graph file.
#[argh(subcommand, name = "closure")]
struct ClosureArgs {
    /// path to the graph file
    #[argh(positional)]
    graph: String,

    /// follow dependents instead of dependencies
    #[argh(switch)]
    dependents: bool,

    /// don't expand past this node (repeatable)
    #[argh(option)]
    prune: Vec<String>,

    /// start nodes
    #[argh(positional)]
    nodes: Vec<String>,
}

#[derive(FromArgs)]
/// Schedule every node of a graph file through the dispatcher.
#[argh(subcommand, name = "simulate")]
struct SimulateArgs {
    /// path to the graph file
    #[argh(positional)]
    graph: String,

    /// parallel degree per worker [default from system]
    #[argh(option, short = 'j')]
    parallelism: Option<usize>,

    /// number of workers
    #[argh(option, short = 'w', default = "1")]
    workers: usize,

    /// historic performance data file to read and update
    #[argh(option)]
    perf_db: Option<String>,

    /// bypass the cache for a sample of pips: rate[~seed], '~' prefix inverts
    #[argh(option)]
    artificial_miss: Option<String>,

    /// make this node fail when it runs (repeatable)
    #[argh(option)]
    fail: Vec<String>,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn perf(args: PerfArgs) -> anyhow::Result<i32> {
    let table = trace::scope("perf::load", || HistoricPerfDataTable::load(&args.db))?;
    println!("# hash ttl exe_ms max_exe_ms run_ms peak_ws_mb avg_ws_mb peak_commit_mb avg_commit_mb io_mb cpu%");
    for (hash, d) in table.entries() {
        println!(
            "{:016X} {} {} {} {} {} {} {} {} {} {}",
            hash,
            d.time_to_live,
            d.exe_duration_ms,
            d.max_exe_duration_ms,
            d.run_duration_ms,
            d.peak_working_set_mb,
            d.average_working_set_mb,
            d.peak_commit_size_mb,
            d.average_commit_size_mb,
            d.disk_io_mb,
            d.processor_usage_percent
        );
    }
    Ok(0)
}

fn closure(args: ClosureArgs) -> anyhow::Result<i32> {
    if args.nodes.is_empty() {
        bail!("no start nodes given");
    }
    let g = trace::scope("load::read", || load::read(&args.graph))?;
    let starts = g.lookup_all(&args.nodes)?;
    let prune: FxHashSet<NodeId> = g.lookup_all(&args.prune)?.into_iter().collect();

    let tracker = VisitationTracker::new(&g.graph);
    let visitor = NodeVisitor::new(&g.graph);
    let expand = |id: NodeId| !prune.contains(&id);
    trace::scope("closure", || {
        if args.dependents {
            visitor.visit_transitive_dependents(starts, &tracker, expand);
        } else {
            visitor.visit_transitive_dependencies(starts, &tracker, expand);
        }
    });
    for id in tracker.visited_nodes() {
        println!("{}", g.name(id));
    }
    Ok(0)
}

/// Stable across runs, so historic data from one run matches the next.
fn semi_stable_hash(name: &str) -> u64 {
    let mut h = FxHasher::default();
    h.write(name.as_bytes());
    h.finish()
}

/// A synthetic measurement standing in for sandbox telemetry.
fn synthetic_performance(run: Duration) -> ProcessPipExecutionPerformance {
    ProcessPipExecutionPerformance {
        execution_level: ExecutionLevel::Executed,
        processor_time: run,
        suspended_duration: Duration::ZERO,
        run_duration: run,
        peak_working_set_mb: 1,
        average_working_set_mb: 1,
        peak_commit_size_mb: 1,
        average_commit_size_mb: 1,
        disk_io_mb: 0,
        processor_usage_percent: 100,
    }
}

struct Simulation<'a> {
    graph: &'a LoadedGraph,
    table: &'a HistoricPerfDataTable,
    artificial: &'a ArtificialCacheMissOptions,
    counters: &'a CacheMissCounters,
    hashes: Vec<u64>,
    hits: FxHashSet<NodeId>,
    failing: FxHashSet<NodeId>,
}

impl<'a> Simulation<'a> {
    /// Looks the pip up in the historic store, which stands in for the
    /// cache here: a pip seen in a previous run is a hit.
    fn lookup(&mut self, id: NodeId) -> bool {
        let hash = self.hashes[id.raw() as usize];
        let known = self.table.get(hash).is_some();
        let probe = CacheProbe {
            artificial_miss: self.artificial.should_miss(hash),
            weak_fingerprint_matched: known,
            strong_fingerprint_matched: true,
            descriptor_valid: true,
            cache_entry_retrieved: true,
            metadata_retrieved: Some(true),
            output_content_available: true,
            ..Default::default()
        };
        let miss = self.counters.record_lookup(PipId::from(id), &probe);
        debug!(node = self.graph.name(id), ?miss, "cache lookup");
        if miss.is_none() {
            self.hits.insert(id);
        }
        miss.is_none()
    }

    fn runnable(&mut self, id: NodeId) -> RunnablePip {
        let hash = self.hashes[id.raw() as usize];
        let hit = self.lookup(id);
        let fail = self.failing.contains(&id);
        let work = move || -> anyhow::Result<()> {
            if fail {
                bail!("injected failure");
            }
            if !hit {
                // Stand-in for process execution.
                std::hint::black_box(hash.wrapping_mul(31));
            }
            Ok(())
        };
        RunnablePip {
            preferred_worker: self.graph.preferred_workers[id],
            priority: expected_priority(self.table.get(hash).as_ref()),
            ..RunnablePip::new(PipId::from(id), work)
        }
    }
}

fn simulate(args: SimulateArgs) -> anyhow::Result<i32> {
    let g = trace::scope("load::read", || load::read(&args.graph))?;
    if args.workers == 0 {
        bail!("-w must be at least 1");
    }
    let parallelism = match args.parallelism {
        Some(0) => bail!("-j must be at least 1"),
        Some(n) => n,
        None => usize::from(std::thread::available_parallelism()?),
    };
    for id in g.graph.nodes() {
        if let Some(w) = g.preferred_workers[id] {
            if w as usize >= args.workers {
                bail!(
                    "{:?} prefers worker {} but only {} workers exist",
                    g.name(id),
                    w,
                    args.workers
                );
            }
        }
    }
    let artificial = match &args.artificial_miss {
        None => ArtificialCacheMissOptions::default(),
        Some(spec) => ArtificialCacheMissOptions::parse(spec)?,
    };
    let table = match &args.perf_db {
        None => HistoricPerfDataTable::new(),
        Some(path) => trace::scope("perf::load", || HistoricPerfDataTable::load(path))?,
    };

    let failing: FxHashSet<NodeId> = g.lookup_all(&args.fail)?.into_iter().collect();
    let threads = match parallelism.checked_mul(args.workers) {
        Some(n) => n,
        None => bail!("-j {} with -w {} is too many threads", parallelism, args.workers),
    };

    let (context, finished) = DispatchContext::new(threads)?;
    let queue = NestedDispatcherQueue::new(
        DispatcherConfig {
            kind: DispatcherKind::Cpu,
            max_parallel_degree: parallelism,
        },
        args.workers,
        context,
    );
    let counters = CacheMissCounters::new();
    let mut sim = Simulation {
        graph: &g,
        table: &table,
        artificial: &artificial,
        counters: &counters,
        hashes: g
            .graph
            .nodes()
            .map(|id| semi_stable_hash(g.name(id)))
            .collect(),
        hits: FxHashSet::default(),
        failing,
    };

    let mut waiting: Vec<usize> = g
        .graph
        .nodes()
        .map(|id| g.graph.incoming_edges(id).len())
        .collect();
    for id in g.graph.nodes() {
        if waiting[id.raw() as usize] == 0 {
            queue.enqueue(sim.runnable(id));
        }
    }

    let total = g.graph.node_count();
    let visitor = NodeVisitor::new(&g.graph);
    // Failed pips and everything downstream of them.
    let blocked = VisitationTracker::new(&g.graph);
    let mut done = 0;
    let mut failed = 0;
    let mut skipped = 0;
    while done + failed + skipped < total {
        queue.start_tasks();
        let pip = finished.recv().map_err(|_| {
            anyhow!(
                "dispatcher stopped with {} pips outstanding",
                total - done - failed - skipped
            )
        })?;
        let id = pip.pip.node();
        let name = g.name(id);
        if trace::is_enabled() {
            trace::write_complete(name, pip.tid, pip.span.0, pip.span.1)?;
        }
        if let Err(err) = pip.result {
            tracing::error!(node = name, %err, "pip failed");
            failed += 1;
            let before = blocked.visited_count();
            visitor.visit_transitive_dependents(std::iter::once(id), &blocked, |_| true);
            // The failed pip itself was marked too.
            skipped += blocked.visited_count() - before - 1;
            continue;
        }
        done += 1;
        let hash = sim.hashes[id.raw() as usize];
        if sim.hits.contains(&id) {
            table.refresh(hash);
        } else {
            let perf = synthetic_performance(pip.span.1.duration_since(pip.span.0));
            table.add_or_update(hash, ProcessPipHistoricPerfData::from_execution(&perf))?;
        }
        for &dependent in g.graph.outgoing_edges(id) {
            let w = &mut waiting[dependent.raw() as usize];
            *w -= 1;
            if *w == 0 {
                queue.enqueue(sim.runnable(dependent));
            }
        }
    }
    queue.dispose();

    if let Some(path) = &args.perf_db {
        trace::scope("perf::save", || table.save(path))?;
    }
    info!(pips = total, failed, "simulation finished");

    println!(
        "pipcore: ran {} pips on {} worker(s), {} cache hits, {} misses",
        done,
        args.workers,
        counters.hits(),
        counters.total_misses()
    );
    for (miss, count) in counters.nonzero_misses() {
        println!("  {:?}: {}", miss, count);
    }
    if failed > 0 || skipped > 0 {
        println!("pipcore: {} failed, {} skipped", failed, skipped);
        return Ok(1);
    }
    Ok(0)
}

fn run_impl() -> anyhow::Result<i32> {
    let opts: Opts = argh::from_env();
    init_logging(opts.verbose);

    if let Some(debug) = opts.debug {
        match debug.as_str() {
            "list" => {
                println!("debug tools:");
                println!("  trace  generate json performance trace");
                return Ok(1);
            }
            "trace" => trace::open("trace.json")?,
            _ => bail!("unknown -d {:?}, use -d list to list", debug),
        }
    }

    match opts.command {
        None => bail!("no subcommand given, see --help"),
        Some(Command::Perf(args)) => perf(args),
        Some(Command::Closure(args)) => closure(args),
        Some(Command::Simulate(args)) => simulate(args),
    }
}

pub fn run() -> anyhow::Result<i32> {
    let res = run_impl();
    trace::close()?;
    res
}
