use crate::e2e::*;

#[test]
fn cold_then_warm() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("graph.txt", DIAMOND)?;

    let args = vec!["simulate", "graph.txt", "-j", "2", "-w", "2", "--perf-db", "perf.db"];
    let out = space.run_expect(&mut pipcore_command(args.clone()))?;
    assert_output_contains(&out, "ran 6 pips on 2 worker(s), 0 cache hits, 6 misses");
    assert_output_contains(&out, "MissForDescriptorsDueToWeakFingerprints: 6");
    assert!(space.read("perf.db")?.starts_with(b"PPHD"));

    let out = space.run_expect(&mut pipcore_command(args))?;
    assert_output_contains(&out, "ran 6 pips on 2 worker(s), 6 cache hits, 0 misses");
    Ok(())
}

#[test]
fn artificial_misses() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("graph.txt", DIAMOND)?;
    let base = vec!["simulate", "graph.txt", "-w", "2", "--perf-db", "perf.db"];
    space.run_expect(&mut pipcore_command(base.clone()))?;

    let mut args = base;
    args.extend(["--artificial-miss", "1"]);
    let out = space.run_expect(&mut pipcore_command(args))?;
    assert_output_contains(&out, "0 cache hits, 6 misses");
    assert_output_contains(&out, "MissForDescriptorsDueToArtificialMissOptions: 6");
    Ok(())
}

#[test]
fn worker_out_of_range() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("graph.txt", DIAMOND)?;
    // test@1 needs two workers.
    let out = space.run(&mut pipcore_command(vec!["simulate", "graph.txt", "-w", "1"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "prefers worker 1");
    Ok(())
}

#[test]
fn bad_artificial_miss_rate() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("graph.txt", "a:\n")?;
    let out = space.run(&mut pipcore_command(vec![
        "simulate",
        "graph.txt",
        "--artificial-miss",
        "2",
    ]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "outside [0, 1]");
    Ok(())
}

#[test]
fn trace_output() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("graph.txt", DIAMOND)?;
    space.run_expect(&mut pipcore_command(vec![
        "-d", "trace", "simulate", "graph.txt", "-w", "2",
    ]))?;
    let trace = String::from_utf8(space.read("trace.json")?)?;
    assert!(trace.starts_with('['));
    assert!(trace.contains("\"name\": \"app\""));
    assert!(trace.contains("\"name\": \"load::read\""));
    Ok(())
}

#[test]
fn failure_skips_dependents() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("graph.txt", DIAMOND)?;
    let out = space.run(&mut pipcore_command(vec![
        "simulate", "graph.txt", "-w", "2", "--fail", "a.o",
    ]))?;
    assert_eq!(out.status.code(), Some(1));
    // a.c, b.c and b.o still run; app and test are blocked.
    assert_output_contains(&out, "ran 3 pips on 2 worker(s)");
    assert_output_contains(&out, "pipcore: 1 failed, 2 skipped");
    Ok(())
}

#[test]
fn failing_unknown_node() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("graph.txt", DIAMOND)?;
    let out = space.run(&mut pipcore_command(vec![
        "simulate", "graph.txt", "-w", "2", "--fail", "nope",
    ]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "unknown node \"nope\"");
    Ok(())
}

#[test]
fn thread_count_overflow() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("graph.txt", "a:\n")?;
    let out = space.run(&mut pipcore_command(vec![
        "simulate",
        "graph.txt",
        "-j",
        "18446744073709551615",
        "-w",
        "2",
    ]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "too many threads");
    Ok(())
}
