use crate::e2e::*;

#[test]
fn dump_after_simulation() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("graph.txt", "a:\nb: a\n")?;
    space.run_expect(&mut pipcore_command(vec![
        "simulate",
        "graph.txt",
        "--perf-db",
        "perf.db",
    ]))?;
    let out = space.run_expect(&mut pipcore_command(vec!["perf", "perf.db"]))?;
    let entries: Vec<&str> = stdout(&out)
        .lines()
        .filter(|l| !l.starts_with('#'))
        .collect();
    assert_eq!(entries.len(), 2);
    for entry in entries {
        let fields: Vec<&str> = entry.split(' ').collect();
        assert_eq!(fields.len(), 11);
        // Loading ages every entry by one build.
        assert_eq!(fields[1], "254");
    }
    Ok(())
}

#[test]
fn missing_db_is_empty() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let out = space.run_expect(&mut pipcore_command(vec!["perf", "nothing.db"]))?;
    assert_eq!(stdout(&out).lines().count(), 1);
    Ok(())
}

#[test]
fn corrupt_db() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("perf.db", "garbage garbage")?;
    let out = space.run(&mut pipcore_command(vec!["perf", "perf.db"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "not a historic perf data file");
    Ok(())
}
