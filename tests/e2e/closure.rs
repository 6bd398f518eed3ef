use crate::e2e::*;

#[test]
fn dependencies() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("graph.txt", DIAMOND)?;
    let out = space.run_expect(&mut pipcore_command(vec!["closure", "graph.txt", "app"]))?;
    let mut lines: Vec<&str> = stdout(&out).lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["a.c", "a.o", "app", "b.c", "b.o"]);
    Ok(())
}

#[test]
fn dependents() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("graph.txt", DIAMOND)?;
    let out = space.run_expect(&mut pipcore_command(vec![
        "closure",
        "graph.txt",
        "--dependents",
        "a.c",
    ]))?;
    let mut lines: Vec<&str> = stdout(&out).lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["a.c", "a.o", "app", "test"]);
    Ok(())
}

#[test]
fn prune() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("graph.txt", DIAMOND)?;
    let out = space.run_expect(&mut pipcore_command(vec![
        "closure",
        "graph.txt",
        "--prune",
        "a.o",
        "app",
    ]))?;
    let mut lines: Vec<&str> = stdout(&out).lines().collect();
    lines.sort_unstable();
    // a.o is reached but not expanded, so a.c is not.
    assert_eq!(lines, vec!["a.o", "app", "b.c", "b.o"]);
    Ok(())
}

#[test]
fn unknown_node() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("graph.txt", DIAMOND)?;
    let out = space.run(&mut pipcore_command(vec!["closure", "graph.txt", "nope"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "unknown node \"nope\"");
    Ok(())
}

#[test]
fn cycle() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("graph.txt", "a: b\nb: a\n")?;
    let out = space.run(&mut pipcore_command(vec!["closure", "graph.txt", "a"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "cycle");
    Ok(())
}
