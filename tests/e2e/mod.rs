//! Support code for e2e tests, which run pipcore as a binary.

mod closure;
mod perf;
mod simulate;

pub fn pipcore_binary() -> std::path::PathBuf {
    std::env::current_exe()
        .expect("test binary path")
        .parent()
        .expect("test binary directory")
        .parent()
        .expect("binary directory")
        .join(format!("pipcore{}", std::env::consts::EXE_SUFFIX))
}

pub fn pipcore_command(args: Vec<&str>) -> std::process::Command {
    let mut cmd = std::process::Command::new(pipcore_binary());
    cmd.args(args);
    // Keep test output stable regardless of the caller's environment.
    cmd.env_remove("RUST_LOG");
    cmd
}

fn print_output(out: &std::process::Output) {
    // Gross: use print! instead of writing to stdout so Rust test
    // framework can capture it.
    print!("{}", std::str::from_utf8(&out.stdout).unwrap());
    print!("{}", std::str::from_utf8(&out.stderr).unwrap());
}

pub fn stdout(out: &std::process::Output) -> &str {
    std::str::from_utf8(&out.stdout).unwrap()
}

pub fn assert_output_contains(out: &std::process::Output, text: &str) {
    let out = stdout(out);
    if !out.contains(text) {
        panic!(
            "assertion failed; expected output to contain {:?} but got:\n{}",
            text, out
        );
    }
}

/// Manages a temporary directory for invoking pipcore.
pub struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        Ok(TestSpace { dir })
    }

    /// Write a file into the working space.
    pub fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        std::fs::write(self.dir.path().join(path), content)
    }

    /// Read a file from the working space.
    pub fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.dir.path().join(path))
    }

    /// Invoke pipcore, returning process output.
    pub fn run(&self, cmd: &mut std::process::Command) -> std::io::Result<std::process::Output> {
        cmd.current_dir(self.dir.path()).output()
    }

    /// Like run, but also print output if the command failed.
    pub fn run_expect(
        &self,
        cmd: &mut std::process::Command,
    ) -> anyhow::Result<std::process::Output> {
        let out = self.run(cmd)?;
        if !out.status.success() {
            print_output(&out);
            anyhow::bail!("pipcore failed, status {}", out.status);
        }
        Ok(out)
    }

    /// Persist the temp dir locally and abort the test.  Debugging helper.
    #[allow(dead_code)]
    pub fn eject(self) -> ! {
        panic!("ejected at {:?}", self.dir.into_path());
    }
}

/// A small build: two objects linked into an app, plus a test that runs
/// the app.
pub const DIAMOND: &str = "
# objects
a.o: a.c
b.o: b.c
a.c:
b.c:
app: a.o b.o
test@1: app
";
