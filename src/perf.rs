//! Historic performance data: a decaying per-pip estimate of how long a pip
//! runs and how much memory and I/O it uses, carried from build to build.
//!
//! Values are immutable snapshots.  A new execution is folded in with
//! `merge`, which rises quickly and decays slowly, so one lucky fast run
//! doesn't get a heavy pip under-provisioned next time.

use anyhow::{anyhow, bail};
use dashmap::DashMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

/// Entries start here and lose one per build in which they were not
/// refreshed.
pub const MAX_TIME_TO_LIVE: u8 = u8::MAX;

/// Encoded size of one `ProcessPipHistoricPerfData`.
pub const RECORD_SIZE: usize = 1 + 8 * 4 + 2;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PerfDataError {
    #[error("overflow merging {field}: old {old}, new {new}")]
    MergeOverflow {
        field: &'static str,
        old: u32,
        new: u32,
    },
    #[error("truncated perf record")]
    Truncated,
}

/// How far a pip got.  Only `Executed` runs carry meaningful measurements.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ExecutionLevel {
    Executed,
    Cached,
    UpToDate,
    Failed,
}

/// Telemetry of one completed process pip run.
#[derive(Debug, Clone)]
pub struct ProcessPipExecutionPerformance {
    pub execution_level: ExecutionLevel,
    /// Processor time of the process tree.
    pub processor_time: Duration,
    /// Time the process was suspended, e.g. under memory pressure.
    pub suspended_duration: Duration,
    /// Wall time of the whole pip step, including cache lookup,
    /// materialization and post-processing.
    pub run_duration: Duration,
    pub peak_working_set_mb: u32,
    pub average_working_set_mb: u32,
    pub peak_commit_size_mb: u32,
    pub average_commit_size_mb: u32,
    pub disk_io_mb: u32,
    pub processor_usage_percent: u16,
}

fn millis(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ProcessPipHistoricPerfData {
    pub time_to_live: u8,
    pub exe_duration_ms: u32,
    /// Running maximum of `exe_duration_ms`; never decays.
    pub max_exe_duration_ms: u32,
    pub run_duration_ms: u32,
    pub peak_working_set_mb: u32,
    pub average_working_set_mb: u32,
    pub peak_commit_size_mb: u32,
    pub average_commit_size_mb: u32,
    pub disk_io_mb: u32,
    pub processor_usage_percent: u16,
}

/// Fast rise, slow decay.
fn ema(field: &'static str, old: u32, new: u32) -> Result<u32, PerfDataError> {
    let overflow = || PerfDataError::MergeOverflow { field, old, new };
    if new >= old {
        Ok(old.checked_add(new).ok_or_else(overflow)? / 2)
    } else {
        Ok(old
            .checked_mul(9)
            .and_then(|o| o.checked_add(new))
            .ok_or_else(overflow)?
            / 10)
    }
}

impl ProcessPipHistoricPerfData {
    /// Snapshot of a completed run.  Panics unless the pip actually executed.
    pub fn from_execution(perf: &ProcessPipExecutionPerformance) -> Self {
        assert_eq!(
            perf.execution_level,
            ExecutionLevel::Executed,
            "historic perf data needs an executed pip"
        );
        let exe = perf
            .processor_time
            .saturating_sub(perf.suspended_duration);
        let exe_duration_ms = millis(exe).max(1);
        ProcessPipHistoricPerfData {
            time_to_live: MAX_TIME_TO_LIVE,
            exe_duration_ms,
            max_exe_duration_ms: exe_duration_ms,
            run_duration_ms: millis(perf.run_duration),
            peak_working_set_mb: perf.peak_working_set_mb,
            average_working_set_mb: perf.average_working_set_mb,
            peak_commit_size_mb: perf.peak_commit_size_mb,
            average_commit_size_mb: perf.average_commit_size_mb,
            disk_io_mb: perf.disk_io_mb,
            processor_usage_percent: perf.processor_usage_percent,
        }
    }

    /// Same metrics with time-to-live reset, for a pip that was current in
    /// this build but not re-measured.
    pub fn make_fresh(&self) -> Self {
        ProcessPipHistoricPerfData {
            time_to_live: MAX_TIME_TO_LIVE,
            ..*self
        }
    }

    /// Folds `new` into `self`, field by field.
    pub fn merge(&self, new: &Self) -> Result<Self, PerfDataError> {
        let percent = ema(
            "processor_usage_percent",
            self.processor_usage_percent as u32,
            new.processor_usage_percent as u32,
        )?;
        Ok(ProcessPipHistoricPerfData {
            time_to_live: MAX_TIME_TO_LIVE,
            exe_duration_ms: ema("exe_duration_ms", self.exe_duration_ms, new.exe_duration_ms)?,
            max_exe_duration_ms: self.max_exe_duration_ms.max(new.max_exe_duration_ms),
            run_duration_ms: ema("run_duration_ms", self.run_duration_ms, new.run_duration_ms)?,
            peak_working_set_mb: ema(
                "peak_working_set_mb",
                self.peak_working_set_mb,
                new.peak_working_set_mb,
            )?,
            average_working_set_mb: ema(
                "average_working_set_mb",
                self.average_working_set_mb,
                new.average_working_set_mb,
            )?,
            peak_commit_size_mb: ema(
                "peak_commit_size_mb",
                self.peak_commit_size_mb,
                new.peak_commit_size_mb,
            )?,
            average_commit_size_mb: ema(
                "average_commit_size_mb",
                self.average_commit_size_mb,
                new.average_commit_size_mb,
            )?,
            disk_io_mb: ema("disk_io_mb", self.disk_io_mb, new.disk_io_mb)?,
            // The average of two u16 values fits in a u16.
            processor_usage_percent: percent as u16,
        })
    }

    pub fn serialize(&self, w: &mut impl Write) -> std::io::Result<()> {
        let mut buf = [0u8; RECORD_SIZE];
        buf[0] = self.time_to_live;
        let fields = [
            self.exe_duration_ms,
            self.max_exe_duration_ms,
            self.run_duration_ms,
            self.peak_working_set_mb,
            self.average_working_set_mb,
            self.peak_commit_size_mb,
            self.average_commit_size_mb,
            self.disk_io_mb,
        ];
        for (i, f) in fields.iter().enumerate() {
            buf[1 + i * 4..5 + i * 4].copy_from_slice(&f.to_le_bytes());
        }
        buf[RECORD_SIZE - 2..].copy_from_slice(&self.processor_usage_percent.to_le_bytes());
        w.write_all(&buf)
    }

    /// Reads one record, aging it by one build.  The flag is false once the
    /// entry has expired; callers must drop expired entries.
    pub fn deserialize(r: &mut impl Read) -> Result<(Self, bool), PerfDataError> {
        let mut buf = [0u8; RECORD_SIZE];
        r.read_exact(&mut buf)
            .map_err(|_| PerfDataError::Truncated)?;
        let u32_at = |i: usize| {
            let start = 1 + i * 4;
            u32::from_le_bytes([buf[start], buf[start + 1], buf[start + 2], buf[start + 3]])
        };
        let time_to_live = buf[0].saturating_sub(1);
        let data = ProcessPipHistoricPerfData {
            time_to_live,
            exe_duration_ms: u32_at(0),
            max_exe_duration_ms: u32_at(1),
            run_duration_ms: u32_at(2),
            peak_working_set_mb: u32_at(3),
            average_working_set_mb: u32_at(4),
            peak_commit_size_mb: u32_at(5),
            average_commit_size_mb: u32_at(6),
            disk_io_mb: u32_at(7),
            processor_usage_percent: u16::from_le_bytes([
                buf[RECORD_SIZE - 2],
                buf[RECORD_SIZE - 1],
            ]),
        };
        Ok((data, time_to_live > 0))
    }
}

/// Dispatch priority for a pip: longer pips start first so they don't end
/// up alone at the tail of the build.  Unknown pips get the lowest priority.
pub fn expected_priority(data: Option<&ProcessPipHistoricPerfData>) -> u32 {
    match data {
        None => 0,
        Some(d) => d.run_duration_ms.max(d.exe_duration_ms),
    }
}

const MAGIC: &[u8; 4] = b"PPHD";
const VERSION: u32 = 1;

/// Historic data of all pips, keyed by semi-stable hash.
#[derive(Debug, Default)]
pub struct HistoricPerfDataTable {
    entries: DashMap<u64, ProcessPipHistoricPerfData>,
    changed: AtomicBool,
}

impl HistoricPerfDataTable {
    pub fn new() -> Self {
        HistoricPerfDataTable::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, semi_stable_hash: u64) -> Option<ProcessPipHistoricPerfData> {
        self.entries.get(&semi_stable_hash).map(|e| *e)
    }

    /// Records a new measurement, merging with what was there.  On merge
    /// failure the existing entry is left untouched.
    pub fn add_or_update(
        &self,
        semi_stable_hash: u64,
        data: ProcessPipHistoricPerfData,
    ) -> Result<ProcessPipHistoricPerfData, PerfDataError> {
        let merged = match self.entries.entry(semi_stable_hash) {
            dashmap::mapref::entry::Entry::Vacant(v) => *v.insert(data),
            dashmap::mapref::entry::Entry::Occupied(mut o) => {
                let merged = o.get().merge(&data)?;
                o.insert(merged);
                merged
            }
        };
        self.changed.store(true, Ordering::Relaxed);
        Ok(merged)
    }

    /// Marks an entry current without new measurements.  Returns false if
    /// there is no entry.
    pub fn refresh(&self, semi_stable_hash: u64) -> bool {
        match self.entries.get_mut(&semi_stable_hash) {
            None => false,
            Some(mut e) => {
                if e.time_to_live != MAX_TIME_TO_LIVE {
                    let fresh = e.make_fresh();
                    *e = fresh;
                    self.changed.store(true, Ordering::Relaxed);
                }
                true
            }
        }
    }

    /// All entries, ordered by hash.
    pub fn entries(&self) -> Vec<(u64, ProcessPipHistoricPerfData)> {
        let mut all: Vec<_> = self.entries.iter().map(|e| (*e.key(), *e.value())).collect();
        all.sort_unstable_by_key(|&(hash, _)| hash);
        all
    }

    /// Loads a table, aging every entry by one build.  A missing file is an
    /// empty table.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let f = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HistoricPerfDataTable::new())
            }
            Err(err) => bail!("open {}: {}", path, err),
        };
        let mut r = BufReader::new(f);
        let mut header = [0u8; 12];
        r.read_exact(&mut header)
            .map_err(|err| anyhow!("read {}: {}", path, err))?;
        if &header[..4] != MAGIC {
            bail!("{}: not a historic perf data file", path);
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != VERSION {
            bail!("{}: unsupported version {}", path, version);
        }
        let count = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);

        let table = HistoricPerfDataTable::new();
        let mut expired = 0;
        for i in 0..count {
            let mut hash = [0u8; 8];
            r.read_exact(&mut hash)
                .map_err(|_| anyhow!("{}: entry {}: {}", path, i, PerfDataError::Truncated))?;
            let (data, alive) = ProcessPipHistoricPerfData::deserialize(&mut r)
                .map_err(|err| anyhow!("{}: entry {}: {}", path, i, err))?;
            if alive {
                table.entries.insert(u64::from_le_bytes(hash), data);
            } else {
                expired += 1;
            }
        }
        // Aging alone is a change worth saving.
        table.changed.store(count > 0, Ordering::Relaxed);
        info!(path, loaded = table.len(), expired, "loaded historic perf data");
        Ok(table)
    }

    /// Writes the table if anything changed since load.  Writes to a
    /// temporary file first so a crash never leaves a torn table behind.
    pub fn save(&self, path: &str) -> anyhow::Result<bool> {
        if !self.changed.load(Ordering::Relaxed) {
            return Ok(false);
        }
        let tmp = format!("{}.tmp", path);
        let write = || -> std::io::Result<()> {
            let mut w = BufWriter::new(std::fs::File::create(&tmp)?);
            let entries = self.entries();
            w.write_all(MAGIC)?;
            w.write_all(&VERSION.to_le_bytes())?;
            w.write_all(&(entries.len() as u32).to_le_bytes())?;
            for (hash, data) in &entries {
                w.write_all(&hash.to_le_bytes())?;
                data.serialize(&mut w)?;
            }
            w.flush()
        };
        write().map_err(|err| anyhow!("write {}: {}", tmp, err))?;
        std::fs::rename(&tmp, path).map_err(|err| anyhow!("rename {}: {}", tmp, err))?;
        self.changed.store(false, Ordering::Relaxed);
        info!(path, entries = self.len(), "saved historic perf data");
        Ok(true)
    }
}
