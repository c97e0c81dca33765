use std::{collections::HashMap, process::Command};

use tracing::{debug, warn};

use crate::error::HarnessError;

/// OS process identifier.
pub type Pid = u32;

/// Counter name for resident memory.
pub const RSS: &str = "RSS";
/// Counter name for private, writeable memory.
pub const PRIVATE_BYTES: &str = "Private Bytes";

/// The fixed set of metrics the samplers know how to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    ResidentSize,
    PrivateBytes,
}

impl CounterKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            RSS => Some(CounterKind::ResidentSize),
            PRIVATE_BYTES => Some(CounterKind::PrivateBytes),
            _ => None,
        }
    }
}

/// A source of process metrics. One implementation per supported OS,
/// selected once at startup by [`platform_sampler`]. Values are always in
/// bytes; a sampler never substitutes a default on failure.
pub trait ProcessSampler: Send {
    fn sample(&self, pid: Pid, counter: CounterKind) -> Result<u64, HarnessError>;
}

/// Pick the sampler implementation for the host platform.
pub fn platform_sampler() -> Result<Box<dyn ProcessSampler>, HarnessError> {
    if cfg!(target_os = "macos") {
        Ok(Box::new(PsSampler::macos()))
    } else if cfg!(target_os = "linux") {
        Ok(Box::new(PsSampler::linux()))
    } else {
        Err(HarnessError::process_query(
            "no process sampler available for this platform",
        ))
    }
}

/// Sampler backed by a one-shot `ps` query per call.
pub struct PsSampler {
    /// Column name for virtual size; `ps` spells it differently per OS.
    vsize_column: &'static str,
}

impl PsSampler {
    pub fn macos() -> Self {
        Self {
            vsize_column: "vsize",
        }
    }

    pub fn linux() -> Self {
        Self { vsize_column: "vsz" }
    }

    fn query(&self, pid: Pid) -> Result<ProcessData, HarnessError> {
        let columns = format!("pid,{},rss", self.vsize_column);
        let raw = run_ps(&["-o", &columns, "-p", &pid.to_string()])?;
        parse_process_data(pid, &raw)
    }
}

impl ProcessSampler for PsSampler {
    fn sample(&self, pid: Pid, counter: CounterKind) -> Result<u64, HarnessError> {
        let data = self.query(pid)?;
        Ok(counter_from_data(counter, &data))
    }
}

/// One parsed `pid vsz rss` row, in the kilobyte units `ps` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessData {
    pub vsize_kb: u64,
    pub rss_kb: u64,
}

/// Normalize a parsed row to bytes for the requested counter.
pub fn counter_from_data(counter: CounterKind, data: &ProcessData) -> u64 {
    match counter {
        CounterKind::ResidentSize => data.rss_kb * 1024,
        CounterKind::PrivateBytes => data.vsize_kb * 1024,
    }
}

/// Parse tabular `ps` output: a header line followed by one data line whose
/// first token must be the requested pid.
pub fn parse_process_data(pid: Pid, raw: &str) -> Result<ProcessData, HarnessError> {
    let mut lines = raw.lines().filter(|line| !line.trim().is_empty());
    if lines.next().is_none() {
        return Err(HarnessError::process_query(
            "process query returned no output",
        ));
    }
    let data = lines.next().ok_or_else(|| {
        HarnessError::process_query(format!("no process data line for pid {pid}"))
    })?;

    let fields: Vec<&str> = data.split_whitespace().collect();
    if fields.len() < 3 {
        return Err(HarnessError::process_query(format!(
            "malformed process data line: {data:?}"
        )));
    }
    if fields[0] != pid.to_string() {
        return Err(HarnessError::process_query(format!(
            "expected pid {pid} in query output, found {}",
            fields[0]
        )));
    }
    let vsize_kb = fields[1].parse::<u64>().map_err(|err| {
        HarnessError::process_query(format!("unparsable vsize {:?}: {err}", fields[1]))
    })?;
    let rss_kb = fields[2].parse::<u64>().map_err(|err| {
        HarnessError::process_query(format!("unparsable rss {:?}: {err}", fields[2]))
    })?;
    Ok(ProcessData { vsize_kb, rss_kb })
}

/// All pids whose command name matches `process`, in the order `ps` reports
/// them.
pub fn pids_by_name(process: &str) -> Result<Vec<Pid>, HarnessError> {
    let raw = run_ps(&["-A", "-o", "pid,comm"])?;
    let mut pids = Vec::new();
    for line in raw.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let (Some(pid), Some(comm)) = (fields.next(), fields.next()) else {
            continue;
        };
        let name = comm.rsplit('/').next().unwrap_or(comm);
        if name.contains(process) {
            if let Ok(pid) = pid.parse::<Pid>() {
                pids.push(pid);
            }
        }
    }
    Ok(pids)
}

/// Resolve the process of interest for `process`. When several processes
/// share the name, the most recently created one (last in the pid list)
/// wins. This is a tie-break policy, not a correctness guarantee.
pub fn newest_pid_by_name(process: &str) -> Result<Pid, HarnessError> {
    let pids = pids_by_name(process)?;
    debug!(process, candidates = ?pids, "resolved pid candidates");
    pids.last().copied().ok_or_else(|| {
        HarnessError::process_query(format!("no running process named {process:?}"))
    })
}

fn run_ps(args: &[&str]) -> Result<String, HarnessError> {
    let output = Command::new("ps").args(args).output().map_err(|err| {
        HarnessError::process_query(format!("failed to execute `ps {}`: {err}", args.join(" ")))
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(HarnessError::process_query(format!(
            "`ps {}` exited with {}: {}",
            args.join(" "),
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// A named set of counters bound to one process identity. Each `get_value`
/// call samples fresh (pull model); only the most recent value per name is
/// retained here. History, if needed, belongs to the caller.
pub struct CounterRegistry {
    pid: Pid,
    sampler: Box<dyn ProcessSampler>,
    counters: Vec<(String, CounterKind)>,
    last_values: HashMap<String, u64>,
}

impl CounterRegistry {
    /// Bind `names` against `pid`. Names with no matching sampler are
    /// dropped with a warning; an empty or fully-unknown list is valid.
    pub fn new(sampler: Box<dyn ProcessSampler>, pid: Pid, names: &[String]) -> Self {
        let mut counters = Vec::new();
        for name in names {
            match CounterKind::from_name(name) {
                Some(kind) => counters.push((name.clone(), kind)),
                None => warn!(counter = %name, "dropping unknown counter name"),
            }
        }
        Self {
            pid,
            sampler,
            counters,
            last_values: HashMap::new(),
        }
    }

    /// Names that survived registration, in registration order.
    pub fn active_counters(&self) -> Vec<String> {
        self.counters.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Sample `name` now and return the fresh value, recording it as the
    /// latest. Whether a failure aborts the enclosing test is the caller's
    /// decision.
    pub fn get_value(&mut self, name: &str) -> Result<u64, HarnessError> {
        let kind = self
            .counters
            .iter()
            .find(|(registered, _)| registered == name)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| HarnessError::counter(format!("counter {name:?} is not registered")))?;
        let value = self
            .sampler
            .sample(self.pid, kind)
            .map_err(|err| HarnessError::counter(format!("{name}: {err}")))?;
        self.last_values.insert(name.to_string(), value);
        Ok(value)
    }

    /// Most recent successfully sampled value for `name`, if any.
    pub fn last_value(&self, name: &str) -> Option<u64> {
        self.last_values.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSampler {
        data: ProcessData,
    }

    impl ProcessSampler for FixedSampler {
        fn sample(&self, _pid: Pid, counter: CounterKind) -> Result<u64, HarnessError> {
            Ok(counter_from_data(counter, &self.data))
        }
    }

    struct FailingSampler;

    impl ProcessSampler for FailingSampler {
        fn sample(&self, pid: Pid, _counter: CounterKind) -> Result<u64, HarnessError> {
            Err(HarnessError::process_query(format!(
                "no such process {pid}"
            )))
        }
    }

    #[test]
    fn parse_accepts_header_plus_matching_data_line() {
        let raw = "  PID      VSZ    RSS\n 1234    76000    920\n";
        let data = parse_process_data(1234, raw).expect("parses");
        assert_eq!(data.vsize_kb, 76000);
        assert_eq!(data.rss_kb, 920);
    }

    #[test]
    fn parse_rejects_pid_mismatch() {
        let raw = "  PID      VSZ    RSS\n 9999    76000    920\n";
        let err = parse_process_data(1234, raw).expect_err("pid mismatch");
        assert!(matches!(err, HarnessError::ProcessQuery(_)));
        assert!(err.to_string().contains("9999"));
    }

    #[test]
    fn parse_rejects_missing_data_line() {
        let err = parse_process_data(1234, "  PID      VSZ    RSS\n").expect_err("no data");
        assert!(matches!(err, HarnessError::ProcessQuery(_)));
    }

    #[test]
    fn counters_are_normalized_to_bytes() {
        let data = ProcessData {
            vsize_kb: 76000,
            rss_kb: 920,
        };
        assert_eq!(counter_from_data(CounterKind::ResidentSize, &data), 920 * 1024);
        assert_eq!(
            counter_from_data(CounterKind::PrivateBytes, &data),
            76000 * 1024
        );
    }

    #[test]
    fn unknown_counter_names_are_dropped_silently() {
        let sampler = Box::new(FixedSampler {
            data: ProcessData {
                vsize_kb: 1,
                rss_kb: 1,
            },
        });
        let registry =
            CounterRegistry::new(sampler, 1234, &["RSS".to_string(), "Bogus".to_string()]);
        assert_eq!(registry.active_counters(), vec!["RSS".to_string()]);
    }

    #[test]
    fn get_value_samples_fresh_and_records_latest() {
        let sampler = Box::new(FixedSampler {
            data: ProcessData {
                vsize_kb: 76000,
                rss_kb: 920,
            },
        });
        let mut registry = CounterRegistry::new(
            sampler,
            1234,
            &["RSS".to_string(), "Private Bytes".to_string()],
        );
        assert_eq!(registry.last_value("RSS"), None);
        assert_eq!(registry.get_value("RSS").expect("sampled"), 920 * 1024);
        assert_eq!(
            registry.get_value("Private Bytes").expect("sampled"),
            76000 * 1024
        );
        assert_eq!(registry.last_value("RSS"), Some(920 * 1024));
    }

    #[test]
    fn unregistered_counter_is_a_counter_error() {
        let sampler = Box::new(FixedSampler {
            data: ProcessData {
                vsize_kb: 1,
                rss_kb: 1,
            },
        });
        let mut registry = CounterRegistry::new(sampler, 1234, &[]);
        let err = registry.get_value("RSS").expect_err("not registered");
        assert!(matches!(err, HarnessError::Counter(_)));
    }

    #[test]
    fn sampler_failure_surfaces_as_counter_error() {
        let mut registry =
            CounterRegistry::new(Box::new(FailingSampler), 1234, &["RSS".to_string()]);
        let err = registry.get_value("RSS").expect_err("sampler fails");
        assert!(matches!(err, HarnessError::Counter(_)));
        assert!(registry.last_value("RSS").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn dead_pid_query_fails_explicitly() {
        let sampler = PsSampler::linux();
        // Pid values this large are not handed out on test systems.
        let err = sampler
            .sample(Pid::MAX - 1, CounterKind::ResidentSize)
            .expect_err("dead pid");
        assert!(matches!(err, HarnessError::ProcessQuery(_)));
    }
}
