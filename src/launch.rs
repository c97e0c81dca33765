use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Command,
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::config::{self, BrowserConfig, OutputFormat, TestOptions};
use crate::counters::{self, CounterRegistry};
use crate::error::HarnessError;

/// Poll cadence for counter sampling while the browser runs.
pub const COUNTER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Materialised command specification ready to be spawned or logged.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    binary: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(binary: PathBuf, args: Vec<String>, env: Vec<(String, String)>) -> Self {
        Self { binary, args, env }
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(&self.args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }

    pub fn describe(&self) -> String {
        let args = self.args.join(" ");
        format!("{} {}", self.binary.display(), args)
    }
}

/// Locate the browser executable: an existing path wins, a bare name is
/// resolved on PATH.
pub fn resolve_browser_binary(browser: &BrowserConfig) -> Result<PathBuf, HarnessError> {
    let path = &browser.browser_path;
    if path.as_os_str().is_empty() {
        return Err(HarnessError::launch("browser_path is not configured"));
    }
    if path.exists() {
        return Ok(path.clone());
    }
    if path.components().count() == 1 {
        if let Ok(resolved) = which::which(path) {
            return Ok(resolved);
        }
    }
    Err(HarnessError::launch(format!(
        "browser binary not found at {}",
        path.display()
    )))
}

/// Build the launch command for one test: the browser binary plus the
/// effective URL tokens.
pub fn command_for_test(browser: &BrowserConfig, url: &str) -> Result<CommandSpec, HarnessError> {
    let binary = resolve_browser_binary(browser)?;
    let args: Vec<String> = url.split_whitespace().map(str::to_string).collect();
    let env = vec![
        ("NO_EM_RESTART".to_string(), "1".to_string()),
        ("MOZ_CRASHREPORTER_NO_REPORT".to_string(), "1".to_string()),
    ];
    Ok(CommandSpec::new(binary, args, env))
}

/// Interpolate a manifest path against the root and normalize it to the
/// `file:/` URL form the pageloader expects.
pub fn normalize_manifest(root: &Path, manifest: &str) -> String {
    let interpolated = config::interpolate(root, manifest);
    format!("file:/{}", interpolated.trim_start_matches('/'))
}

/// Sanity-check the pageloader options. Violating any constraint fails
/// before anything is launched; manifest existence on disk is deliberately
/// not checked here.
pub fn validate_options(options: &TestOptions) -> Result<(), HarnessError> {
    let cycles = options.tpcycles.unwrap_or(0);
    if !(1..=1000).contains(&cycles) {
        return Err(HarnessError::validation(
            "pageloader cycles must be int 1 to 1,000",
        ));
    }
    let format = options.tpformat.as_deref().unwrap_or("");
    if OutputFormat::parse(format).is_none() {
        let known: Vec<&str> = OutputFormat::ALL.iter().map(|f| f.as_str()).collect();
        return Err(HarnessError::validation(format!(
            "pageloader format not recognized. valid formats are {}",
            known.join(", ")
        )));
    }
    if let Some(delay) = options.tpdelay {
        if !(1..=10000).contains(&delay) {
            return Err(HarnessError::validation(
                "pageloader delay must be int 1 to 10,000",
            ));
        }
    }
    if options.tpmanifest.as_deref().unwrap_or("").is_empty() {
        return Err(HarnessError::validation("tpmanifest not found in test"));
    }
    Ok(())
}

/// Build the pageloader command line from validated test options.
pub fn build_command_line(options: &TestOptions) -> Result<String, HarnessError> {
    validate_options(options)?;
    let cycles = options.tpcycles.unwrap_or(0);
    let format = options.tpformat.as_deref().unwrap_or("");
    let manifest = options.tpmanifest.as_deref().unwrap_or("");

    let mut url = vec!["-tp".to_string(), manifest.to_string()];
    let bool_options = [
        ("tpchrome", options.tpchrome),
        ("tpmozafterpaint", options.tpmozafterpaint),
        ("tpnoisy", options.tpnoisy),
        ("rss", options.rss),
        ("tprender", options.tprender),
    ];
    for (key, value) in bool_options {
        if value == Some(true) {
            url.push(format!("-{key}"));
        }
    }
    url.push("-tpformat".to_string());
    url.push(format.to_string());
    url.push("-tpcycles".to_string());
    url.push(cycles.to_string());
    let valued_options = [
        ("tppagecycles", options.tppagecycles),
        ("tpdelay", options.tpdelay),
    ];
    for (key, value) in valued_options {
        if let Some(value) = value {
            url.push(format!("-{key}"));
            url.push(value.to_string());
        }
    }
    Ok(url.join(" "))
}

/// Raw samples collected from one browser cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleOutcome {
    pub duration_ms: u64,
    /// Last observed value per counter; a counter that never produced a
    /// value is absent.
    pub counters: HashMap<String, u64>,
}

/// Launch the browser once and monitor it to completion, sampling the
/// requested counters while it runs. The process identity is resolved fresh
/// from `process_name` after the spawn; the most recently created process
/// with that name is the one sampled.
pub fn run_cycle(
    command: &CommandSpec,
    process_name: &str,
    counter_names: &[String],
    timeout: Duration,
    poll_interval: Duration,
) -> Result<CycleOutcome, HarnessError> {
    debug!(command = %command.describe(), "launching browser cycle");
    let started = Instant::now();
    let mut child = command.to_command().spawn().map_err(|err| {
        HarnessError::launch(format!(
            "failed to spawn {}: {err}",
            command.binary().display()
        ))
    })?;

    let mut registry: Option<CounterRegistry> = None;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    return Err(HarnessError::launch(format!(
                        "{} exited with {status}",
                        command.binary().display()
                    )));
                }
                break;
            }
            Ok(None) => {}
            Err(err) => {
                return Err(HarnessError::launch(format!(
                    "failed to monitor browser process: {err}"
                )));
            }
        }

        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(HarnessError::launch(format!(
                "cycle exceeded timeout of {}s",
                timeout.as_secs()
            )));
        }

        if !counter_names.is_empty() {
            if registry.is_none() {
                // The browser may still be forking; resolution retries on
                // the next poll.
                match counters::newest_pid_by_name(process_name) {
                    Ok(pid) => {
                        let sampler = counters::platform_sampler()?;
                        registry = Some(CounterRegistry::new(sampler, pid, counter_names));
                    }
                    Err(err) => debug!(error = %err, "browser pid not resolvable yet"),
                }
            }
            if let Some(registry) = registry.as_mut() {
                for name in registry.active_counters() {
                    if let Err(err) = registry.get_value(&name) {
                        warn!(counter = %name, error = %err, "counter sample failed");
                    }
                }
            }
        }

        thread::sleep(poll_interval);
    }

    let mut counter_values = HashMap::new();
    if let Some(registry) = registry {
        for name in registry.active_counters() {
            if let Some(value) = registry.last_value(&name) {
                counter_values.insert(name, value);
            }
        }
    }
    Ok(CycleOutcome {
        duration_ms: started.elapsed().as_millis() as u64,
        counters: counter_values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn valid_options() -> TestOptions {
        TestOptions {
            tpmanifest: Some("file:/srv/bench/tp5.manifest".into()),
            tpcycles: Some(5),
            tpformat: Some("tinderbox".into()),
            ..TestOptions::default()
        }
    }

    #[test]
    fn cycle_count_outside_range_is_rejected() {
        for cycles in [0, 1001] {
            let mut options = valid_options();
            options.tpcycles = Some(cycles);
            let err = build_command_line(&options).expect_err("out of range");
            assert!(matches!(err, HarnessError::Validation(_)));
        }
        let mut options = valid_options();
        options.tpcycles = Some(1000);
        build_command_line(&options).expect("upper bound is inclusive");
    }

    #[test]
    fn unknown_format_is_rejected() {
        let mut options = valid_options();
        options.tpformat = Some("xml".into());
        let err = build_command_line(&options).expect_err("bad format");
        assert!(err.to_string().contains("valid formats"));
    }

    #[test]
    fn delay_outside_range_is_rejected() {
        for delay in [0, 10001] {
            let mut options = valid_options();
            options.tpdelay = Some(delay);
            let err = build_command_line(&options).expect_err("bad delay");
            assert!(matches!(err, HarnessError::Validation(_)));
        }
    }

    #[test]
    fn missing_manifest_is_rejected() {
        let mut options = valid_options();
        options.tpmanifest = Some(String::new());
        let err = build_command_line(&options).expect_err("no manifest");
        assert!(err.to_string().contains("tpmanifest"));
    }

    #[test]
    fn command_line_assembles_flags_in_order() {
        let mut options = valid_options();
        options.tpchrome = Some(true);
        options.rss = Some(true);
        options.tpdelay = Some(200);
        let url = build_command_line(&options).expect("builds");
        assert_eq!(
            url,
            "-tp file:/srv/bench/tp5.manifest -tpchrome -rss \
             -tpformat tinderbox -tpcycles 5 -tpdelay 200"
        );
    }

    #[test]
    fn manifest_normalizes_to_file_url() {
        let root = Path::new("/srv/bench");
        assert_eq!(
            normalize_manifest(root, "${pacer}/tp5.manifest"),
            "file:/srv/bench/tp5.manifest"
        );
    }

    #[test]
    fn missing_browser_binary_is_a_launch_error() {
        let browser = BrowserConfig {
            browser_path: PathBuf::from("/nonexistent/browser"),
            ..BrowserConfig::default()
        };
        let err = resolve_browser_binary(&browser).expect_err("absent binary");
        assert!(matches!(err, HarnessError::Launch(_)));
    }

    #[test]
    fn existing_browser_path_resolves_to_itself() {
        let dir = tempdir().expect("temp directory");
        let path = dir.path().join("browser");
        std::fs::write(&path, "").expect("touch binary");
        let browser = BrowserConfig {
            browser_path: path.clone(),
            ..BrowserConfig::default()
        };
        assert_eq!(resolve_browser_binary(&browser).expect("resolves"), path);
    }

    #[cfg(unix)]
    #[test]
    fn bare_name_resolves_on_path() {
        let browser = BrowserConfig {
            browser_path: PathBuf::from("sh"),
            ..BrowserConfig::default()
        };
        let resolved = resolve_browser_binary(&browser).expect("sh on PATH");
        assert!(resolved.ends_with("sh"));
    }

    #[cfg(unix)]
    #[test]
    fn successful_cycle_reports_duration() {
        let command = CommandSpec::new(
            PathBuf::from("/bin/sh"),
            vec!["-c".into(), "exit 0".into()],
            vec![],
        );
        let outcome = run_cycle(
            &command,
            "sh",
            &[],
            Duration::from_secs(10),
            Duration::from_millis(10),
        )
        .expect("cycle succeeds");
        assert!(outcome.counters.is_empty());
        assert!(outcome.duration_ms < 10_000);
    }

    #[cfg(unix)]
    #[test]
    fn abnormal_exit_is_a_launch_error() {
        let command = CommandSpec::new(
            PathBuf::from("/bin/sh"),
            vec!["-c".into(), "exit 3".into()],
            vec![],
        );
        let err = run_cycle(
            &command,
            "sh",
            &[],
            Duration::from_secs(10),
            Duration::from_millis(10),
        )
        .expect_err("nonzero exit");
        assert!(matches!(err, HarnessError::Launch(_)));
        assert!(err.to_string().contains("exited with"));
    }

    #[cfg(unix)]
    #[test]
    fn hung_cycle_is_killed_at_the_timeout() {
        let command = CommandSpec::new(
            PathBuf::from("/bin/sh"),
            vec!["-c".into(), "sleep 30".into()],
            vec![],
        );
        let started = Instant::now();
        let err = run_cycle(
            &command,
            "sh",
            &[],
            Duration::from_millis(200),
            Duration::from_millis(10),
        )
        .expect_err("times out");
        assert!(err.to_string().contains("timeout"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
