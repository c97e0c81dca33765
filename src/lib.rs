pub mod cli;
pub mod config;
pub mod counters;
pub mod error;
pub mod launch;
pub mod results;
pub mod server;
pub mod trace;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, info_span, warn};

use crate::config::{HarnessSettings, TestSpec};
use crate::error::HarnessError;
use crate::results::{CycleResult, Filter, RunReport, TestResult};
use crate::server::ContentServer;
use crate::trace::TraceController;

/// Orchestrates one benchmark run: sequences tests against a single browser
/// configuration, owns the content server and trace session, and guarantees
/// teardown on every exit path.
pub struct Harness {
    settings: HarnessSettings,
    root: PathBuf,
    trace: TraceController,
    server: Option<ContentServer>,
}

/// A test validated and resolved against the run root, ready to launch.
#[derive(Debug, Clone)]
struct PreparedTest {
    name: String,
    url: String,
    cycles: u32,
    counters: Vec<String>,
    filters: Vec<Filter>,
    trace: bool,
}

impl Harness {
    pub fn new(settings: HarnessSettings, root: PathBuf) -> Self {
        Self {
            settings,
            root,
            trace: TraceController::new(),
            server: None,
        }
    }

    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    /// True while the content server owned by this run is up.
    pub fn server_running(&self) -> bool {
        self.server
            .as_ref()
            .map(ContentServer::is_running)
            .unwrap_or(false)
    }

    /// Run every configured test in sequence and deliver one report.
    ///
    /// Tests run strictly one after another; the first unrecovered per-test
    /// failure stops the content server and propagates without attempting
    /// the remaining tests.
    pub fn run(&mut self) -> Result<RunReport> {
        if self.settings.browser.remote {
            return Err(HarnessError::validation(
                "remote device runs are not supported by this harness",
            )
            .into());
        }

        // Every test is validated before any process is launched, so an
        // invalid spec has no partial side effects.
        let prepared = self.prepare_tests()?;
        let channels = results::check_output_channels(&self.settings.output.results_urls)?;

        let root = self.root.clone();
        self.settings.browser.normalize(&root);
        match self.settings.browser.resolve_metadata() {
            Ok(()) => {}
            Err(err) if self.settings.browser.develop => {
                warn!(error = %err, "browser metadata unresolved; continuing with placeholders");
            }
            Err(err) => return Err(err.into()),
        }

        self.start_server()?;

        let outcome = self.run_prepared(&prepared);
        // Server teardown runs whether the loop finished or aborted.
        self.stop_server();
        let report = outcome?;

        results::deliver(&channels, &report)?;
        Ok(report)
    }

    fn prepare_tests(&self) -> Result<Vec<PreparedTest>> {
        if self.settings.tests.is_empty() {
            warn!("no tests configured for this run");
        }
        let mut prepared = Vec::new();
        for test in &self.settings.tests {
            prepared.push(self.prepare_test(test)?);
        }
        Ok(prepared)
    }

    fn prepare_test(&self, test: &TestSpec) -> Result<PreparedTest> {
        let mut options = test.options.clone();
        options.fill_from(&self.settings.basetest);

        // Resolve path-valued fields against the run root.
        if let Some(profile) = options.profile_path.as_ref().filter(|value| !value.is_empty()) {
            options.profile_path = Some(config::interpolate(&self.root, profile));
        }
        if let Some(manifest) = options.tpmanifest.as_ref().filter(|value| !value.is_empty()) {
            options.tpmanifest = Some(launch::normalize_manifest(&self.root, manifest));
        }

        launch::validate_options(&options)
            .with_context(|| format!("invalid definition for test {}", test.name))?;

        let url = match options.url.as_deref().filter(|value| !value.is_empty()) {
            Some(explicit) => config::interpolate(&self.root, explicit),
            None => launch::build_command_line(&options)
                .with_context(|| format!("invalid definition for test {}", test.name))?,
        };

        let filters = match options.filters.as_ref().filter(|specs| !specs.is_empty()) {
            Some(specs) => results::parse_filters(specs)
                .with_context(|| format!("invalid filters for test {}", test.name))?,
            None => results::default_filters(),
        };

        Ok(PreparedTest {
            name: test.name.clone(),
            url,
            cycles: options.tpcycles.unwrap_or(0),
            counters: options.counters.clone().unwrap_or_default(),
            filters,
            trace: options.trace == Some(true),
        })
    }

    /// Start the content server once per run, before the first test, when
    /// operating in local-serving mode. A webserver spec without a port is
    /// a warning, not an error.
    fn start_server(&mut self) -> Result<()> {
        if !self.settings.browser.develop {
            return Ok(());
        }
        let Some(spec) = server::parse_webserver_spec(&self.settings.browser.webserver)? else {
            warn!("unable to start web server without a webserver configured");
            return Ok(());
        };
        let Some(port) = spec.port else {
            warn!("unable to start web server without custom port configured");
            return Ok(());
        };
        let host = if spec.host.is_empty() {
            "localhost".to_string()
        } else {
            spec.host
        };
        let mut server = ContentServer::new(host, port, self.root.clone());
        server.start()?;
        self.server = Some(server);
        Ok(())
    }

    fn stop_server(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.stop();
        }
    }

    fn run_prepared(&mut self, prepared: &[PreparedTest]) -> Result<RunReport> {
        let mut report = RunReport::new(self.settings.title.clone(), &self.settings.browser);
        info!(
            title = %self.settings.title,
            tests = prepared.len(),
            run = %report.run_id,
            "run started"
        );
        for test in prepared {
            let span = info_span!("harness.test", test = %test.name);
            let _guard = span.enter();
            info!(cycles = test.cycles, "test started");
            let result = self.run_test(test)?;
            info!(summary = ?result.summary, "test completed");
            report.add(result);
        }
        Ok(report)
    }

    fn run_test(&mut self, test: &PreparedTest) -> Result<TestResult> {
        if test.trace {
            self.trace
                .start(&self.settings.trace)
                .with_context(|| format!("failed to start trace for test {}", test.name))?;
        }
        let outcome = self.run_cycles(test);
        // Trace teardown must run on success and failure alike; stopping an
        // idle controller is a no-op.
        if let Err(err) = self.trace.stop() {
            warn!(error = %err, "failed to stop trace session");
        }
        outcome
    }

    fn run_cycles(&self, test: &PreparedTest) -> Result<TestResult> {
        let command = launch::command_for_test(&self.settings.browser, &test.url)?;
        let timeout = Duration::from_secs(self.settings.cycle_timeout_secs);
        let mut cycles = Vec::new();
        for cycle in 1..=test.cycles {
            let outcome = launch::run_cycle(
                &command,
                &self.settings.browser.process,
                &test.counters,
                timeout,
                launch::COUNTER_POLL_INTERVAL,
            )
            .with_context(|| format!("test {} failed in cycle {cycle}", test.name))?;
            cycles.push(CycleResult::from_outcome(cycle, outcome));
        }
        Ok(TestResult::from_cycles(test.name.clone(), &test.filters, cycles))
    }
}
