use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::HarnessError;
use crate::trace::TraceConfig;

/// Token expanded to the harness root inside configured paths.
pub const ROOT_TOKEN: &str = "${pacer}";

const APPLICATION_INI: &str = "application.ini";

/// Output formats understood by the pageloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Js,
    JsFull,
    Text,
    Tinderbox,
}

impl OutputFormat {
    /// Every format the pageloader accepts, in the order used for messages.
    pub const ALL: [OutputFormat; 4] = [
        OutputFormat::Js,
        OutputFormat::JsFull,
        OutputFormat::Text,
        OutputFormat::Tinderbox,
    ];

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "js" => Some(OutputFormat::Js),
            "jsfull" => Some(OutputFormat::JsFull),
            "text" => Some(OutputFormat::Text),
            "tinderbox" => Some(OutputFormat::Tinderbox),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Js => "js",
            OutputFormat::JsFull => "jsfull",
            OutputFormat::Text => "text",
            OutputFormat::Tinderbox => "tinderbox",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity and launch parameters for the browser under test. Mutable while
/// the run is being set up; read-only once tests start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Path to the browser executable, or a bare name resolved on PATH.
    pub browser_path: PathBuf,
    /// Process name sampled for counters; derived from the path when empty.
    #[serde(default)]
    pub process: String,
    #[serde(default)]
    pub buildid: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub sourcestamp: String,
    #[serde(default)]
    pub browser_name: String,
    #[serde(default)]
    pub browser_version: String,
    /// Extension paths made available to the browser profile.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Named directory substitutions applied to test content.
    #[serde(default)]
    pub dirs: BTreeMap<String, String>,
    /// Remote device runs are not supported by this harness.
    #[serde(default)]
    pub remote: bool,
    /// Webserver spec (`host:port`, optionally scheme-prefixed) used as the
    /// content origin in local-serving mode.
    #[serde(default)]
    pub webserver: String,
    /// Tolerant mode: metadata failures downgrade to placeholders and a
    /// local content server is started.
    #[serde(default)]
    pub develop: bool,
}

impl BrowserConfig {
    /// Derive unset fields and expand the root token in configured paths.
    pub fn normalize(&mut self, root: &Path) {
        if self.process.is_empty() {
            if let Some(name) = self.browser_path.file_name().and_then(|value| value.to_str()) {
                self.process = name.to_string();
            }
        }
        self.extensions = self
            .extensions
            .iter()
            .map(|value| interpolate(root, value))
            .collect();
        self.dirs = self
            .dirs
            .iter()
            .map(|(key, value)| (key.clone(), interpolate(root, value)))
            .collect();
    }

    /// Pull buildid, repository, sourcestamp, name and version from the
    /// `application.ini` next to the executable, filling only unset fields.
    /// Repository and sourcestamp that remain unresolved become `"NULL"`
    /// whether or not the file could be read.
    pub fn resolve_metadata(&mut self) -> Result<(), HarnessError> {
        let outcome = self.fill_from_application_ini();
        if self.repository.is_empty() {
            self.repository = "NULL".into();
        }
        if self.sourcestamp.is_empty() {
            self.sourcestamp = "NULL".into();
        }
        outcome
    }

    fn fill_from_application_ini(&mut self) -> Result<(), HarnessError> {
        let dir = self.browser_path.parent().ok_or_else(|| {
            HarnessError::metadata(format!(
                "browser path {} has no parent directory",
                self.browser_path.display()
            ))
        })?;
        let path = dir.join(APPLICATION_INI);
        if !path.is_file() {
            return Err(HarnessError::metadata(format!(
                "{} does not exist",
                path.display()
            )));
        }
        let raw = fs::read_to_string(&path).map_err(|err| {
            HarnessError::metadata(format!("unable to read {}: {err}", path.display()))
        })?;
        let app = parse_ini_section(&raw, "App");

        if self.buildid.is_empty() {
            if let Some(value) = app.get("BuildID") {
                self.buildid = value.clone();
            }
        }
        if self.repository.is_empty() || self.repository == "NULL" {
            if let Some(value) = app.get("SourceRepository") {
                self.repository = value.clone();
            }
        }
        if self.sourcestamp.is_empty() || self.sourcestamp == "NULL" {
            if let Some(value) = app.get("SourceStamp") {
                self.sourcestamp = value.clone();
            }
        }
        if self.browser_name.is_empty() {
            if let Some(value) = app.get("Name") {
                self.browser_name = value.clone();
            }
        }
        if self.browser_version.is_empty() {
            if let Some(value) = app.get("Version") {
                self.browser_version = value.clone();
            }
        }
        Ok(())
    }
}

/// Per-test option set. Every field is optional so a base template can fill
/// the gaps; see [`TestOptions::fill_from`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestOptions {
    #[serde(default)]
    pub tpmanifest: Option<String>,
    /// Explicit launch URL; when set, no pageloader command line is built.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub tpformat: Option<String>,
    #[serde(default)]
    pub profile_path: Option<String>,
    #[serde(default)]
    pub tpcycles: Option<u32>,
    #[serde(default)]
    pub tppagecycles: Option<u32>,
    #[serde(default)]
    pub tpdelay: Option<u32>,
    #[serde(default)]
    pub tpchrome: Option<bool>,
    #[serde(default)]
    pub tpmozafterpaint: Option<bool>,
    #[serde(default)]
    pub tpnoisy: Option<bool>,
    #[serde(default)]
    pub rss: Option<bool>,
    #[serde(default)]
    pub tprender: Option<bool>,
    /// Per-test filter pipeline override.
    #[serde(default)]
    pub filters: Option<Vec<String>>,
    /// Counter names sampled while the browser runs.
    #[serde(default)]
    pub counters: Option<Vec<String>>,
    /// Run the OS trace session around this test.
    #[serde(default)]
    pub trace: Option<bool>,
}

impl TestOptions {
    /// Fill absent fields from the base template, then normalize: string
    /// fields that still resolve to an absent value become the empty string
    /// and boolean flags default to off. Absence after fill is not an error.
    pub fn fill_from(&mut self, base: &TestOptions) {
        if self.tpmanifest.is_none() {
            self.tpmanifest = base.tpmanifest.clone();
        }
        if self.url.is_none() {
            self.url = base.url.clone();
        }
        if self.tpformat.is_none() {
            self.tpformat = base.tpformat.clone();
        }
        if self.profile_path.is_none() {
            self.profile_path = base.profile_path.clone();
        }
        if self.tpcycles.is_none() {
            self.tpcycles = base.tpcycles;
        }
        if self.tppagecycles.is_none() {
            self.tppagecycles = base.tppagecycles;
        }
        if self.tpdelay.is_none() {
            self.tpdelay = base.tpdelay;
        }
        if self.tpchrome.is_none() {
            self.tpchrome = base.tpchrome;
        }
        if self.tpmozafterpaint.is_none() {
            self.tpmozafterpaint = base.tpmozafterpaint;
        }
        if self.tpnoisy.is_none() {
            self.tpnoisy = base.tpnoisy;
        }
        if self.rss.is_none() {
            self.rss = base.rss;
        }
        if self.tprender.is_none() {
            self.tprender = base.tprender;
        }
        if self.filters.is_none() {
            self.filters = base.filters.clone();
        }
        if self.counters.is_none() {
            self.counters = base.counters.clone();
        }
        if self.trace.is_none() {
            self.trace = base.trace;
        }
        self.normalize();
    }

    fn normalize(&mut self) {
        for slot in [
            &mut self.tpmanifest,
            &mut self.url,
            &mut self.tpformat,
            &mut self.profile_path,
        ] {
            if slot.is_none() {
                *slot = Some(String::new());
            }
        }
        for flag in [
            &mut self.tpchrome,
            &mut self.tpmozafterpaint,
            &mut self.tpnoisy,
            &mut self.rss,
            &mut self.tprender,
            &mut self.trace,
        ] {
            if flag.is_none() {
                *flag = Some(false);
            }
        }
    }
}

/// One benchmark definition from the suite file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestSpec {
    pub name: String,
    #[serde(flatten)]
    pub options: TestOptions,
}

/// Where aggregated results are delivered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputSettings {
    /// `file://` paths or `http(s)://` endpoints; validated before the run.
    #[serde(default)]
    pub results_urls: Vec<String>,
}

/// The full suite configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessSettings {
    #[serde(default)]
    pub title: String,
    pub browser: BrowserConfig,
    /// Template whose fields fill gaps in every test.
    #[serde(default)]
    pub basetest: TestOptions,
    #[serde(default, rename = "test")]
    pub tests: Vec<TestSpec>,
    #[serde(default)]
    pub output: OutputSettings,
    #[serde(default)]
    pub trace: TraceConfig,
    /// A browser cycle running longer than this is killed and fails the test.
    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,
}

fn default_cycle_timeout_secs() -> u64 {
    3600
}

impl HarnessSettings {
    /// Load a suite configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Unable to read suite config at {}", path.display()))?;
        let parsed: Self = toml::from_str(&raw)
            .with_context(|| format!("Malformed suite config at {}", path.display()))?;
        Ok(parsed)
    }
}

/// Default location of the suite configuration file.
pub fn default_config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("dev", "pacer", "Pacer")
        .context("Unable to resolve platform config directory")?;
    Ok(dirs.config_dir().join("pacer.toml"))
}

/// Expand the root token inside a configured path value.
pub fn interpolate(root: &Path, value: &str) -> String {
    value.replace(ROOT_TOKEN, &root.to_string_lossy())
}

fn parse_ini_section(raw: &str, section: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    let mut in_section = false;
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            in_section = name == section;
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            values.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    values
}
