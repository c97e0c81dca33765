use std::{collections::BTreeMap, fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::config::BrowserConfig;
use crate::error::HarnessError;
use crate::launch::CycleOutcome;

/// One named reduction step in a filter pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Drop the first N samples (warmup cycles).
    IgnoreFirst(usize),
    Mean,
    Median,
    Max,
    Min,
}

impl Filter {
    /// Parse a filter spec such as `median` or `ignore_first:2`.
    pub fn parse(spec: &str) -> Result<Self, HarnessError> {
        let (name, arg) = match spec.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (spec, None),
        };
        match (name, arg) {
            ("ignore_first", arg) => {
                let count = arg.unwrap_or("1").parse::<usize>().map_err(|err| {
                    HarnessError::validation(format!(
                        "ignore_first takes an integer argument: {err}"
                    ))
                })?;
                Ok(Filter::IgnoreFirst(count))
            }
            ("mean", None) => Ok(Filter::Mean),
            ("median", None) => Ok(Filter::Median),
            ("max", None) => Ok(Filter::Max),
            ("min", None) => Ok(Filter::Min),
            ("mean" | "median" | "max" | "min", Some(_)) => Err(HarnessError::validation(
                format!("filter {name} takes no argument"),
            )),
            _ => Err(HarnessError::validation(format!(
                "unknown filter {spec:?}"
            ))),
        }
    }

    /// Apply this step to a sample series.
    pub fn apply(&self, samples: &[f64]) -> Vec<f64> {
        match self {
            Filter::IgnoreFirst(count) => samples.iter().skip(*count).copied().collect(),
            Filter::Mean => {
                if samples.is_empty() {
                    Vec::new()
                } else {
                    vec![samples.iter().sum::<f64>() / samples.len() as f64]
                }
            }
            Filter::Median => {
                if samples.is_empty() {
                    return Vec::new();
                }
                let mut sorted = samples.to_vec();
                sorted.sort_by(|a, b| a.total_cmp(b));
                let mid = sorted.len() / 2;
                let median = if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                };
                vec![median]
            }
            Filter::Max => samples
                .iter()
                .copied()
                .reduce(f64::max)
                .map(|value| vec![value])
                .unwrap_or_default(),
            Filter::Min => samples
                .iter()
                .copied()
                .reduce(f64::min)
                .map(|value| vec![value])
                .unwrap_or_default(),
        }
    }
}

/// Parse and validate a whole pipeline. Used at prepare time so a bad spec
/// fails before anything launches.
pub fn parse_filters(specs: &[String]) -> Result<Vec<Filter>, HarnessError> {
    specs.iter().map(|spec| Filter::parse(spec)).collect()
}

/// Pipeline applied when neither the suite nor the test overrides filters.
pub fn default_filters() -> Vec<Filter> {
    vec![Filter::IgnoreFirst(1), Filter::Median]
}

/// Run the samples through every step and return the reduced value.
pub fn apply_pipeline(filters: &[Filter], samples: &[f64]) -> Option<f64> {
    let mut series = samples.to_vec();
    for filter in filters {
        series = filter.apply(&series);
    }
    series.last().copied()
}

/// Samples and counters from one browser cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleResult {
    pub cycle: u32,
    pub duration_ms: u64,
    pub counters: BTreeMap<String, u64>,
}

impl CycleResult {
    pub fn from_outcome(cycle: u32, outcome: CycleOutcome) -> Self {
        Self {
            cycle,
            duration_ms: outcome.duration_ms,
            counters: outcome.counters.into_iter().collect(),
        }
    }
}

/// Aggregated result for one test.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    /// Cycle durations reduced through the test's filter pipeline.
    pub summary: Option<f64>,
    pub counter_averages: BTreeMap<String, f64>,
    pub cycles: Vec<CycleResult>,
}

impl TestResult {
    pub fn from_cycles(name: impl Into<String>, filters: &[Filter], cycles: Vec<CycleResult>) -> Self {
        let durations: Vec<f64> = cycles
            .iter()
            .map(|cycle| cycle.duration_ms as f64)
            .collect();
        let summary = apply_pipeline(filters, &durations);

        let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for cycle in &cycles {
            for (counter, value) in &cycle.counters {
                let entry = sums.entry(counter.clone()).or_insert((0.0, 0));
                entry.0 += *value as f64;
                entry.1 += 1;
            }
        }
        let counter_averages = sums
            .into_iter()
            .map(|(counter, (total, count))| (counter, total / count as f64))
            .collect();

        Self {
            name: name.into(),
            summary,
            counter_averages,
            cycles,
        }
    }
}

/// Browser identity echoed into every report.
#[derive(Debug, Clone, Serialize)]
pub struct BrowserSummary {
    pub name: String,
    pub version: String,
    pub buildid: String,
    pub repository: String,
    pub sourcestamp: String,
}

impl From<&BrowserConfig> for BrowserSummary {
    fn from(config: &BrowserConfig) -> Self {
        Self {
            name: config.browser_name.clone(),
            version: config.browser_version.clone(),
            buildid: config.buildid.clone(),
            repository: config.repository.clone(),
            sourcestamp: config.sourcestamp.clone(),
        }
    }
}

/// Everything one completed run produces. Delivered exactly once, after all
/// tests succeed.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub title: String,
    pub date: DateTime<Utc>,
    pub browser: BrowserSummary,
    pub results: Vec<TestResult>,
}

impl RunReport {
    pub fn new(title: impl Into<String>, browser: &BrowserConfig) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            title: title.into(),
            date: Utc::now(),
            browser: BrowserSummary::from(browser),
            results: Vec::new(),
        }
    }

    pub fn add(&mut self, result: TestResult) {
        self.results.push(result);
    }
}

/// A validated destination for the run report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultChannel {
    File(PathBuf),
    Http(String),
}

/// Validate result URLs before the run starts. Bare paths and `file://`
/// URLs write to disk; `http(s)://` URLs receive a JSON POST.
pub fn check_output_channels(urls: &[String]) -> Result<Vec<ResultChannel>, HarnessError> {
    urls.iter()
        .map(|raw| {
            if let Some(path) = raw.strip_prefix("file://") {
                Ok(ResultChannel::File(PathBuf::from(path)))
            } else if raw.starts_with("http://") || raw.starts_with("https://") {
                Ok(ResultChannel::Http(raw.clone()))
            } else if !raw.contains("://") {
                Ok(ResultChannel::File(PathBuf::from(raw)))
            } else {
                Err(HarnessError::validation(format!(
                    "unsupported results url {raw:?}"
                )))
            }
        })
        .collect()
}

/// Send the report to every configured channel.
pub fn deliver(channels: &[ResultChannel], report: &RunReport) -> Result<()> {
    for channel in channels {
        match channel {
            ResultChannel::File(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent).with_context(|| {
                            format!("Failed to create results directory {}", parent.display())
                        })?;
                    }
                }
                let payload = serde_json::to_string_pretty(report)?;
                fs::write(path, payload)
                    .with_context(|| format!("Failed to write results to {}", path.display()))?;
                info!(path = %path.display(), "results written");
            }
            ResultChannel::Http(url) => {
                post_report(url, report)?;
                info!(url = %url, "results posted");
            }
        }
    }
    Ok(())
}

fn post_report(url: &str, report: &RunReport) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to build results HTTP client")?;
    let response = client
        .post(url)
        .json(report)
        .send()
        .with_context(|| format!("Failed to post results to {url}"))?;
    if !response.status().is_success() {
        bail!(
            "results endpoint {url} responded with status {}",
            response.status()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn filter_specs_parse_names_and_arguments() {
        assert_eq!(Filter::parse("median").expect("parses"), Filter::Median);
        assert_eq!(
            Filter::parse("ignore_first:2").expect("parses"),
            Filter::IgnoreFirst(2)
        );
        assert_eq!(
            Filter::parse("ignore_first").expect("parses"),
            Filter::IgnoreFirst(1)
        );
    }

    #[test]
    fn malformed_filter_specs_are_validation_errors() {
        for spec in ["bogus", "ignore_first:x", "median:3"] {
            let err = Filter::parse(spec).expect_err("invalid spec");
            assert!(matches!(err, HarnessError::Validation(_)), "{spec}");
        }
    }

    #[test]
    fn pipeline_drops_warmup_then_reduces() {
        let filters = vec![Filter::IgnoreFirst(1), Filter::Median];
        let summary = apply_pipeline(&filters, &[100.0, 1.0, 2.0, 3.0]);
        assert_eq!(summary, Some(2.0));
    }

    #[test]
    fn median_of_even_series_averages_the_middle() {
        let summary = apply_pipeline(&[Filter::Median], &[4.0, 1.0, 3.0, 2.0]);
        assert_eq!(summary, Some(2.5));
    }

    #[test]
    fn empty_series_reduces_to_nothing() {
        assert_eq!(apply_pipeline(&default_filters(), &[]), None);
    }

    #[test]
    fn test_result_averages_counters_across_cycles() {
        let cycles = vec![
            CycleResult {
                cycle: 1,
                duration_ms: 100,
                counters: BTreeMap::from([("RSS".to_string(), 1000)]),
            },
            CycleResult {
                cycle: 2,
                duration_ms: 200,
                counters: BTreeMap::from([("RSS".to_string(), 3000)]),
            },
        ];
        let result = TestResult::from_cycles("tp5", &[Filter::Mean], cycles);
        assert_eq!(result.summary, Some(150.0));
        assert_eq!(result.counter_averages.get("RSS"), Some(&2000.0));
    }

    #[test]
    fn output_channels_validate_schemes() {
        let channels = check_output_channels(&[
            "file:///tmp/results.json".to_string(),
            "https://graphs.example.org/collect".to_string(),
            "local-results.json".to_string(),
        ])
        .expect("all supported");
        assert_eq!(channels.len(), 3);
        assert_eq!(
            channels[0],
            ResultChannel::File(PathBuf::from("/tmp/results.json"))
        );

        let err = check_output_channels(&["ftp://example.org/results".to_string()])
            .expect_err("unsupported scheme");
        assert!(matches!(err, HarnessError::Validation(_)));
    }

    #[test]
    fn file_delivery_writes_parseable_json() {
        let dir = tempdir().expect("temp directory");
        let path = dir.path().join("out/results.json");
        let browser = BrowserConfig::default();
        let mut report = RunReport::new("nightly", &browser);
        report.add(TestResult::from_cycles(
            "tp5",
            &default_filters(),
            vec![CycleResult {
                cycle: 1,
                duration_ms: 42,
                counters: BTreeMap::new(),
            }],
        ));

        let channels = vec![ResultChannel::File(path.clone())];
        deliver(&channels, &report).expect("delivery succeeds");

        let raw = fs::read_to_string(&path).expect("results readable");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
        assert_eq!(value["title"], "nightly");
        assert_eq!(value["results"][0]["name"], "tp5");
    }
}
