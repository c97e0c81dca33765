use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::HarnessError;

/// Ring-buffer count handed to the tracing tool.
pub const MAX_BUFFERS: u32 = 1024;
/// Per-buffer size in KB.
pub const BUFFER_SIZE_KB: u32 = 1024;
/// Fixed kernel session identifier for every trace this harness starts.
pub const SESSION_NAME: &str = "pacer_ses";

/// Configuration for one trace session. May be populated directly, merged
/// from a flat TOML option file, or both; see [`TraceConfig::merge_from_file`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Location of the tracing tool binary.
    #[serde(default)]
    pub tool_path: Option<PathBuf>,
    /// Kernel-mode providers enabled for the session.
    #[serde(default)]
    pub kernel_providers: Vec<String>,
    /// User-mode providers enabled for the session.
    #[serde(default)]
    pub user_providers: Vec<String>,
    /// Stack-walk options collected for the session.
    #[serde(default)]
    pub stackwalk: Vec<String>,
    /// Base name for the `.kernel` and `.user` output files.
    #[serde(default)]
    pub output_name: Option<String>,
}

impl TraceConfig {
    /// Merge values from a flat TOML option file. File-supplied values only
    /// fill fields absent from the direct configuration; direct values take
    /// precedence.
    pub fn merge_from_file(&mut self, path: &Path) -> Result<()> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Unable to read trace config at {}", path.display()))?;
        let file: TraceConfig = toml::from_str(&raw)
            .with_context(|| format!("Malformed trace config at {}", path.display()))?;

        if self.tool_path.is_none() {
            self.tool_path = file.tool_path;
        }
        if self.kernel_providers.is_empty() {
            self.kernel_providers = file.kernel_providers;
        }
        if self.user_providers.is_empty() {
            self.user_providers = file.user_providers;
        }
        if self.stackwalk.is_empty() {
            self.stackwalk = file.stackwalk;
        }
        if self.output_name.is_none() {
            self.output_name = file.output_name;
        }
        Ok(())
    }

    fn start_plan(&self) -> Result<StartPlan, HarnessError> {
        let tool_path = self
            .tool_path
            .as_ref()
            .filter(|path| !path.as_os_str().is_empty())
            .ok_or_else(|| HarnessError::config("tool_path not given"))?;
        if self.kernel_providers.is_empty() {
            return Err(HarnessError::config("no kernel providers given"));
        }
        if self.user_providers.is_empty() {
            return Err(HarnessError::config("no user providers given"));
        }
        if self.stackwalk.is_empty() {
            return Err(HarnessError::config("no stackwalk options given"));
        }
        let output_name = self
            .output_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| HarnessError::config("output_name not given"))?;
        if !tool_path.exists() {
            return Err(HarnessError::ToolNotFound {
                path: tool_path.clone(),
            });
        }
        Ok(StartPlan {
            tool_path: tool_path.clone(),
            args: start_args(
                &self.kernel_providers,
                &self.stackwalk,
                &self.user_providers,
                output_name,
            ),
        })
    }
}

#[derive(Debug)]
struct StartPlan {
    tool_path: PathBuf,
    args: Vec<String>,
}

/// One invocation starts the kernel session (providers, stack-walk, buffer
/// limits, `<name>.kernel`) and enables the user-mode providers into
/// `<name>.user`.
fn start_args(
    kernel: &[String],
    stackwalk: &[String],
    user: &[String],
    output_name: &str,
) -> Vec<String> {
    vec![
        "-on".into(),
        kernel.join("+"),
        "-stackwalk".into(),
        stackwalk.join("+"),
        "-MaxBuffers".into(),
        MAX_BUFFERS.to_string(),
        "-BufferSize".into(),
        BUFFER_SIZE_KB.to_string(),
        "-f".into(),
        format!("{output_name}.kernel"),
        "-start".into(),
        SESSION_NAME.into(),
        "-on".into(),
        user.join("+"),
        "-MaxBuffers".into(),
        MAX_BUFFERS.to_string(),
        "-BufferSize".into(),
        BUFFER_SIZE_KB.to_string(),
        "-f".into(),
        format!("{output_name}.user"),
    ]
}

/// Controller states. The only legal cycle is Idle -> Starting -> Active ->
/// Idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    Idle,
    Starting,
    Active,
}

/// Starts and stops the OS-wide trace session. At most one session with the
/// controller's name may be active.
pub struct TraceController {
    session: String,
    state: TraceState,
    active_tool: Option<PathBuf>,
}

impl TraceController {
    pub fn new() -> Self {
        Self {
            session: SESSION_NAME.to_string(),
            state: TraceState::Idle,
            active_tool: None,
        }
    }

    pub fn state(&self) -> TraceState {
        self.state
    }

    /// Validate `config` and start the session. Rejected outright when a
    /// session with this name is already active.
    pub fn start(&mut self, config: &TraceConfig) -> Result<(), HarnessError> {
        if self.state != TraceState::Idle {
            return Err(HarnessError::TraceActive {
                session: self.session.clone(),
            });
        }
        let plan = config.start_plan()?;
        self.state = TraceState::Starting;
        match run_tool(&plan.tool_path, &plan.args) {
            Ok(()) => {
                info!(session = %self.session, tool = %plan.tool_path.display(), "trace session started");
                self.active_tool = Some(plan.tool_path);
                self.state = TraceState::Active;
                Ok(())
            }
            Err(err) => {
                self.state = TraceState::Idle;
                Err(err)
            }
        }
    }

    /// Terminate the named session. A stop on an Idle controller is a
    /// no-op, so cleanup paths can call this without knowing prior state.
    pub fn stop(&mut self) -> Result<(), HarnessError> {
        let Some(tool) = self.active_tool.take() else {
            self.state = TraceState::Idle;
            return Ok(());
        };
        // State clears before the invocation so a failed stop is not retried
        // by a second cleanup pass.
        self.state = TraceState::Idle;
        let outcome = stop_session(&tool, &self.session);
        if outcome.is_ok() {
            info!(session = %self.session, "trace session stopped");
        }
        outcome
    }
}

impl Default for TraceController {
    fn default() -> Self {
        Self::new()
    }
}

/// Stop a session by name regardless of in-process controller state. Used
/// by the standalone trace binary, where the session outlives the process
/// that started it.
pub fn stop_session(tool_path: &Path, session: &str) -> Result<(), HarnessError> {
    run_tool(tool_path, &["-stop".to_string(), session.to_string()])
}

fn run_tool(tool: &Path, args: &[String]) -> Result<(), HarnessError> {
    let command = render_command(tool, args);
    debug!(command = %command, "invoking trace tool");
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|err| HarnessError::ToolInvocation {
            command: command.clone(),
            detail: err.to_string(),
        })?;
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(HarnessError::ToolInvocation {
            command,
            detail: format!(
                "exited with {}: {} {}",
                output.status,
                stdout.trim(),
                stderr.trim()
            ),
        });
    }
    Ok(())
}

fn render_command(tool: &Path, args: &[String]) -> String {
    format!("{} {}", tool.display(), args.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn full_config(tool: &str) -> TraceConfig {
        TraceConfig {
            tool_path: Some(PathBuf::from(tool)),
            kernel_providers: vec!["PROC_THREAD".into(), "LOADER".into()],
            user_providers: vec!["app-provider".into()],
            stackwalk: vec!["profile".into()],
            output_name: Some("output.etl".into()),
        }
    }

    #[test]
    fn first_missing_field_is_named_in_order() {
        let config = TraceConfig::default();
        let err = config.start_plan().expect_err("nothing set");
        assert!(err.to_string().contains("tool_path not given"));

        let config = TraceConfig {
            tool_path: Some(PathBuf::from("/bin/true")),
            ..TraceConfig::default()
        };
        let err = config.start_plan().expect_err("providers missing");
        assert!(err.to_string().contains("no kernel providers given"));
    }

    #[test]
    fn missing_tool_binary_is_rejected_before_start() {
        let config = full_config("/nonexistent/xperf");
        let err = config.start_plan().expect_err("tool absent");
        assert!(matches!(err, HarnessError::ToolNotFound { .. }));
    }

    #[test]
    fn start_args_join_providers_and_name_both_outputs() {
        let args = start_args(
            &["PROC_THREAD".into(), "LOADER".into()],
            &["profile".into()],
            &["app-provider".into()],
            "output.etl",
        );
        let expected: Vec<String> = [
            "-on",
            "PROC_THREAD+LOADER",
            "-stackwalk",
            "profile",
            "-MaxBuffers",
            "1024",
            "-BufferSize",
            "1024",
            "-f",
            "output.etl.kernel",
            "-start",
            "pacer_ses",
            "-on",
            "app-provider",
            "-MaxBuffers",
            "1024",
            "-BufferSize",
            "1024",
            "-f",
            "output.etl.user",
        ]
        .iter()
        .map(|value| value.to_string())
        .collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn config_file_fills_only_absent_fields() {
        let dir = tempdir().expect("temp directory");
        let path = dir.path().join("trace.toml");
        fs::write(
            &path,
            "tool_path = \"/opt/xperf\"\noutput_name = \"from-file.etl\"\nkernel_providers = [\"FILE_IO\"]\n",
        )
        .expect("write config");

        let mut config = TraceConfig {
            output_name: Some("direct.etl".into()),
            ..TraceConfig::default()
        };
        config.merge_from_file(&path).expect("merge succeeds");
        assert_eq!(config.tool_path, Some(PathBuf::from("/opt/xperf")));
        assert_eq!(config.kernel_providers, vec!["FILE_IO".to_string()]);
        // Direct arguments take precedence over file values.
        assert_eq!(config.output_name.as_deref(), Some("direct.etl"));
    }

    #[cfg(unix)]
    #[test]
    fn second_start_while_active_is_rejected() {
        let mut controller = TraceController::new();
        let config = full_config("/bin/true");
        controller.start(&config).expect("first start succeeds");
        assert_eq!(controller.state(), TraceState::Active);

        let err = controller.start(&config).expect_err("already active");
        assert!(matches!(err, HarnessError::TraceActive { .. }));
        assert_eq!(controller.state(), TraceState::Active);
    }

    #[cfg(unix)]
    #[test]
    fn stop_on_idle_controller_is_a_no_op() {
        let mut controller = TraceController::new();
        controller.stop().expect("idle stop is fine");
        assert_eq!(controller.state(), TraceState::Idle);
    }

    #[cfg(unix)]
    #[test]
    fn stop_returns_controller_to_idle() {
        let mut controller = TraceController::new();
        controller
            .start(&full_config("/bin/true"))
            .expect("start succeeds");
        controller.stop().expect("stop succeeds");
        assert_eq!(controller.state(), TraceState::Idle);
        // A second stop after returning to Idle stays a no-op.
        controller.stop().expect("repeat stop is fine");
    }

    #[cfg(unix)]
    #[test]
    fn failed_invocation_leaves_controller_idle() {
        let mut controller = TraceController::new();
        let err = controller
            .start(&full_config("/bin/false"))
            .expect_err("tool reports failure");
        assert!(matches!(err, HarnessError::ToolInvocation { .. }));
        assert_eq!(controller.state(), TraceState::Idle);
    }
}
