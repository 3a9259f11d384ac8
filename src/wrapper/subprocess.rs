//! Generic external-command wrapper.
//!
//! Parameters (from the step's `wrapper` mapping or its parameters):
//!
//! - `cmd`: a list of program and arguments, or a string run through `sh -c`
//! - `workingdir`: directory to run in; created if missing
//! - `timeout`: wall-clock limit in seconds; exceeding it fails the job
//! - `result_files`: optional list of paths (relative to `workingdir`) to
//!   attach after a successful run
//!
//! Standard output and error go to `<name>.stdout` / `<name>.stderr` in the
//! working directory and are attached as log files.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{ResultFile, Wrapper, WrapperContext, WrapperError, WrapperResult};

const LOG_PREFIX: &str = "subprocess";

#[derive(Debug, Default)]
pub struct SubprocessWrapper;

#[derive(Debug)]
struct Invocation {
    program: String,
    args: Vec<String>,
    workingdir: PathBuf,
    timeout: Option<Duration>,
}

impl Invocation {
    fn from_context(context: &WrapperContext) -> WrapperResult<Self> {
        let parameters = context.parameters();
        let (program, args) = match parameters.get("cmd") {
            None => return Err(WrapperError::missing_parameter("cmd")),
            Some(Value::String(line)) => ("sh".to_string(), vec!["-c".to_string(), line]),
            Some(Value::Array(items)) => {
                let mut words = items.into_iter().map(|item| match item {
                    Value::String(s) => s,
                    other => other.to_string(),
                });
                let program = words
                    .next()
                    .ok_or_else(|| WrapperError::invalid_parameter("cmd", "empty command"))?;
                (program, words.collect())
            }
            Some(_) => {
                return Err(WrapperError::invalid_parameter(
                    "cmd",
                    "string or list of strings required",
                ))
            }
        };

        let workingdir = match parameters.get_str("workingdir") {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir().map_err(|e| WrapperError::io(".", e))?,
        };

        let timeout = match parameters.get_raw("timeout") {
            None => None,
            Some(_) => {
                let secs = parameters
                    .get_f64("timeout")
                    .filter(|s| s.is_finite() && *s > 0.0)
                    .ok_or_else(|| {
                        WrapperError::invalid_parameter("timeout", "positive number of seconds")
                    })?;
                Some(Duration::from_secs_f64(secs))
            }
        };

        Ok(Self {
            program,
            args,
            workingdir,
            timeout,
        })
    }

    fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl Wrapper for SubprocessWrapper {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    async fn run(&self, context: &WrapperContext) -> WrapperResult<bool> {
        let invocation = Invocation::from_context(context)?;
        tokio::fs::create_dir_all(&invocation.workingdir)
            .await
            .map_err(|e| WrapperError::io(&invocation.workingdir, e))?;

        let stdout_path = invocation.workingdir.join(format!("{LOG_PREFIX}.stdout"));
        let stderr_path = invocation.workingdir.join(format!("{LOG_PREFIX}.stderr"));
        let stdout = std::fs::File::create(&stdout_path)
            .map_err(|e| WrapperError::io(&stdout_path, e))?;
        let stderr = std::fs::File::create(&stderr_path)
            .map_err(|e| WrapperError::io(&stderr_path, e))?;

        let command_line = invocation.display();
        info!(
            command = %command_line,
            workingdir = %invocation.workingdir.display(),
            timeout_seconds = invocation.timeout.map(|t| t.as_secs_f64()),
            "Running subprocess"
        );

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.workingdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WrapperError::Spawn {
                command: command_line.clone(),
                source,
            })?;

        let status = match invocation.timeout {
            None => Some(child.wait().await),
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => Some(status),
                Err(_) => {
                    warn!(
                        command = %command_line,
                        timeout_seconds = limit.as_secs_f64(),
                        "Subprocess timed out, killing it"
                    );
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Could not kill timed-out subprocess");
                    }
                    None
                }
            },
        };
        let success = match status {
            Some(Ok(status)) => {
                debug!(command = %command_line, exit_code = status.code(), "Subprocess exited");
                status.success()
            }
            Some(Err(e)) => {
                return Err(WrapperError::io(&invocation.workingdir, e));
            }
            None => false,
        };

        for log in [&stdout_path, &stderr_path] {
            record_if_present(context, log, "log").await?;
        }

        if success {
            let extra = result_files(context, &invocation.workingdir).await;
            context.record_result_all_files(&extra).await?;
        }
        Ok(success)
    }
}

async fn record_if_present(context: &WrapperContext, path: &Path, file_type: &str) -> WrapperResult<()> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > 0 => {
            context
                .record_result_individual_file(&ResultFile::from_path(path, file_type))
                .await
        }
        _ => Ok(()),
    }
}

/// Declared result files that exist after the run
async fn result_files(context: &WrapperContext, workingdir: &Path) -> Vec<ResultFile> {
    let Some(Value::Array(entries)) = context.parameters().get("result_files") else {
        return Vec::new();
    };
    let mut files = Vec::new();
    for entry in entries {
        let Value::String(name) = entry else { continue };
        let path = workingdir.join(&name);
        if tokio::fs::metadata(&path).await.is_ok() {
            files.push(ResultFile::from_path(&path, "result"));
        } else {
            warn!(path = %path.display(), "Declared result file not found");
        }
    }
    files
}
