//! Built-in job handlers.

use inflow_engine::{
    HandlerContext, HandlerError, HandlerRegistry, JobHandler, spawn_managed,
};
use std::process::{Command, Stdio};
use std::time::Duration;

/// Runs an external command described by the job demands:
/// `{"program": "...", "args": ["..."]}`.
///
/// The child runs in the job's local folder with its PID registered for
/// tree kill; the stop channel is polled while waiting.
pub(crate) struct CommandHandler;

impl JobHandler for CommandHandler {
    fn run(&self, ctx: &mut HandlerContext) -> Result<(), HandlerError> {
        let demands = ctx.job_demands();
        let program = demands
            .get("program")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| HandlerError::InvalidDemands("missing \"program\"".to_string()))?
            .to_string();
        let args: Vec<String> = demands
            .get("args")
            .and_then(serde_json::Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(serde_json::Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut command = Command::new(&program);
        command
            .args(&args)
            .current_dir(ctx.local_folder())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = spawn_managed(&mut command, ctx.process_handle())?;

        loop {
            if ctx.should_stop() {
                ctx.process_handle().kill_tree();
                return Err(HandlerError::Stopped);
            }
            match child.try_wait()? {
                Some(status) if status.success() => {
                    ctx.process_handle().clear();
                    ctx.report_completed();
                    return Ok(());
                }
                Some(status) => {
                    ctx.process_handle().clear();
                    let message = format!("{program} exited with {status}");
                    ctx.report_error(&message);
                    return Err(HandlerError::Process(message));
                }
                None => std::thread::sleep(Duration::from_millis(200)),
            }
        }
    }
}

/// Registers the handlers every daemon carries.
pub(crate) fn register_builtin(registry: &HandlerRegistry) {
    registry.register("command", || Box::new(CommandHandler));
}
