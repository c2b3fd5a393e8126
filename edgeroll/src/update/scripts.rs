//! Pre/post install hooks

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::FleetError;

/// Run `script` through `sh -c` inside `working_dir`.
///
/// The child is killed when the timeout elapses. Returns stdout.
pub async fn run_script(
    name: &str,
    script: &str,
    working_dir: &Path,
    timeout: Duration,
) -> Result<String, FleetError> {
    info!(script = %name, "Running {} script", name);
    tokio::fs::create_dir_all(working_dir).await?;

    let child = Command::new("sh")
        .current_dir(working_dir)
        .args(["-c", script])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| FleetError::ScriptError(format!("failed to start {} script: {}", name, e)))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| FleetError::ScriptError(format!("{} script timed out after {:?}", name, timeout)))?
        .map_err(|e| FleetError::ScriptError(format!("{} script failed: {}", name, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FleetError::ScriptError(format!(
            "{} script exited with {}: {}",
            name,
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    debug!(script = %name, "Script output: {}", stdout.trim());
    Ok(stdout)
}
