use crate::error::{Result, SpeechError};
use std::ffi::OsStr;
use std::process::Output;
use tokio::process::Command;

/// Runs a local tool to completion and returns its output, failing on a non-zero exit.
pub(crate) async fn run_program<I, S>(program: &str, args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| SpeechError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(SpeechError::ProcessFailed {
            program: program.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}
