//! Step sequencing through marker files on a shared volume.
//!
//! Every step container runs the same program: decode the script, wait for
//! the previous step's marker, run, report results, then write its own
//! marker. A step that fails writes [`ABORT_MARKER`] instead; each later
//! step then exits without running and passes the marker on, so every
//! container of the pod ends and the pod fails.

use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::args::Args;
use crate::error::{EntrypointError, EntrypointResult};
use crate::termination::{self, ResultEntry};

/// Delay between checks of the wait file.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Marker contents telling later steps not to run.
pub const ABORT_MARKER: &str = "error";

/// Run all phases for one step. On failure the post file still gets
/// written, holding [`ABORT_MARKER`].
pub async fn run(args: &Args) -> EntrypointResult<()> {
    let result = run_phases(args).await;

    if let Err(err) = &result {
        if !args.post_file.is_empty() {
            warn!(error = %err, post_file = %args.post_file, "Aborting later steps");
            if let Err(signal_err) = signal(Path::new(&args.post_file), ABORT_MARKER).await {
                warn!(error = %signal_err, "Failed to write abort marker");
            }
        }
    }

    result
}

async fn run_phases(args: &Args) -> EntrypointResult<()> {
    if !args.encode_script.is_empty() {
        decode_script(Path::new(&args.encode_script)).await?;
    }

    if !args.wait_file.is_empty() {
        let content = Some(args.wait_content.as_str()).filter(|c| !c.is_empty());
        info!(wait_file = %args.wait_file, "Waiting for previous step");
        wait_for(Path::new(&args.wait_file), content).await?;
    }

    execute(&args.command, &args.params()).await?;

    let outputs = args.outputs();
    if !outputs.is_empty() {
        let entries =
            collect_results(&outputs, &args.results_dir, &args.termination_message_path).await?;
        debug!(results = entries.len(), "Results reported");
    }

    if !args.post_file.is_empty() {
        signal(Path::new(&args.post_file), &args.post_content).await?;
    }

    Ok(())
}

/// Replace a base64 script file with its decoded contents and make it
/// executable.
pub async fn decode_script(path: &Path) -> EntrypointResult<()> {
    let encoded = fs::read_to_string(path).await.map_err(EntrypointError::io(path))?;
    let decoded = STANDARD.decode(encoded.trim())?;
    fs::write(path, decoded).await.map_err(EntrypointError::io(path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(EntrypointError::io(path))?;
    }

    Ok(())
}

/// Block until `path` exists and, when `content` is given, holds it.
/// Fails with [`EntrypointError::Aborted`] once the file holds
/// [`ABORT_MARKER`].
pub async fn wait_for(path: &Path, content: Option<&str>) -> EntrypointResult<()> {
    loop {
        match fs::read_to_string(path).await {
            Ok(found) if found.trim() == ABORT_MARKER => {
                return Err(EntrypointError::Aborted(path.to_path_buf()));
            }
            Ok(found) if content.map_or(true, |expected| found.trim() == expected) => {
                return Ok(());
            }
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(EntrypointError::io(path)(err)),
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Run the step command with inherited standard streams.
pub async fn execute(command: &str, params: &[&str]) -> EntrypointResult<()> {
    info!(command = %command, params = ?params, "Running step");

    let status = Command::new(command)
        .args(params)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|e| EntrypointError::Process(format!("Failed to spawn {command}: {e}")))?;

    if status.success() {
        return Ok(());
    }
    Err(EntrypointError::CommandFailed {
        code: exit_code(status),
    })
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Read each declared result file and merge the values into the
/// termination message. Results the step did not write are skipped.
pub async fn collect_results(
    names: &[&str],
    results_dir: &Path,
    termination_path: &Path,
) -> EntrypointResult<Vec<ResultEntry>> {
    let mut entries = termination::read_entries(termination_path).await?;

    for name in names {
        let path = results_dir.join(name);
        match fs::read(&path).await {
            Ok(bytes) => {
                termination::upsert(&mut entries, name, String::from_utf8_lossy(&bytes).into_owned())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(result = %name, "Result file not written, skipping");
            }
            Err(err) => return Err(EntrypointError::io(&path)(err)),
        }
    }

    termination::write_entries(termination_path, &entries).await?;
    Ok(entries)
}

/// Write the marker the next step waits on.
pub async fn signal(path: &Path, content: &str) -> EntrypointResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(EntrypointError::io(parent))?;
    }

    // Rename so a waiter never reads a half-written marker.
    let staging = path.with_extension("tmp");
    fs::write(&staging, content).await.map_err(EntrypointError::io(&staging))?;
    fs::rename(&staging, path).await.map_err(EntrypointError::io(path))?;

    info!(post_file = %path.display(), "Step finished");
    Ok(())
}
