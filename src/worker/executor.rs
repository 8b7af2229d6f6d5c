use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::controller::ControllerHandle;
use crate::external::{ExecutionLayer, JobLaunch};
use crate::scheduler::job::{ExitStatus, JobId};

/// Command used for jobs submitted without one.
const DEFAULT_COMMAND: &str = "true";

#[derive(Debug)]
struct RunningProcess {
    run: u32,
    cancel: CancellationToken,
}

/// Runs each job's command through `sh -c` on the local host and reports
/// the exit back to the controller.
///
/// The whole allocation is handed to one process; the node list and CPU
/// count are exported in its environment.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    handle: ControllerHandle,
    output_dir: Option<PathBuf>,
    running: Arc<Mutex<HashMap<JobId, RunningProcess>>>,
}

impl LocalExecutor {
    pub fn new(handle: ControllerHandle) -> Self {
        Self {
            handle,
            output_dir: None,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Write each job's stdout and stderr to `<dir>/job-<id>.out`.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn running_jobs(&self) -> usize {
        self.running.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn build_command(&self, launch: &JobLaunch) -> std::io::Result<Command> {
        let script = launch.command.as_deref().unwrap_or(DEFAULT_COMMAND);
        let cpus: u32 = launch.allocation.values().map(|v| v.cpus).sum();
        let nodes: Vec<&str> = launch.allocation.keys().map(String::as_str).collect();

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .env("SLURM_LITE_JOB_ID", launch.job_id.to_string())
            .env("SLURM_LITE_NODELIST", nodes.join(","))
            .env("SLURM_LITE_CPUS", cpus.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(name) = &launch.name {
            cmd.env("SLURM_LITE_JOB_NAME", name);
        }

        match &self.output_dir {
            Some(dir) => {
                let out = std::fs::File::create(dir.join(format!("job-{}.out", launch.job_id)))?;
                let err = out.try_clone()?;
                cmd.stdout(out).stderr(err);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        Ok(cmd)
    }
}

impl ExecutionLayer for LocalExecutor {
    fn start(&self, launch: JobLaunch) {
        let job_id = launch.job_id;
        let run = launch.run;
        let cancel = CancellationToken::new();
        let previous = self.running.lock().ok().and_then(|mut running| {
            running.insert(
                job_id,
                RunningProcess {
                    run,
                    cancel: cancel.clone(),
                },
            )
        });
        if let Some(previous) = previous {
            tracing::warn!(job_id = %job_id, run = previous.run, "Replacing an earlier run, killing it");
            previous.cancel.cancel();
        }

        let command = self.build_command(&launch);
        let handle = self.handle.clone();
        let running = self.running.clone();
        tokio::spawn(async move {
            let status = match command {
                Ok(cmd) => execute(job_id, cmd, cancel).await,
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to prepare job output");
                    Some(ExitStatus::Code(127))
                }
            };
            if let Ok(mut running) = running.lock() {
                if running.get(&job_id).is_some_and(|p| p.run == run) {
                    running.remove(&job_id);
                }
            }
            if let Some(status) = status {
                if let Err(e) = handle.notify_run_exited(job_id, run, status).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Could not report job exit");
                }
            }
        });
    }

    fn terminate(&self, job_id: JobId, nodes: &BTreeSet<String>) {
        let process = self.running.lock().ok().and_then(|mut r| r.remove(&job_id));
        if let Some(process) = process {
            tracing::info!(job_id = %job_id, run = process.run, nodes = ?nodes, "Terminating job");
            process.cancel.cancel();
        }
    }
}

/// Run to completion, or until cancelled. `None` means the job was
/// terminated on request and nothing should be reported.
async fn execute(job_id: JobId, mut cmd: Command, cancel: CancellationToken) -> Option<ExitStatus> {
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Job execution failed");
            return Some(ExitStatus::Code(127));
        }
    };
    tracing::info!(job_id = %job_id, pid = ?child.id(), "Job process started");

    tokio::select! {
        status = child.wait() => {
            let status = match status {
                Ok(s) => s.code().map(ExitStatus::Code).unwrap_or(ExitStatus::Killed),
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Waiting on job failed");
                    ExitStatus::Killed
                }
            };
            tracing::info!(job_id = %job_id, status = ?status, "Job process exited");
            Some(status)
        }
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to kill job process");
            }
            None
        }
    }
}
