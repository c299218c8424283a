use async_trait::async_trait;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tempfile::TempDir;
use tokio::{
    fs,
    process::{Child, Command},
    sync::oneshot,
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BackendHandle, ExecutionBackend, JobSpec, WaitOutcome};
use crate::{error::Error, types::ResourceLimits};

const OUTPUT_FILE: &str = ".output";
const STDIN_FILE: &str = ".stdin";
/// Time allowed for a killed process group to be reaped
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
enum Exit {
    Success,
    Failure(String),
    Killed,
}

struct Process {
    workspace: TempDir,
    task: Option<JoinHandle<Exit>>,
    kill: Option<oneshot::Sender<()>>,
    outcome: Option<WaitOutcome>,
}

/// Runs submissions as local interpreter processes.
///
/// Every execution gets a scratch directory holding the source file, the
/// stdin file and one output file shared by stdout and stderr. Processes run
/// with a cleared environment, CPU-time and file-size rlimits, and in their
/// own process group so a deadline kill takes down everything they spawned.
/// This is resource hygiene, not isolation.
pub struct SubprocessBackend {
    limits: ResourceLimits,
    root: Option<PathBuf>,
    processes: Mutex<HashMap<String, Process>>,
}

impl SubprocessBackend {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            root: None,
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Create scratch directories under `root` instead of the system temp dir
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Number of handles not yet cleaned up
    pub fn active(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Process>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_workspace(&self) -> Result<TempDir, Error> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("sandbox-");
        match &self.root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|e| Error::Backend(format!("Failed to create sandbox directory: {}", e)))
    }

    fn command(
        &self,
        program: &Path,
        args: &[&str],
        workspace: &Path,
        output: &File,
        stdin: Option<File>,
    ) -> Result<Command, Error> {
        // Interpreters outside the default PATH still find their own helpers
        let mut path = String::new();
        if let Some(dir) = program.parent() {
            path.push_str(&dir.to_string_lossy());
            path.push(':');
        }
        path.push_str("/usr/local/bin:/usr/bin:/bin");

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .env("PATH", path)
            .env("HOME", workspace)
            .current_dir(workspace)
            .stdout(Stdio::from(output.try_clone()?))
            .stderr(Stdio::from(output.try_clone()?))
            .stdin(match stdin {
                Some(file) => Stdio::from(file),
                None => Stdio::null(),
            })
            .process_group(0)
            .kill_on_drop(true);

        let file_size = self.limits.file_size;
        let cpu_time = u64::from(self.limits.cpu_time);

        unsafe {
            command.pre_exec(move || {
                setrlimit(Resource::RLIMIT_FSIZE, file_size, file_size)
                    .map_err(std::io::Error::from)?;
                setrlimit(Resource::RLIMIT_CPU, cpu_time, cpu_time)
                    .map_err(std::io::Error::from)?;
                Ok(())
            });
        }

        Ok(command)
    }
}

impl Default for SubprocessBackend {
    fn default() -> Self {
        Self::new(ResourceLimits::default())
    }
}

#[async_trait]
impl ExecutionBackend for SubprocessBackend {
    fn name(&self) -> &str {
        "subprocess"
    }

    async fn create(&self, spec: &JobSpec) -> Result<BackendHandle, Error> {
        let toolchain = spec.toolchain();
        let steps = toolchain
            .steps()
            .into_iter()
            .map(|step| {
                which::which(step.program)
                    .map(|path| (path, step.args))
                    .map_err(|_| Error::Backend(format!("Command not found: {}", step.program)))
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let workspace = self.create_workspace()?;
        let root = workspace.path();

        fs::write(root.join(toolchain.source_file), &spec.source).await?;
        fs::write(root.join(STDIN_FILE), spec.stdin.as_deref().unwrap_or_default()).await?;
        let output = File::create(root.join(OUTPUT_FILE))?;

        let last = steps.len().saturating_sub(1);
        let mut commands = Vec::with_capacity(steps.len());
        for (index, (program, args)) in steps.iter().enumerate() {
            let stdin = if index == last {
                Some(File::open(root.join(STDIN_FILE))?)
            } else {
                None
            };
            commands.push(self.command(program, args, root, &output, stdin)?);
        }

        let mut commands = commands.into_iter();
        let mut first = commands
            .next()
            .ok_or_else(|| Error::Backend(format!("No steps for {}", toolchain.language)))?;
        let child = first
            .spawn()
            .map_err(|e| Error::Backend(format!("Failed to spawn process: {}", e)))?;

        let (kill_tx, kill_rx) = oneshot::channel();
        let task = tokio::spawn(run_steps(child, commands.collect(), kill_rx));

        let id = Uuid::new_v4().to_string();
        debug!(
            "Started {} process for submission {} in {}",
            toolchain.language,
            spec.submission_id,
            root.display()
        );

        self.lock().insert(
            id.clone(),
            Process {
                workspace,
                task: Some(task),
                kill: Some(kill_tx),
                outcome: None,
            },
        );

        Ok(BackendHandle::new(id))
    }

    async fn wait(&self, handle: &BackendHandle, deadline: Instant) -> Result<WaitOutcome, Error> {
        let (task, kill) = {
            let mut processes = self.lock();
            let process = processes
                .get_mut(handle.as_str())
                .ok_or_else(|| Error::UnknownHandle(handle.to_string()))?;
            if let Some(outcome) = &process.outcome {
                return Ok(outcome.clone());
            }
            (process.task.take(), process.kill.take())
        };

        let mut task = task
            .ok_or_else(|| Error::Backend(format!("{} is already being waited on", handle)))?;

        let outcome = match time::timeout_at(deadline, &mut task).await {
            Ok(Ok(Exit::Success)) => WaitOutcome::Succeeded,
            Ok(Ok(Exit::Failure(reason))) => WaitOutcome::Failed(reason),
            Ok(Ok(Exit::Killed)) => WaitOutcome::TimedOut,
            Ok(Err(e)) => return Err(Error::Backend(format!("Execution task failed: {}", e))),
            Err(_) => {
                debug!("Deadline reached for {}, killing process group", handle);
                if let Some(kill) = kill {
                    let _ = kill.send(());
                }
                if time::timeout(KILL_GRACE, &mut task).await.is_err() {
                    warn!("Process for {} did not exit after kill", handle);
                    task.abort();
                }
                WaitOutcome::TimedOut
            }
        };

        if let Some(process) = self.lock().get_mut(handle.as_str()) {
            process.outcome = Some(outcome.clone());
        }
        Ok(outcome)
    }

    async fn collect_output(&self, handle: &BackendHandle) -> Result<String, Error> {
        let path = self
            .lock()
            .get(handle.as_str())
            .map(|process| process.workspace.path().join(OUTPUT_FILE))
            .ok_or_else(|| Error::UnknownHandle(handle.to_string()))?;

        let bytes = fs::read(&path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn cleanup(&self, handle: &BackendHandle) {
        let Some(process) = self.lock().remove(handle.as_str()) else {
            debug!("Cleanup of {}: already released", handle);
            return;
        };

        // Dropping the kill sender stops a process that is still running
        let Process {
            workspace,
            task,
            kill,
            ..
        } = process;
        drop(kill);
        if let Some(task) = task {
            if time::timeout(KILL_GRACE, task).await.is_err() {
                warn!("Process for {} outlived cleanup", handle);
            }
        }

        if let Err(e) = workspace.close() {
            warn!("Failed to clean up sandbox directory for {}: {}", handle, e);
        }
    }
}

async fn run_steps(
    mut child: Child,
    mut remaining: Vec<Command>,
    mut kill: oneshot::Receiver<()>,
) -> Exit {
    remaining.reverse();
    loop {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = &mut kill => {
                terminate(&mut child).await;
                return Exit::Killed;
            }
        };

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => return Exit::Failure(describe(status)),
            Err(e) => return Exit::Failure(format!("failed to wait for process: {}", e)),
        }

        match remaining.pop() {
            None => return Exit::Success,
            Some(mut command) => match command.spawn() {
                Ok(next) => child = next,
                Err(e) => return Exit::Failure(format!("failed to start next step: {}", e)),
            },
        }
    }
}

async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Ok(pid) = i32::try_from(pid) {
            let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }
    let _ = child.kill().await;
}

fn describe(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit status {}", code),
        (None, Some(signal)) => match Signal::try_from(signal) {
            Ok(Signal::SIGXCPU) => "CPU time limit exceeded".to_string(),
            Ok(Signal::SIGXFSZ) => "output size limit exceeded".to_string(),
            Ok(signal) => format!("terminated by {}", signal),
            Err(_) => format!("terminated by signal {}", signal),
        },
        (None, None) => "terminated".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::utils::skip_if_not_available;
    use crate::types::Language;

    fn spec(language: Language, source: &str, stdin: Option<&str>) -> JobSpec {
        JobSpec {
            submission_id: "test".to_string(),
            language,
            source: source.to_string(),
            stdin: stdin.map(str::to_string),
        }
    }

    fn in_seconds(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn runs_bash_with_stdin() -> Result<(), Error> {
        if skip_if_not_available(&["bash"]) {
            return Ok(());
        }
        let backend = SubprocessBackend::default();
        let handle = backend
            .create(&spec(Language::Bash, "read name\necho \"Hello, $name!\"", Some("Ada\n")))
            .await?;

        assert_eq!(backend.wait(&handle, in_seconds(10)).await?, WaitOutcome::Succeeded);
        assert_eq!(backend.collect_output(&handle).await?, "Hello, Ada!\n");

        backend.cleanup(&handle).await;
        assert_eq!(backend.active(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn stdout_and_stderr_are_combined_in_order() -> Result<(), Error> {
        if skip_if_not_available(&["bash"]) {
            return Ok(());
        }
        let backend = SubprocessBackend::default();
        let handle = backend
            .create(&spec(Language::Bash, "echo out\necho err >&2\necho again", None))
            .await?;

        backend.wait(&handle, in_seconds(10)).await?;
        assert_eq!(backend.collect_output(&handle).await?, "out\nerr\nagain\n");
        backend.cleanup(&handle).await;
        Ok(())
    }

    #[tokio::test]
    async fn non_zero_exit_is_failed() -> Result<(), Error> {
        if skip_if_not_available(&["bash"]) {
            return Ok(());
        }
        let backend = SubprocessBackend::default();
        let handle = backend
            .create(&spec(Language::Bash, "echo broken >&2\nexit 3", None))
            .await?;

        assert_eq!(
            backend.wait(&handle, in_seconds(10)).await?,
            WaitOutcome::Failed("exit status 3".to_string())
        );
        assert_eq!(backend.collect_output(&handle).await?, "broken\n");
        backend.cleanup(&handle).await;
        Ok(())
    }

    #[tokio::test]
    async fn deadline_kills_the_process() -> Result<(), Error> {
        if skip_if_not_available(&["bash", "sleep"]) {
            return Ok(());
        }
        let backend = SubprocessBackend::default();
        let handle = backend
            .create(&spec(Language::Bash, "echo started\nsleep 30\necho finished", None))
            .await?;

        let started = Instant::now();
        let deadline = started + Duration::from_millis(500);
        let outcome = backend.wait(&handle, deadline).await?;

        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_millis(500) + KILL_GRACE);
        assert_eq!(backend.collect_output(&handle).await?, "started\n");

        // The outcome is remembered for repeated waits
        assert_eq!(backend.wait(&handle, deadline).await?, WaitOutcome::TimedOut);
        backend.cleanup(&handle).await;
        Ok(())
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_isolated() -> Result<(), Error> {
        if skip_if_not_available(&["bash"]) {
            return Ok(());
        }
        let backend = SubprocessBackend::default();
        let first = backend.create(&spec(Language::Bash, "echo one", None)).await?;
        let second = backend.create(&spec(Language::Bash, "echo two", None)).await?;

        backend.wait(&first, in_seconds(10)).await?;
        backend.cleanup(&first).await;
        backend.cleanup(&first).await;

        assert_eq!(backend.active(), 1);
        assert_eq!(backend.wait(&second, in_seconds(10)).await?, WaitOutcome::Succeeded);
        assert_eq!(backend.collect_output(&second).await?, "two\n");
        backend.cleanup(&second).await;
        Ok(())
    }

    #[tokio::test]
    async fn cleanup_stops_a_running_process() -> Result<(), Error> {
        if skip_if_not_available(&["bash", "sleep"]) {
            return Ok(());
        }
        let backend = SubprocessBackend::default();
        let handle = backend.create(&spec(Language::Bash, "sleep 30", None)).await?;

        let started = Instant::now();
        backend.cleanup(&handle).await;

        assert!(started.elapsed() < KILL_GRACE);
        assert!(matches!(
            backend.collect_output(&handle).await,
            Err(Error::UnknownHandle(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_handle_is_reported() {
        let backend = SubprocessBackend::default();
        let handle = BackendHandle::new("missing");

        assert!(matches!(
            backend.wait(&handle, in_seconds(1)).await,
            Err(Error::UnknownHandle(_))
        ));
        backend.cleanup(&handle).await;
    }

    #[tokio::test]
    async fn source_is_never_interpreted_by_a_shell() -> Result<(), Error> {
        if skip_if_not_available(&["python3"]) {
            return Ok(());
        }
        let backend = SubprocessBackend::default();
        let handle = backend
            .create(&spec(Language::Python, "print('$(echo injected)'); print(\"'\")", None))
            .await?;

        assert_eq!(backend.wait(&handle, in_seconds(10)).await?, WaitOutcome::Succeeded);
        assert_eq!(backend.collect_output(&handle).await?, "$(echo injected)\n'\n");
        backend.cleanup(&handle).await;
        Ok(())
    }
}
