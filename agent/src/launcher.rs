//! Starting and stopping game-server processes
//!
//! Each launched child is watched by its own task. The task reports the exit
//! through the event channel whether the child ended by itself or was
//! killed on request.

use log::{debug, info, warn};
use shared::{Properties, TaskId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("task {0} is already running")]
    AlreadyRunning(TaskId),

    #[error("failed to start {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Exited { task_id: TaskId, code: Option<i32> },
}

/// Command line for a launched process.
///
/// Extra arguments come first so that wrappers such as `sh -c` keep
/// working; options are sorted to keep the command line stable.
pub fn build_args(
    extra: &[String],
    master_addr: &str,
    task_id: TaskId,
    code: &str,
    options: &Properties,
) -> Vec<String> {
    let mut args = extra.to_vec();
    args.extend([
        "--master".to_string(),
        master_addr.to_string(),
        "--task-id".to_string(),
        task_id.to_string(),
        "--code".to_string(),
        code.to_string(),
    ]);

    let mut options: Vec<(&String, &String)> = options.iter().collect();
    options.sort();
    for (key, value) in options {
        args.push("--opt".to_string());
        args.push(format!("{}={}", key, value));
    }
    args
}

pub struct Launcher {
    executable: PathBuf,
    extra_args: Vec<String>,
    master_addr: String,
    running: HashMap<TaskId, oneshot::Sender<()>>,
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
}

impl Launcher {
    pub fn new(
        executable: impl AsRef<Path>,
        extra_args: Vec<String>,
        master_addr: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let launcher = Self {
            executable: executable.as_ref().to_path_buf(),
            extra_args,
            master_addr: master_addr.into(),
            running: HashMap::new(),
            events_tx,
        };
        (launcher, events_rx)
    }

    pub fn launch(&mut self, task_id: TaskId, code: &str, options: &Properties) -> Result<(), LaunchError> {
        if self.running.contains_key(&task_id) {
            return Err(LaunchError::AlreadyRunning(task_id));
        }

        let args = build_args(&self.extra_args, &self.master_addr, task_id, code, options);
        let mut child = Command::new(&self.executable)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                path: self.executable.clone(),
                source,
            })?;
        info!(
            "Launched task {} as pid {:?}",
            task_id,
            child.id()
        );

        let (kill_tx, kill_rx) = oneshot::channel();
        self.running.insert(task_id, kill_tx);

        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    debug!("Killing process of task {}", task_id);
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill process of task {}: {}", task_id, e);
                    }
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Lost track of process of task {}: {}", task_id, e);
                    None
                }
            };
            let _ = events_tx.send(ProcessEvent::Exited { task_id, code });
        });

        Ok(())
    }

    /// Asks the watcher of `task_id` to kill its process.
    pub fn kill(&mut self, task_id: TaskId) -> bool {
        match self.running.remove(&task_id) {
            Some(kill_tx) => kill_tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn kill_all(&mut self) {
        for (task_id, kill_tx) in self.running.drain() {
            debug!("Stopping process of task {}", task_id);
            let _ = kill_tx.send(());
        }
    }

    /// Forgets a process after its exit event was handled.
    pub fn exited(&mut self, task_id: TaskId) {
        self.running.remove(&task_id);
    }

    pub fn is_running(&self, task_id: TaskId) -> bool {
        self.running.contains_key(&task_id)
    }

    pub fn running(&self) -> u32 {
        self.running.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_build_args() {
        let mut options = Properties::new();
        options.insert("room.name".to_string(), "Arena".to_string());
        options.insert("region".to_string(), "eu".to_string());
        let extra = vec!["--verbose".to_string()];

        let args = build_args(&extra, "10.0.0.1:5000", 7, "abc123", &options);
        assert_eq!(
            args,
            vec![
                "--verbose",
                "--master",
                "10.0.0.1:5000",
                "--task-id",
                "7",
                "--code",
                "abc123",
                "--opt",
                "region=eu",
                "--opt",
                "room.name=Arena",
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let (mut launcher, _events) = Launcher::new("/nonexistent/room-server", vec![], "127.0.0.1:5000");
        let err = assert_err!(launcher.launch(1, "code", &Properties::new()));
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert_eq!(launcher.running(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_is_reported() {
        let (mut launcher, mut events) = Launcher::new("true", vec![], "127.0.0.1:5000");
        assert_ok!(launcher.launch(1, "code", &Properties::new()));
        assert!(launcher.is_running(1));
        assert!(matches!(
            launcher.launch(1, "code", &Properties::new()),
            Err(LaunchError::AlreadyRunning(1))
        ));

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, ProcessEvent::Exited { task_id: 1, code: Some(0) });
        launcher.exited(1);
        assert_eq!(launcher.running(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_stops_process() {
        let extra = vec!["-c".to_string(), "sleep 30".to_string()];
        let (mut launcher, mut events) = Launcher::new("sh", extra, "127.0.0.1:5000");
        assert_ok!(launcher.launch(2, "code", &Properties::new()));

        assert!(launcher.kill(2));
        assert!(!launcher.kill(2));

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ProcessEvent::Exited { task_id: 2, .. }));
    }
}
