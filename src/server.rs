//! Server instance — binds a project root to a process handle, a
//! connection and the capabilities advertised at initialize.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::process::{Child, Command};

use crate::connection::Connection;
use crate::protocol;
use crate::types::LaunchConfig;

const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(30);

/// Capability view of a running server process.
///
/// The manager only ever needs an identifier and a kill switch, so hosting
/// strategies other than a native subprocess (in-process fakes, remote
/// shims) satisfy the same contract.
pub trait ServerProcess: Send + Sync {
    /// OS-level process identifier, if one is still attached.
    fn id(&self) -> Option<u32>;

    /// Signal the process to terminate. Errors are advisory — callers log
    /// and continue.
    fn terminate(&self) -> io::Result<()>;
}

/// Native subprocess variant backed by a tokio [`Child`].
pub struct NativeProcess {
    child: Mutex<Child>,
}

impl NativeProcess {
    #[must_use]
    pub fn new(child: Child) -> Self {
        Self {
            child: Mutex::new(child),
        }
    }
}

impl ServerProcess for NativeProcess {
    fn id(&self) -> Option<u32> {
        self.child.lock().unwrap().id()
    }

    fn terminate(&self) -> io::Result<()> {
        self.child.lock().unwrap().start_kill()
    }
}

/// A running language server scoped to one project root.
///
/// Owned by the manager's registry; the manager is also the only caller of
/// the termination paths.
pub struct ServerInstance {
    project_path: PathBuf,
    process: Box<dyn ServerProcess>,
    connection: Arc<Connection>,
    capabilities: Value,
    cleanup: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl ServerInstance {
    #[must_use]
    pub fn new(
        project_path: PathBuf,
        process: Box<dyn ServerProcess>,
        connection: Arc<Connection>,
        capabilities: Value,
    ) -> Self {
        Self {
            project_path,
            process,
            connection,
            capabilities,
            cleanup: Mutex::new(Vec::new()),
        }
    }

    /// Normalized project root this server owns; the registry key.
    #[must_use]
    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    #[must_use]
    pub fn process_id(&self) -> Option<u32> {
        self.process.id()
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Capabilities advertised at initialize. Immutable for the lifetime of
    /// the instance.
    #[must_use]
    pub fn capabilities(&self) -> &Value {
        &self.capabilities
    }

    /// Attach session bookkeeping torn down when this server stops.
    pub fn defer_cleanup(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.cleanup.lock().unwrap().push(Box::new(cleanup));
    }

    /// Release the bookkeeping bundle. Draining makes a second call a no-op.
    pub(crate) fn run_cleanup(&self) {
        let deferred = std::mem::take(&mut *self.cleanup.lock().unwrap());
        for cleanup in deferred {
            cleanup();
        }
    }

    pub(crate) fn terminate_process(&self) -> io::Result<()> {
        self.process.terminate()
    }
}

impl std::fmt::Debug for ServerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInstance")
            .field("project_path", &self.project_path)
            .field("pid", &self.process.id())
            .field("open", &self.connection.is_open())
            .finish_non_exhaustive()
    }
}

/// Sole means of producing a new [`ServerInstance`] for a project root.
///
/// The manager treats this as an opaque factory; failures are surfaced to
/// every caller awaiting the same pending start.
pub trait ServerSpawner: Send + Sync {
    fn spawn<'a>(&'a self, project_path: &'a Path) -> BoxFuture<'a, Result<ServerInstance>>;
}

/// Stock spawner: launches a configured executable under the project root
/// and runs the initialize handshake over its stdio.
pub struct NativeSpawner {
    config: LaunchConfig,
}

impl NativeSpawner {
    #[must_use]
    pub fn new(config: LaunchConfig) -> Self {
        Self { config }
    }

    async fn launch(&self, project_path: &Path) -> Result<ServerInstance> {
        let program = which::which(&self.config.command)
            .with_context(|| format!("{} not found in PATH", self.config.command))?;

        let mut command = Command::new(&program);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .current_dir(project_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("spawning {}", self.config.command))?;
        let stdout = child.stdout.take().context("child stdout not piped")?;
        let stdin = child.stdin.take().context("child stdin not piped")?;
        let connection = Arc::new(Connection::new(stdout, stdin));

        let root_uri = protocol::path_to_file_uri(project_path)?;
        let params = protocol::initialize_params(
            root_uri.as_str(),
            self.config.initialization_options.clone(),
        );
        let init = tokio::time::timeout(INITIALIZE_TIMEOUT, connection.initialize(params))
            .await
            .context("initialize timed out")??;
        connection.initialized().await?;

        let capabilities = init.get("capabilities").cloned().unwrap_or(Value::Null);
        tracing::debug!(
            path = %project_path.display(),
            pid = ?child.id(),
            "language server initialized"
        );

        Ok(ServerInstance::new(
            project_path.to_path_buf(),
            Box::new(NativeProcess::new(child)),
            connection,
            capabilities,
        ))
    }
}

impl ServerSpawner for NativeSpawner {
    fn spawn<'a>(&'a self, project_path: &'a Path) -> BoxFuture<'a, Result<ServerInstance>> {
        Box::pin(self.launch(project_path))
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::instance_with_pipe;
    use super::*;

    #[tokio::test]
    async fn test_cleanup_bundle_runs_once() {
        let (instance, _peer) = instance_with_pipe(Path::new("/proj"), true);
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        {
            let counter = Arc::clone(&counter);
            instance.defer_cleanup(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        instance.run_cleanup();
        instance.run_cleanup();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_terminate_reaches_the_process() {
        let (instance, peer) = instance_with_pipe(Path::new("/proj"), true);
        assert!(!peer.killed.load(Ordering::SeqCst));
        instance.terminate_process().unwrap();
        assert!(peer.killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_capabilities_are_cached_on_the_instance() {
        let (instance, _peer) = instance_with_pipe(Path::new("/proj"), true);
        assert_eq!(instance.capabilities()["textDocumentSync"], 1);
        assert_eq!(instance.process_id(), Some(4242));
        assert_eq!(instance.project_path(), Path::new("/proj"));
    }
}
