//! Server manager — owns every running instance, routes sessions to the
//! server for their project root, and drives all lifecycle transitions.
//!
//! State lives behind one mutex with short critical sections; the lock is
//! never held across an await, so registry invariants hold at every
//! suspension point. Starts are deduplicated through a table of shared
//! futures: everyone resolving the same project path while a spawn is in
//! flight awaits the same outcome.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared, join_all};
use tokio::time::Instant;

use crate::protocol;
use crate::router;
use crate::server::{ServerInstance, ServerSpawner};
use crate::types::{ChangeEvent, SessionId, SessionMeta};

/// Restart attempts tolerated per project path within one decay window.
const RESTART_LIMIT: u32 = 5;
/// How long a restart record lives after its first attempt.
const RESTART_WINDOW: Duration = Duration::from_secs(3 * 60);

/// Misuse of the explicit observation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ListenError {
    #[error("session observation is already active")]
    AlreadyListening,
    #[error("session observation is not active")]
    NotListening,
}

/// Start failure, cloneable so every awaiter of one pending start gets it.
#[derive(Debug, Clone)]
pub struct StartError(Arc<anyhow::Error>);

impl StartError {
    fn new(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for StartError {}

type StartOutcome = Result<Arc<ServerInstance>, StartError>;
type PendingStart = Shared<BoxFuture<'static, StartOutcome>>;

/// Decides whether a session's content warrants a server at all.
pub type SessionFilter = Arc<dyn Fn(&SessionMeta) -> bool + Send + Sync>;
/// Decides whether a changed path is worth forwarding to servers.
pub type PathFilter = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// Wraps graceful stops so the host can surface progress for slow servers.
pub trait WorkReporter: Send + Sync {
    fn report<'a>(&'a self, label: &'a str, work: BoxFuture<'a, ()>) -> BoxFuture<'a, ()>;
}

/// Default reporter: runs the work without ceremony.
pub struct SilentReporter;

impl WorkReporter for SilentReporter {
    fn report<'a>(&'a self, _label: &'a str, work: BoxFuture<'a, ()>) -> BoxFuture<'a, ()> {
        work
    }
}

/// Expiring restart record. The deadline is set when the record is created;
/// an expired record is replaced wholesale on the next attempt.
struct RestartEntry {
    attempts: u32,
    expires_at: Instant,
}

impl RestartEntry {
    fn fresh(now: Instant) -> Self {
        Self {
            attempts: 0,
            expires_at: now + RESTART_WINDOW,
        }
    }
}

#[derive(Default)]
struct ManagerState {
    /// Running servers, keyed by normalized project path.
    active: HashMap<PathBuf, Arc<ServerInstance>>,
    /// In-flight starts. At most one per path.
    starting: HashMap<PathBuf, PendingStart>,
    /// Instances mid-teardown, still reachable by [`ServerManager::terminate`].
    stopping: Vec<Arc<ServerInstance>>,
    restarts: HashMap<PathBuf, RestartEntry>,
    sessions: HashMap<SessionId, SessionMeta>,
    attached: HashMap<SessionId, Arc<ServerInstance>>,
    /// Registration-ordered normalized project roots.
    project_roots: Vec<PathBuf>,
    listening: bool,
    next_session: u64,
}

/// Registry and lifecycle driver for all language servers.
pub struct ServerManager {
    state: Arc<Mutex<ManagerState>>,
    spawner: Arc<dyn ServerSpawner>,
    session_filter: SessionFilter,
    watch_filter: PathFilter,
    reporter: Arc<dyn WorkReporter>,
}

impl ServerManager {
    #[must_use]
    pub fn new(
        spawner: Arc<dyn ServerSpawner>,
        session_filter: SessionFilter,
        watch_filter: PathFilter,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManagerState::default())),
            spawner,
            session_filter,
            watch_filter,
            reporter: Arc::new(SilentReporter),
        }
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn WorkReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    // ── observation lifecycle ──────────────────────────────────────────

    /// Begin routing sessions. The host calls this exactly once, before the
    /// matching [`stop_listening`](Self::stop_listening).
    pub fn start_listening(&self) -> Result<(), ListenError> {
        let mut state = self.state.lock().unwrap();
        if state.listening {
            return Err(ListenError::AlreadyListening);
        }
        state.listening = true;
        tracing::debug!("session observation started");
        Ok(())
    }

    pub fn stop_listening(&self) -> Result<(), ListenError> {
        let mut state = self.state.lock().unwrap();
        if !state.listening {
            return Err(ListenError::NotListening);
        }
        state.listening = false;
        tracing::debug!("session observation stopped");
        Ok(())
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.state.lock().unwrap().listening
    }

    // ── session arena ──────────────────────────────────────────────────

    /// Register a session and get its stable handle.
    pub fn register_session(&self, meta: SessionMeta) -> SessionId {
        let mut state = self.state.lock().unwrap();
        state.next_session += 1;
        let id = SessionId(state.next_session);
        state.sessions.insert(id, meta);
        id
    }

    /// Replace a session's metadata (file rename, grammar change). Returns
    /// false for unknown handles.
    pub fn update_session(&self, session: SessionId, meta: SessionMeta) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.sessions.get_mut(&session) {
            Some(slot) => {
                *slot = meta;
                true
            }
            None => false,
        }
    }

    /// Drop a session and reclaim any server it was the last user of.
    pub async fn session_destroyed(&self, session: SessionId) {
        {
            let mut state = self.state.lock().unwrap();
            state.sessions.remove(&session);
            state.attached.remove(&session);
        }
        self.stop_unused().await;
    }

    /// Re-evaluate a session after its grammar or path changed: detach and
    /// reclaim when it became ineligible, route with start when eligible.
    pub async fn refresh_session(
        &self,
        session: SessionId,
    ) -> Result<Option<Arc<ServerInstance>>, StartError> {
        let eligible = {
            let state = self.state.lock().unwrap();
            state.sessions.get(&session).map(|meta| (self.session_filter)(meta))
        };
        match eligible {
            None => Ok(None),
            Some(false) => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.attached.remove(&session);
                }
                self.stop_unused().await;
                Ok(None)
            }
            Some(true) => self.get_server(session, true).await,
        }
    }

    /// The instance currently serving a session, if any.
    #[must_use]
    pub fn server_for_session(&self, session: SessionId) -> Option<Arc<ServerInstance>> {
        self.state.lock().unwrap().attached.get(&session).cloned()
    }

    // ── resolution ─────────────────────────────────────────────────────

    /// Resolve the server for a session, starting one when `should_start`
    /// is set and the session is eligible.
    ///
    /// Returns `None` for sessions outside every project root, for unsaved
    /// buffers, and while observation is suspended. Concurrent calls for
    /// the same unresolved root all await one spawn.
    pub async fn get_server(
        &self,
        session: SessionId,
        should_start: bool,
    ) -> Result<Option<Arc<ServerInstance>>, StartError> {
        enum Route {
            Existing(Arc<ServerInstance>),
            Pending(PendingStart),
            Fresh(PathBuf),
            Unrouted,
        }

        let route = {
            let state = self.state.lock().unwrap();
            if !state.listening {
                Route::Unrouted
            } else {
                let root = state.sessions.get(&session).and_then(|meta| {
                    let file = meta.file_path.as_deref()?;
                    let root = router::project_root_for(&state.project_roots, file)?;
                    Some((meta, root.to_path_buf()))
                });
                match root {
                    None => Route::Unrouted,
                    Some((meta, root)) => {
                        if let Some(instance) = state.active.get(&root) {
                            Route::Existing(Arc::clone(instance))
                        } else if let Some(pending) = state.starting.get(&root) {
                            Route::Pending(pending.clone())
                        } else if should_start && (self.session_filter)(meta) {
                            Route::Fresh(root)
                        } else {
                            Route::Unrouted
                        }
                    }
                }
            }
        };

        let instance = match route {
            Route::Unrouted => return Ok(None),
            Route::Existing(instance) => instance,
            Route::Pending(pending) => pending.await?,
            Route::Fresh(root) => self.start_server(&root).await?,
        };
        self.attach(session, &instance);
        Ok(Some(instance))
    }

    /// Record the session→instance association, unless either side went
    /// away while the start was in flight.
    fn attach(&self, session: SessionId, instance: &Arc<ServerInstance>) {
        let mut state = self.state.lock().unwrap();
        let still_active = state
            .active
            .get(instance.project_path())
            .is_some_and(|current| Arc::ptr_eq(current, instance));
        if still_active && state.sessions.contains_key(&session) {
            state.attached.insert(session, Arc::clone(instance));
        }
    }

    // ── starting ───────────────────────────────────────────────────────

    /// Start (or join the pending start of) the server for a project path.
    pub async fn start_server(
        &self,
        project_path: &Path,
    ) -> Result<Arc<ServerInstance>, StartError> {
        let path = router::normalize_path(project_path);
        let pending = {
            let mut state = self.state.lock().unwrap();
            if let Some(instance) = state.active.get(&path) {
                return Ok(Arc::clone(instance));
            }
            if let Some(pending) = state.starting.get(&path) {
                pending.clone()
            } else {
                let pending = self.spawn_task(path.clone());
                state.starting.insert(path, pending.clone());
                pending
            }
        };
        pending.await
    }

    /// Build the shared start future for one project path. The pending
    /// entry is cleared inside the future, on success and failure alike, so
    /// the path is startable again as soon as the outcome is known.
    fn spawn_task(&self, path: PathBuf) -> PendingStart {
        let state = Arc::clone(&self.state);
        let spawner = Arc::clone(&self.spawner);
        async move {
            tracing::debug!(path = %path.display(), "starting language server");
            let outcome = spawner.spawn(&path).await;
            let mut state = state.lock().unwrap();
            state.starting.remove(&path);
            match outcome {
                Ok(instance) => {
                    let instance = Arc::new(instance);
                    state.active.insert(path.clone(), Arc::clone(&instance));
                    tracing::debug!(
                        path = %path.display(),
                        pid = ?instance.process_id(),
                        "language server active"
                    );
                    Ok(instance)
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), "language server failed to start: {err:#}");
                    Err(StartError::new(err))
                }
            }
        }
        .boxed()
        .shared()
    }

    // ── stopping ───────────────────────────────────────────────────────

    /// Stop every server that no longer serves any session. Failures are
    /// isolated per instance.
    pub async fn stop_unused(&self) {
        let unused: Vec<Arc<ServerInstance>> = {
            let state = self.state.lock().unwrap();
            state
                .active
                .values()
                .filter(|instance| {
                    !state
                        .attached
                        .values()
                        .any(|attached| Arc::ptr_eq(attached, instance))
                })
                .cloned()
                .collect()
        };
        join_all(unused.iter().map(|instance| self.stop_server(instance))).await;
    }

    /// Tear one instance down.
    ///
    /// The registry entry goes away before the first suspension point, so a
    /// resolution arriving mid-stop starts fresh instead of observing the
    /// dying instance. The stopping set keeps [`terminate`](Self::terminate)
    /// able to reach a shutdown that hangs.
    pub async fn stop_server(&self, instance: &Arc<ServerInstance>) {
        {
            let mut state = self.state.lock().unwrap();
            let current = state
                .active
                .get(instance.project_path())
                .is_some_and(|current| Arc::ptr_eq(current, instance));
            if current {
                state.active.remove(instance.project_path());
            }
            state.stopping.push(Arc::clone(instance));
        }

        instance.run_cleanup();

        if instance.connection().is_open() {
            let label = format!(
                "Stopping language server for {}",
                instance.project_path().display()
            );
            let work = async {
                if let Err(err) = instance.connection().shutdown().await {
                    tracing::warn!(
                        "graceful shutdown of {} failed: {err}",
                        instance.project_path().display()
                    );
                }
            }
            .boxed();
            self.reporter.report(&label, work).await;
        }

        {
            let mut state = self.state.lock().unwrap();
            state
                .attached
                .retain(|_, attached| !Arc::ptr_eq(attached, instance));
        }

        self.exit_server(instance).await;

        {
            let mut state = self.state.lock().unwrap();
            state.stopping.retain(|other| !Arc::ptr_eq(other, instance));
        }
        tracing::debug!(path = %instance.project_path().display(), "language server stopped");
    }

    /// Force the connection down, then kill the process. The kill runs
    /// regardless of what the polite half did.
    pub async fn exit_server(&self, instance: &ServerInstance) {
        if instance.connection().is_open() {
            if let Err(err) = instance.connection().exit().await {
                tracing::warn!(
                    "exit notification for {} failed: {err}",
                    instance.project_path().display()
                );
            }
            instance.connection().dispose();
        }
        if let Err(err) = instance.terminate_process() {
            tracing::warn!(
                "killing process for {} failed: {err}",
                instance.project_path().display()
            );
        }
    }

    /// Stop everything. Restart budgeting is forgotten; in-flight starts
    /// are awaited to completion so their instances get stopped too.
    pub async fn stop_all(&self) {
        self.state.lock().unwrap().restarts.clear();

        loop {
            let pending: Vec<PendingStart> = {
                let state = self.state.lock().unwrap();
                state.starting.values().cloned().collect()
            };
            if pending.is_empty() {
                break;
            }
            for start in pending {
                let _ = start.await;
            }
        }

        let servers: Vec<Arc<ServerInstance>> = {
            let state = self.state.lock().unwrap();
            state.active.values().cloned().collect()
        };
        join_all(servers.iter().map(|instance| self.stop_server(instance))).await;
    }

    /// Stop and forget every server while holding session routing closed,
    /// so no session lands on a half-dismantled instance.
    pub async fn restart_all(&self) {
        let was_listening = {
            let mut state = self.state.lock().unwrap();
            let was = state.listening;
            state.listening = false;
            was
        };

        self.stop_all().await;

        {
            let mut state = self.state.lock().unwrap();
            state.attached.clear();
            state.listening = was_listening;
        }
        tracing::debug!("all language servers stopped for restart");
    }

    /// Last-resort kill for instances caught mid-shutdown. Used when the
    /// host process is going away and graceful stops cannot be awaited.
    pub fn terminate(&self) {
        let stopping: Vec<Arc<ServerInstance>> = self.state.lock().unwrap().stopping.clone();
        for instance in stopping {
            tracing::warn!(
                path = %instance.project_path().display(),
                "terminating language server"
            );
            if let Err(err) = instance.terminate_process() {
                tracing::warn!(
                    "killing process for {} failed: {err}",
                    instance.project_path().display()
                );
            }
        }
    }

    // ── restart budgeting ──────────────────────────────────────────────

    /// Record a restart attempt for the instance's project path and report
    /// whether the budget is spent. Checking counts as an attempt.
    ///
    /// The counter is keyed by project path, not by instance, so crash
    /// loops keep accumulating across instance replacement. A record
    /// expires [`RESTART_WINDOW`] after its first attempt; the next check
    /// after expiry starts a fresh window.
    pub fn has_reached_restart_limit(&self, instance: &ServerInstance) -> bool {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let entry = state
            .restarts
            .entry(instance.project_path().to_path_buf())
            .and_modify(|entry| {
                if now >= entry.expires_at {
                    *entry = RestartEntry::fresh(now);
                }
            })
            .or_insert_with(|| RestartEntry::fresh(now));
        entry.attempts += 1;
        entry.attempts > RESTART_LIMIT
    }

    // ── environment events ─────────────────────────────────────────────

    /// React to the host's project roots changing: stop servers whose root
    /// is gone, then adopt the new routing set.
    pub async fn on_project_paths_changed(&self, project_paths: &[PathBuf]) {
        let roots: Vec<PathBuf> = project_paths
            .iter()
            .map(|path| router::normalize_path(path))
            .collect();

        let orphaned: Vec<Arc<ServerInstance>> = {
            let state = self.state.lock().unwrap();
            state
                .active
                .values()
                .filter(|instance| !roots.iter().any(|root| root == instance.project_path()))
                .cloned()
                .collect()
        };
        join_all(orphaned.iter().map(|instance| self.stop_server(instance))).await;

        self.state.lock().unwrap().project_roots = roots;
    }

    /// Fan a change batch out to the servers whose roots contain the
    /// changed paths. No-op without active servers or matching changes.
    pub async fn on_files_changed(&self, events: &[ChangeEvent]) {
        let servers: Vec<Arc<ServerInstance>> = {
            let state = self.state.lock().unwrap();
            state.active.values().cloned().collect()
        };

        for instance in servers {
            let changes =
                router::changes_for_root(instance.project_path(), events, &*self.watch_filter);
            if changes.is_empty() {
                continue;
            }
            tracing::debug!(
                path = %instance.project_path().display(),
                count = changes.len(),
                "forwarding watched-file changes"
            );
            let params = protocol::watched_changes_params(&changes);
            if let Err(err) = instance.connection().did_change_watched_files(params).await {
                tracing::warn!(
                    "watched-file delivery to {} failed: {err}",
                    instance.project_path().display()
                );
            }
        }
    }

    // ── accessors ──────────────────────────────────────────────────────

    /// Snapshot of the running instances. Mutating the returned vector does
    /// not affect manager state.
    #[must_use]
    pub fn active_servers(&self) -> Vec<Arc<ServerInstance>> {
        self.state.lock().unwrap().active.values().cloned().collect()
    }
}

impl fmt::Debug for ServerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("ServerManager")
            .field("active", &state.active.len())
            .field("starting", &state.starting.len())
            .field("sessions", &state.sessions.len())
            .field("listening", &state.listening)
            .finish_non_exhaustive()
    }
}
