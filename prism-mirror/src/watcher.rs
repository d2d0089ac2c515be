//! Recursive directory watcher with dynamic registration.
//!
//! The watcher registers a root and every subdirectory beneath it with the
//! OS notification facility, then drains notifications on a single dispatch
//! task. Newly created subdirectories are registered before their creation
//! is dispatched, and their existing contents are synthesized as create
//! events, so there is no window in which a directory can fill up
//! unobserved.
//!
//! Listener dispatch is sequential and synchronous within the dispatch task:
//! one slow listener delays delivery of subsequent events. There is no
//! internal queue beyond the bounded channel between the OS callback and the
//! loop; the notification facility's own buffering is the real backpressure.

use async_trait::async_trait;
use dashmap::DashMap;
use ignore::WalkBuilder;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use prism_core::error::{PrismError, Result};
use prism_core::types::FileEvent;
use prism_core::WatcherConfig;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A capability notified of filesystem changes under the watched root.
///
/// Multiple listeners may be registered; each event is delivered to every
/// listener in registration order. A listener error is caught and logged by
/// the watcher and never stops delivery to the remaining listeners.
#[async_trait]
pub trait MirrorListener: Send + Sync {
    async fn on_file_created(&self, path: &Path) -> Result<()>;

    async fn on_file_deleted(&self, path: &Path) -> Result<()>;

    /// Modification events do not occur in this domain: files are only ever
    /// created, replicated, or deleted, never edited in place.
    async fn on_file_modified(&self, path: &Path) -> Result<()> {
        Err(PrismError::invariant(format!(
            "unexpected modification event for {}",
            path.display()
        )))
    }
}

/// Lifecycle of a [`DirectoryWatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatcherState {
    Idle,
    Watching,
    Stopped,
}

/// Live resources of a running watch.
struct WatchInner {
    watcher: Arc<Mutex<RecommendedWatcher>>,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Watches a directory tree and dispatches create/delete events to
/// registered listeners.
pub struct DirectoryWatcher {
    config: WatcherConfig,
    state: Mutex<WatcherState>,
    listeners: Arc<RwLock<Vec<Arc<dyn MirrorListener>>>>,
    /// Watched directories; grows as directories are discovered and never
    /// shrinks -- stale entries for deleted directories are tolerated
    registrations: Arc<DashMap<PathBuf, ()>>,
    inner: Mutex<Option<WatchInner>>,
}

impl DirectoryWatcher {
    /// Create an idle watcher.
    pub fn new(config: WatcherConfig) -> Self {
        Self {
            config,
            state: Mutex::new(WatcherState::Idle),
            listeners: Arc::new(RwLock::new(Vec::new())),
            registrations: Arc::new(DashMap::new()),
            inner: Mutex::new(None),
        }
    }

    /// Register a listener. Allowed until the watcher is stopped.
    pub fn register_listener(&self, listener: Arc<dyn MirrorListener>) -> Result<()> {
        if *self.state.lock() == WatcherState::Stopped {
            return Err(PrismError::invalid_input(
                "cannot register a listener on a stopped watcher",
            ));
        }
        self.listeners.write().push(listener);
        Ok(())
    }

    /// Begin monitoring `root` and every directory beneath it.
    ///
    /// Performs the full recursive pre-registration pass before the dispatch
    /// loop starts, so no existing directory is ever unmonitored. Must be
    /// called from within a tokio runtime.
    pub fn watch(&self, root: &Path) -> Result<()> {
        {
            let state = self.state.lock();
            match *state {
                WatcherState::Idle => {}
                WatcherState::Watching => {
                    return Err(PrismError::invalid_input("watcher is already watching"));
                }
                WatcherState::Stopped => {
                    return Err(PrismError::invalid_input("watcher has been stopped"));
                }
            }
        }

        let meta = std::fs::metadata(root)
            .map_err(|e| PrismError::setup(format!("watch root {} is unusable: {e}", root.display())))?;
        if !meta.is_dir() {
            return Err(PrismError::setup(format!(
                "watch root {} is not a directory",
                root.display()
            )));
        }

        info!("Watching root folder: {}", root.display());

        let (event_tx, event_rx) = mpsc::channel::<FileEvent>(self.config.channel_capacity);
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for file_event in convert_event(event) {
                    if event_tx.blocking_send(file_event).is_err() {
                        debug!("Event channel closed, dropping notification");
                    }
                }
            }
            Err(e) => error!("Watch error: {e}"),
        })
        .map_err(|e| PrismError::setup(format!("unable to create watcher: {e}")))?;

        let watcher = Arc::new(Mutex::new(watcher));
        self.preregister_tree(&watcher, root)?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(dispatch_loop(
            root.to_path_buf(),
            event_rx,
            shutdown_rx,
            Arc::downgrade(&watcher),
            Arc::clone(&self.registrations),
            Arc::clone(&self.listeners),
        ));

        *self.inner.lock() = Some(WatchInner {
            watcher,
            shutdown: shutdown_tx,
            handle,
        });
        *self.state.lock() = WatcherState::Watching;
        Ok(())
    }

    /// Stop watching, releasing the OS notification resources and
    /// terminating the dispatch task promptly.
    ///
    /// No in-flight event is guaranteed to finish delivery once this is
    /// called. Idempotent.
    pub async fn stop(&self) {
        let inner = self.inner.lock().take();
        *self.state.lock() = WatcherState::Stopped;

        if let Some(inner) = inner {
            let _ = inner.shutdown.send(());
            // Dropping the last strong reference releases every OS watch
            drop(inner.watcher);
            if let Err(e) = inner.handle.await {
                warn!("Dispatch task did not shut down cleanly: {e}");
            }
            info!("Watcher stopped");
        }
    }

    /// Whether the dispatch loop is running.
    pub fn is_watching(&self) -> bool {
        *self.state.lock() == WatcherState::Watching
    }

    /// Number of directories currently registered (including stale entries
    /// for directories that have since been deleted).
    pub fn watched_dir_count(&self) -> usize {
        self.registrations.len()
    }

    /// Register `root` and every existing subdirectory beneath it.
    ///
    /// Any registration failure here is fatal: an unmonitored directory at
    /// startup would silently lose events.
    fn preregister_tree(&self, watcher: &Arc<Mutex<RecommendedWatcher>>, root: &Path) -> Result<()> {
        let walker = WalkBuilder::new(root)
            .standard_filters(false)
            .follow_links(false)
            .build();

        for entry in walker {
            let entry =
                entry.map_err(|e| PrismError::setup(format!("pre-registration walk failed: {e}")))?;
            if !entry.file_type().is_some_and(|t| t.is_dir()) {
                continue;
            }

            let dir = entry.path();
            debug!("Registering {} in watcher service", dir.display());
            watcher
                .lock()
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(|e| {
                    PrismError::setup(format!("unable to register {}: {e}", dir.display()))
                })?;
            self.registrations.insert(dir.to_path_buf(), ());
        }

        Ok(())
    }
}

/// Single-owner dispatch loop: drains the event channel until shutdown or
/// channel closure, extending registration to newly created directories
/// before their events are delivered.
async fn dispatch_loop(
    root: PathBuf,
    mut event_rx: mpsc::Receiver<FileEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
    watcher: Weak<Mutex<RecommendedWatcher>>,
    registrations: Arc<DashMap<PathBuf, ()>>,
    listeners: Arc<RwLock<Vec<Arc<dyn MirrorListener>>>>,
) {
    loop {
        let event = tokio::select! {
            _ = &mut shutdown_rx => break,
            maybe = event_rx.recv() => match maybe {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            FileEvent::Created(path) => {
                let mut synthesized = Vec::new();
                if path.is_dir() && !registrations.contains_key(&path) {
                    register_new_subtree(&watcher, &registrations, &path, &mut synthesized);
                }

                dispatch_created(&root, &listeners, &path).await;
                for extra in synthesized {
                    dispatch_created(&root, &listeners, &extra).await;
                }
            }
            FileEvent::Deleted(path) => {
                dispatch_deleted(&root, &listeners, &path).await;
            }
            FileEvent::Modified(path) => {
                // Never produced by event conversion; reaching this arm means
                // the create/delete-only contract of this domain was broken
                debug_assert!(
                    false,
                    "modification events are outside this domain: {}",
                    path.display()
                );
                error!(
                    "Dropping unexpected modification event for {}",
                    path.display()
                );
            }
        }
    }

    debug!("Watcher dispatch loop terminated");
}

/// Register a newly created directory and everything already inside it,
/// collecting the contents as synthesized create events.
///
/// Registration happens before the caller dispatches anything, so a file
/// created inside the new directory in the same burst cannot be missed.
fn register_new_subtree(
    watcher: &Weak<Mutex<RecommendedWatcher>>,
    registrations: &DashMap<PathBuf, ()>,
    dir: &Path,
    synthesized: &mut Vec<PathBuf>,
) {
    let walker = WalkBuilder::new(dir)
        .standard_filters(false)
        .follow_links(false)
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Unable to visit entry under new directory {}: {e}", dir.display());
                continue;
            }
        };

        let path = entry.path();
        if entry.file_type().is_some_and(|t| t.is_dir()) {
            register_dir(watcher, registrations, path);
        }
        if path != dir {
            synthesized.push(path.to_path_buf());
        }
    }
}

/// Register one directory, tolerating registration failure: the directory
/// may already have been deleted again, and sibling watches stay valid.
fn register_dir(
    watcher: &Weak<Mutex<RecommendedWatcher>>,
    registrations: &DashMap<PathBuf, ()>,
    dir: &Path,
) {
    if registrations.contains_key(dir) {
        return;
    }
    let Some(watcher) = watcher.upgrade() else {
        return;
    };

    match watcher.lock().watch(dir, RecursiveMode::NonRecursive) {
        Ok(()) => {
            debug!("Registering {} in watcher service", dir.display());
            registrations.insert(dir.to_path_buf(), ());
        }
        Err(e) => {
            warn!("Unable to register {} with the watcher: {e}", dir.display());
        }
    }
}

async fn dispatch_created(
    root: &Path,
    listeners: &RwLock<Vec<Arc<dyn MirrorListener>>>,
    path: &Path,
) {
    let snapshot: Vec<Arc<dyn MirrorListener>> = listeners.read().iter().cloned().collect();
    for listener in snapshot {
        if let Err(e) = listener.on_file_created(path).await {
            log_listener_error("create", root, path, &e);
        }
    }
}

async fn dispatch_deleted(
    root: &Path,
    listeners: &RwLock<Vec<Arc<dyn MirrorListener>>>,
    path: &Path,
) {
    let snapshot: Vec<Arc<dyn MirrorListener>> = listeners.read().iter().cloned().collect();
    for listener in snapshot {
        if let Err(e) = listener.on_file_deleted(path).await {
            log_listener_error("delete", root, path, &e);
        }
    }
}

/// One listener's failure must never stop delivery to the others or
/// terminate the loop; log with the file and, when known, the user whose
/// tree the event originated in.
fn log_listener_error(operation: &str, root: &Path, path: &Path, err: &PrismError) {
    match originating_user(root, path) {
        Some(user) => error!(
            "Listener failed handling {operation} of {} (originating user '{user}'): {err}; continuing",
            path.display()
        ),
        None => error!(
            "Listener failed handling {operation} of {}: {err}; continuing",
            path.display()
        ),
    }
}

/// First path segment under the watched root, by convention the user name.
fn originating_user(root: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()?
        .components()
        .next()
        .and_then(|c| c.as_os_str().to_str())
        .map(str::to_owned)
}

/// Map an OS notification onto the create/delete vocabulary of this domain.
///
/// Renames surface as a delete of the old name and a create of the new one,
/// which is how the underlying create/delete registration reports them.
/// Content and metadata modifications are not part of this domain and are
/// not forwarded; the listener contract treats any that slip through as an
/// invariant violation.
fn convert_event(event: Event) -> Vec<FileEvent> {
    match event.kind {
        EventKind::Create(_) => event.paths.into_iter().map(FileEvent::Created).collect(),
        EventKind::Remove(_) => event.paths.into_iter().map(FileEvent::Deleted).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.into_iter().map(FileEvent::Deleted).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.into_iter().map(FileEvent::Created).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.into_iter();
            let mut events = Vec::new();
            if let Some(from) = paths.next() {
                events.push(FileEvent::Deleted(from));
            }
            events.extend(paths.map(FileEvent::Created));
            events
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Direction unknown; current existence decides which side we saw
            event
                .paths
                .into_iter()
                .map(|p| {
                    if p.exists() {
                        FileEvent::Created(p)
                    } else {
                        FileEvent::Deleted(p)
                    }
                })
                .collect()
        }
        EventKind::Modify(_) | EventKind::Access(_) | EventKind::Any | EventKind::Other => {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct RecordingListener {
        created: Mutex<Vec<PathBuf>>,
        deleted: Mutex<Vec<PathBuf>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                created: Mutex::new(Vec::new()),
                deleted: Mutex::new(Vec::new()),
            })
        }

        fn created(&self) -> Vec<PathBuf> {
            self.created.lock().clone()
        }

        fn deleted(&self) -> Vec<PathBuf> {
            self.deleted.lock().clone()
        }
    }

    #[async_trait]
    impl MirrorListener for RecordingListener {
        async fn on_file_created(&self, path: &Path) -> Result<()> {
            self.created.lock().push(path.to_path_buf());
            Ok(())
        }

        async fn on_file_deleted(&self, path: &Path) -> Result<()> {
            self.deleted.lock().push(path.to_path_buf());
            Ok(())
        }
    }

    struct FailingListener;

    #[async_trait]
    impl MirrorListener for FailingListener {
        async fn on_file_created(&self, _path: &Path) -> Result<()> {
            Err(PrismError::listener("this listener always fails"))
        }

        async fn on_file_deleted(&self, _path: &Path) -> Result<()> {
            Err(PrismError::listener("this listener always fails"))
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    #[test]
    fn test_convert_create_and_remove() {
        let path = PathBuf::from("/watched/file.txt");
        let event = Event {
            kind: EventKind::Create(notify::event::CreateKind::File),
            paths: vec![path.clone()],
            attrs: Default::default(),
        };
        assert_eq!(convert_event(event), vec![FileEvent::Created(path.clone())]);

        let event = Event {
            kind: EventKind::Remove(notify::event::RemoveKind::File),
            paths: vec![path.clone()],
            attrs: Default::default(),
        };
        assert_eq!(convert_event(event), vec![FileEvent::Deleted(path)]);
    }

    #[test]
    fn test_convert_rename_pair() {
        let from = PathBuf::from("/watched/old.txt");
        let to = PathBuf::from("/watched/new.txt");
        let event = Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            paths: vec![from.clone(), to.clone()],
            attrs: Default::default(),
        };
        assert_eq!(
            convert_event(event),
            vec![FileEvent::Deleted(from), FileEvent::Created(to)]
        );
    }

    #[test]
    fn test_convert_drops_content_modifications() {
        let event = Event {
            kind: EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Content)),
            paths: vec![PathBuf::from("/watched/file.txt")],
            attrs: Default::default(),
        };
        assert!(convert_event(event).is_empty());
    }

    #[test]
    fn test_originating_user() {
        let root = Path::new("/repo/users");
        assert_eq!(
            originating_user(root, Path::new("/repo/users/alice/readWrite/p/x")),
            Some("alice".to_string())
        );
        assert_eq!(originating_user(root, Path::new("/elsewhere/x")), None);
    }

    #[tokio::test]
    async fn test_watch_rejects_missing_root() {
        let watcher = DirectoryWatcher::new(WatcherConfig::default());
        let err = watcher.watch(Path::new("/definitely/not/here")).unwrap_err();
        assert!(err.is_setup());
    }

    #[tokio::test]
    async fn test_watch_rejects_file_root() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, b"x").unwrap();

        let watcher = DirectoryWatcher::new(WatcherConfig::default());
        assert!(watcher.watch(&file).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_watch_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = DirectoryWatcher::new(WatcherConfig::default());
        watcher.watch(dir.path()).unwrap();
        assert!(watcher.watch(dir.path()).is_err());
        watcher.stop().await;
        assert!(watcher.watch(dir.path()).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_and_delete_are_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        let listener = RecordingListener::new();

        let watcher = DirectoryWatcher::new(WatcherConfig::default());
        watcher.register_listener(listener.clone()).unwrap();
        watcher.watch(dir.path()).unwrap();

        let file = dir.path().join("observed.txt");
        std::fs::write(&file, b"x").unwrap();
        assert!(wait_until(|| listener.created().contains(&file)).await);

        std::fs::remove_file(&file).unwrap();
        assert!(wait_until(|| listener.deleted().contains(&file)).await);

        watcher.stop().await;
        assert!(!watcher.is_watching());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_new_subdirectory_contents_are_discovered() {
        let dir = tempfile::tempdir().unwrap();
        let listener = RecordingListener::new();

        let watcher = DirectoryWatcher::new(WatcherConfig::default());
        watcher.register_listener(listener.clone()).unwrap();
        watcher.watch(dir.path()).unwrap();
        let initially_watched = watcher.watched_dir_count();

        // Create a directory and a file inside it in one burst
        let subdir = dir.path().join("burst");
        let inner = subdir.join("inner.txt");
        std::fs::create_dir(&subdir).unwrap();
        std::fs::write(&inner, b"x").unwrap();

        assert!(wait_until(|| listener.created().contains(&inner)).await);
        assert!(watcher.watched_dir_count() > initially_watched);

        watcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_listener_failure_does_not_stop_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let recording = RecordingListener::new();

        let watcher = DirectoryWatcher::new(WatcherConfig::default());
        watcher.register_listener(Arc::new(FailingListener)).unwrap();
        watcher.register_listener(recording.clone()).unwrap();
        watcher.watch(dir.path()).unwrap();

        let first = dir.path().join("first.txt");
        let second = dir.path().join("second.txt");
        std::fs::write(&first, b"1").unwrap();
        std::fs::write(&second, b"2").unwrap();

        assert!(
            wait_until(|| {
                let created = recording.created();
                created.contains(&first) && created.contains(&second)
            })
            .await
        );

        watcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = DirectoryWatcher::new(WatcherConfig::default());
        watcher.watch(dir.path()).unwrap();
        watcher.stop().await;
        watcher.stop().await;
    }
}
