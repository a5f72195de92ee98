//! Session pool and cursor caching
//!
//! Sessions are pooled per thread of work: acquiring returns a cached
//! session or builds one, and the handle releases back to the pool on
//! drop. Each session caches resolved table handles (the expensive part
//! of reopening a cursor) keyed by ident. `close_all_cursors` clears the
//! pooled caches and bumps a per-ident epoch under the same lock the
//! lookups take, so once it returns no cached handle for that ident can
//! be reused; the drop path relies on that edge. A background sweeper
//! closes sessions idle past the configured timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::store::Table;

struct CachedTable {
    table: Arc<Table>,
    epoch: u64,
}

/// One pooled engine session.
pub struct Session {
    id: u64,
    last_used: Instant,
    cache: HashMap<String, CachedTable>,
}

impl Session {
    fn new(id: u64) -> Self {
        Self {
            id,
            last_used: Instant::now(),
            cache: HashMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

struct PoolInner {
    idle: Vec<Session>,
    next_id: u64,
    /// Bumped by `close_all_cursors`; cached entries with a stale epoch
    /// are discarded on lookup.
    epochs: HashMap<String, u64>,
}

pub struct SessionCache {
    inner: Mutex<PoolInner>,
    shutting_down: AtomicBool,
    sweeper_cv: Condvar,
    sweeper_gate: Mutex<()>,
    idle_timeout: Duration,
}

impl SessionCache {
    pub fn new(idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                next_id: 1,
                epochs: HashMap::new(),
            }),
            shutting_down: AtomicBool::new(false),
            sweeper_cv: Condvar::new(),
            sweeper_gate: Mutex::new(()),
            idle_timeout,
        })
    }

    /// Start the idle sweeper. Returns the thread handle so the engine
    /// can join it on shutdown.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        let interval = (self.idle_timeout / 2).max(Duration::from_millis(100));
        thread::Builder::new()
            .name("bedrock-session-sweeper".into())
            .spawn(move || sweeper_loop(cache, interval))
            .expect("failed to spawn session sweeper")
    }

    /// Check out a session, reusing a pooled one when available.
    pub fn acquire_session(self: &Arc<Self>) -> SessionHandle {
        let mut inner = self.inner.lock().expect("session pool lock poisoned");
        let session = match inner.idle.pop() {
            Some(mut session) => {
                session.last_used = Instant::now();
                session
            }
            None => {
                let id = inner.next_id;
                inner.next_id += 1;
                Session::new(id)
            }
        };
        SessionHandle {
            cache: Arc::clone(self),
            session: Some(session),
        }
    }

    /// Invalidate every cached handle naming `ident`, in pooled and
    /// checked-out sessions alike. After this returns, no cached handle
    /// for the ident can be reused.
    pub fn close_all_cursors(&self, ident: &str) {
        let mut inner = self.inner.lock().expect("session pool lock poisoned");
        *inner.epochs.entry(ident.to_string()).or_insert(0) += 1;
        for session in &mut inner.idle {
            session.cache.remove(ident);
        }
    }

    /// Close sessions idle longer than `max_idle`. Returns how many
    /// were swept.
    pub fn sweep_idle_sessions(&self, max_idle: Duration) -> usize {
        let mut inner = self.inner.lock().expect("session pool lock poisoned");
        let before = inner.idle.len();
        inner.idle.retain(|s| s.last_used.elapsed() <= max_idle);
        let swept = before - inner.idle.len();
        if swept > 0 {
            log::debug!("swept {} idle sessions", swept);
        }
        swept
    }

    pub fn idle_sessions(&self) -> usize {
        self.inner
            .lock()
            .expect("session pool lock poisoned")
            .idle
            .len()
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let _gate = self.sweeper_gate.lock().expect("sweeper gate poisoned");
        self.sweeper_cv.notify_all();
    }

    fn current_epoch(inner: &PoolInner, ident: &str) -> u64 {
        inner.epochs.get(ident).copied().unwrap_or(0)
    }
}

fn sweeper_loop(cache: Weak<SessionCache>, interval: Duration) {
    log::debug!("session sweeper started");
    loop {
        let Some(cache) = cache.upgrade() else {
            return;
        };
        if cache.shutting_down.load(Ordering::Acquire) {
            log::debug!("session sweeper stopping");
            return;
        }
        cache.sweep_idle_sessions(cache.idle_timeout);

        let gate = cache.sweeper_gate.lock().expect("sweeper gate poisoned");
        let (_gate, _) = cache
            .sweeper_cv
            .wait_timeout(gate, interval)
            .expect("sweeper wait poisoned");
    }
}

/// Checked-out session; returns to the pool when dropped.
pub struct SessionHandle {
    cache: Arc<SessionCache>,
    session: Option<Session>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.session.as_ref().expect("session present").id()
    }

    /// Look up a cached table handle, discarding it if
    /// `close_all_cursors` ran since it was cached.
    pub fn cached_table(&mut self, ident: &str) -> Option<Arc<Table>> {
        let session = self.session.as_mut().expect("session present");
        let entry = session.cache.get(ident)?;
        let inner = self.cache.inner.lock().expect("session pool lock poisoned");
        if entry.epoch != SessionCache::current_epoch(&inner, ident) {
            drop(inner);
            session.cache.remove(ident);
            return None;
        }
        Some(Arc::clone(&entry.table))
    }

    /// Cache a table handle for later cursor opens on this session.
    pub fn cache_table(&mut self, ident: &str, table: Arc<Table>) {
        let epoch = {
            let inner = self.cache.inner.lock().expect("session pool lock poisoned");
            SessionCache::current_epoch(&inner, ident)
        };
        let session = self.session.as_mut().expect("session present");
        session
            .cache
            .insert(ident.to_string(), CachedTable { table, epoch });
    }

    pub fn cached_count(&self) -> usize {
        self.session.as_ref().expect("session present").cache.len()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            if self.cache.shutting_down.load(Ordering::Acquire) {
                return;
            }
            session.last_used = Instant::now();
            self.cache
                .inner
                .lock()
                .expect("session pool lock poisoned")
                .idle
                .push(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::TableConfig;

    fn make_table(ident: &str) -> Arc<Table> {
        Arc::new(Table::new(ident, TableConfig::default()))
    }

    #[test]
    fn test_acquire_reuses_pooled_session() {
        let cache = SessionCache::new(Duration::from_secs(60));
        let first_id = {
            let handle = cache.acquire_session();
            handle.id()
        };
        // Returned to the pool on drop; reacquired with the same id.
        let handle = cache.acquire_session();
        assert_eq!(handle.id(), first_id);
        assert_eq!(cache.idle_sessions(), 0);
    }

    #[test]
    fn test_distinct_sessions_when_pool_empty() {
        let cache = SessionCache::new(Duration::from_secs(60));
        let a = cache.acquire_session();
        let b = cache.acquire_session();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_cached_table_roundtrip() {
        let cache = SessionCache::new(Duration::from_secs(60));
        let mut handle = cache.acquire_session();
        assert!(handle.cached_table("t1").is_none());
        handle.cache_table("t1", make_table("t1"));
        assert!(handle.cached_table("t1").is_some());
    }

    #[test]
    fn test_close_all_cursors_invalidates_checked_out_caches() {
        let cache = SessionCache::new(Duration::from_secs(60));
        let mut handle = cache.acquire_session();
        handle.cache_table("t1", make_table("t1"));

        cache.close_all_cursors("t1");
        assert!(handle.cached_table("t1").is_none());
    }

    #[test]
    fn test_close_all_cursors_clears_pooled_caches() {
        let cache = SessionCache::new(Duration::from_secs(60));
        {
            let mut handle = cache.acquire_session();
            handle.cache_table("t1", make_table("t1"));
            handle.cache_table("t2", make_table("t2"));
        }
        cache.close_all_cursors("t1");

        let mut handle = cache.acquire_session();
        assert!(handle.cached_table("t1").is_none());
        assert!(handle.cached_table("t2").is_some());
    }

    #[test]
    fn test_sweep_idle_sessions() {
        let cache = SessionCache::new(Duration::from_millis(10));
        {
            let _handle = cache.acquire_session();
        }
        assert_eq!(cache.idle_sessions(), 1);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.sweep_idle_sessions(Duration::from_millis(10)), 1);
        assert_eq!(cache.idle_sessions(), 0);
    }

    #[test]
    fn test_sweeper_thread_runs_and_stops() {
        let cache = SessionCache::new(Duration::from_millis(20));
        let handle = cache.start_sweeper();
        {
            let _s = cache.acquire_session();
        }
        thread::sleep(Duration::from_millis(120));
        assert_eq!(cache.idle_sessions(), 0);

        cache.shutdown();
        handle.join().unwrap();
    }
}
