//! Per-host pool of downloaders.
//!
//! [`DownloadManager::grab`] checks a downloader out of the free list for the
//! URL's host (building one if the list is empty) and hands back a
//! [`Checkout`] guard. Dropping the guard returns the downloader to the front
//! of its list. When the last checkout is returned, a shared idle timer is
//! armed; if nothing is checked out again before it fires, every pooled
//! downloader is closed and the pool is emptied.
//!
//! The pool mutex only covers bookkeeping. Nothing that may block runs under
//! it, including building a downloader. A single timer thread per pool waits
//! for the latest idle deadline.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::download::backends::DownloaderFactory;
use crate::download::constants::DEFAULT_IDLE_WINDOW;
use crate::download::{DownloadRequest, Downloader, FetchError};

/// A downloader owned by the pool, with its bookkeeping.
pub struct PooledConnection {
    /// Host the connection serves.
    pub hostname: String,
    /// Port of the URL that created it.
    pub port: u16,
    /// Scheme of the URL that created it.
    pub scheme: String,
    /// Times this instance has been checked out.
    pub use_count: u64,
    /// When it was last returned; `None` while checked out.
    pub idle_since: Option<Instant>,
    downloader: Box<dyn Downloader>,
}

impl PooledConnection {
    /// Name of the backend behind this connection.
    #[must_use]
    pub fn backend(&self) -> &'static str {
        self.downloader.name()
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("scheme", &self.scheme)
            .field("backend", &self.backend())
            .field("use_count", &self.use_count)
            .field("idle_since", &self.idle_since)
            .finish()
    }
}

#[derive(Debug, Default)]
struct PoolState {
    pools: HashMap<String, VecDeque<PooledConnection>>,
    /// Checkouts plus downloaders being built.
    in_use: usize,
    live: usize,
    /// Bumped to invalidate any pending idle timer.
    timer_generation: u64,
}

impl PoolState {
    /// Ends one use; returns the generation to arm a timer for once idle.
    fn finish_use(&mut self) -> Option<u64> {
        self.in_use = self.in_use.saturating_sub(1);
        if self.in_use == 0 {
            self.timer_generation += 1;
            Some(self.timer_generation)
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
struct TimerState {
    /// When to expire, and the pool generation that deadline belongs to.
    deadline: Option<(Instant, u64)>,
    spawned: usize,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct IdleTimer {
    state: Mutex<TimerState>,
    wake: Condvar,
}

impl IdleTimer {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Body of the timer thread. Exits once the pool is gone.
    fn run(self: Arc<Self>, pool: Weak<Shared>) {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return;
            }
            let Some((at, generation)) = state.deadline else {
                state = self.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
                continue;
            };
            let now = Instant::now();
            if now < at {
                state = self
                    .wake
                    .wait_timeout(state, at - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                continue;
            }
            state.deadline = None;
            drop(state);
            match pool.upgrade() {
                Some(shared) => shared.expire(generation),
                None => return,
            }
            state = self.lock();
        }
    }
}

#[derive(Debug)]
struct Shared {
    factory: Arc<dyn DownloaderFactory>,
    idle_window: Duration,
    state: Mutex<PoolState>,
    timer: Arc<IdleTimer>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(self: &Arc<Self>, mut connection: PooledConnection) {
        let generation = {
            let mut state = self.lock();
            connection.idle_since = Some(Instant::now());
            state
                .pools
                .entry(connection.hostname.clone())
                .or_default()
                .push_front(connection);
            state.finish_use()
        };
        if let Some(generation) = generation {
            self.arm_idle_timer(generation);
        }
    }

    /// Gives back the slot reserved for a downloader that failed to build.
    fn abandon_reservation(self: &Arc<Self>) {
        let generation = {
            let mut state = self.lock();
            state.live = state.live.saturating_sub(1);
            state.finish_use()
        };
        if let Some(generation) = generation {
            self.arm_idle_timer(generation);
        }
    }

    fn arm_idle_timer(self: &Arc<Self>, generation: u64) {
        let mut timer = self.timer.lock();
        timer.deadline = Some((Instant::now() + self.idle_window, generation));
        if timer.spawned == 0 {
            let idle = Arc::clone(&self.timer);
            let pool = Arc::downgrade(self);
            match thread::Builder::new()
                .name("pkgfetch-idle".to_string())
                .spawn(move || idle.run(pool))
            {
                Ok(_) => timer.spawned += 1,
                Err(e) => {
                    warn!(error = %e, "could not start idle timer; pooled downloaders stay open");
                }
            }
        }
        drop(timer);
        self.timer.wake.notify_one();
    }

    fn expire(&self, generation: u64) {
        let drained: Vec<PooledConnection> = {
            let mut state = self.lock();
            if state.timer_generation != generation || state.in_use != 0 {
                return;
            }
            let drained: Vec<_> = state.pools.drain().flat_map(|(_, list)| list).collect();
            state.live = state.live.saturating_sub(drained.len());
            drained
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "idle window elapsed, closing pooled downloaders");
        }
        close_all(drained);
    }

    fn drain_idle(&self) -> Vec<PooledConnection> {
        let mut state = self.lock();
        state.timer_generation += 1;
        let drained: Vec<_> = state.pools.drain().flat_map(|(_, list)| list).collect();
        state.live = state.live.saturating_sub(drained.len());
        drained
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.timer.lock().shutdown = true;
        self.timer.wake.notify_all();
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, list) in state.pools.drain() {
            for mut connection in list {
                connection.downloader.close();
            }
        }
    }
}

fn close_all(connections: Vec<PooledConnection>) {
    for mut connection in connections {
        connection.downloader.close();
    }
}

/// Pool of downloaders keyed by hostname. Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct DownloadManager {
    shared: Arc<Shared>,
}

impl DownloadManager {
    /// Creates a manager with the default 5 second idle window.
    #[must_use]
    pub fn new(factory: Arc<dyn DownloaderFactory>) -> Self {
        Self::with_idle_window(factory, DEFAULT_IDLE_WINDOW)
    }

    /// Creates a manager closing idle downloaders after `idle_window`.
    #[must_use]
    pub fn with_idle_window(factory: Arc<dyn DownloaderFactory>, idle_window: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                factory,
                idle_window,
                state: Mutex::new(PoolState::default()),
                timer: Arc::default(),
            }),
        }
    }

    /// Checks out a downloader able to fetch `url`.
    ///
    /// # Errors
    ///
    /// - [`FetchError::InvalidUrl`] if `url` is not an absolute http(s) URL
    /// - [`FetchError::Configuration`] if no backend (or, for https, no
    ///   TLS-capable backend) can be built
    #[instrument(skip(self))]
    pub fn grab(&self, url: &str) -> Result<Checkout, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::invalid_url(url))?;
        let hostname = match (parsed.scheme(), parsed.host_str()) {
            ("http" | "https", Some(host)) => host.to_ascii_lowercase(),
            _ => return Err(FetchError::invalid_url(url)),
        };
        let https = parsed.scheme() == "https";

        // Counting the checkout up front keeps the idle timer away while a
        // downloader is built with the lock released.
        let pooled = {
            let mut state = self.shared.lock();
            let pooled = state.pools.get_mut(&hostname).and_then(VecDeque::pop_front);
            if pooled.is_none() {
                state.live += 1;
            }
            state.in_use += 1;
            state.timer_generation += 1;
            pooled
        };

        let mut connection = match pooled {
            Some(connection) => connection,
            None => match self.shared.factory.create() {
                Ok(downloader) => {
                    debug!(host = %hostname, backend = downloader.name(), "created pooled downloader");
                    PooledConnection {
                        hostname: hostname.clone(),
                        port: parsed.port_or_known_default().unwrap_or(80),
                        scheme: parsed.scheme().to_string(),
                        use_count: 0,
                        idle_since: None,
                        downloader,
                    }
                }
                Err(e) => {
                    self.shared.abandon_reservation();
                    return Err(e);
                }
            },
        };

        if https && !connection.downloader.supports_ssl() {
            match self.shared.factory.create_tls_capable() {
                Ok(tls) => {
                    info!(
                        host = %hostname,
                        from = connection.backend(),
                        to = tls.name(),
                        "switching to TLS-capable backend"
                    );
                    let mut old = std::mem::replace(&mut connection.downloader, tls);
                    old.close();
                    connection.use_count = 0;
                }
                Err(e) => {
                    self.shared.release(connection);
                    return Err(e);
                }
            }
        }

        connection.use_count += 1;
        connection.idle_since = None;
        Ok(Checkout {
            shared: Arc::clone(&self.shared),
            connection: Some(connection),
        })
    }

    /// Grabs a downloader for `request.url`, fetches, and returns it to the pool.
    ///
    /// # Errors
    ///
    /// Any [`FetchError`] from [`grab`](Self::grab) or the fetch itself.
    pub fn fetch(&self, request: &DownloadRequest) -> Result<Vec<u8>, FetchError> {
        self.grab(&request.url)?.fetch(request)
    }

    /// Number of downloaders alive, pooled or checked out.
    #[must_use]
    pub fn live_instances(&self) -> usize {
        self.shared.lock().live
    }

    /// Number of downloaders currently checked out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.shared.lock().in_use
    }

    /// Number of idle downloaders pooled for `hostname`.
    #[must_use]
    pub fn pooled(&self, hostname: &str) -> usize {
        self.shared
            .lock()
            .pools
            .get(&hostname.to_ascii_lowercase())
            .map_or(0, VecDeque::len)
    }

    /// Closes every idle downloader now instead of waiting for the timer.
    /// Checked-out downloaders are unaffected.
    pub fn close_idle(&self) {
        close_all(self.shared.drain_idle());
    }
}

/// A checked-out downloader. Returned to the pool on drop.
#[derive(Debug)]
pub struct Checkout {
    shared: Arc<Shared>,
    connection: Option<PooledConnection>,
}

impl Checkout {
    /// Fetches through the checked-out downloader.
    ///
    /// # Errors
    ///
    /// Any [`FetchError`] the downloader produces.
    pub fn fetch(&mut self, request: &DownloadRequest) -> Result<Vec<u8>, FetchError> {
        match self.connection.as_mut() {
            Some(connection) => connection.downloader.fetch(request),
            None => Err(FetchError::configuration("checkout was already released")),
        }
    }

    /// Pool bookkeeping for the checked-out downloader.
    #[must_use]
    pub fn connection(&self) -> Option<&PooledConnection> {
        self.connection.as_ref()
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.shared.release(connection);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Barrier, mpsc};

    #[derive(Debug, Default)]
    struct Counters {
        created: AtomicUsize,
        closed: AtomicUsize,
        fetched: AtomicUsize,
    }

    #[derive(Debug)]
    struct FakeDownloader {
        ssl: bool,
        fail: bool,
        counters: Arc<Counters>,
    }

    impl Downloader for FakeDownloader {
        fn name(&self) -> &'static str {
            if self.ssl { "fake-tls" } else { "fake-plain" }
        }

        fn fetch(&mut self, request: &DownloadRequest) -> Result<Vec<u8>, FetchError> {
            self.counters.fetched.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(FetchError::protocol(&request.url, Some(500), "boom"));
            }
            Ok(request.url.as_bytes().to_vec())
        }

        fn close(&mut self) {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn supports_ssl(&self) -> bool {
            self.ssl
        }
    }

    #[derive(Debug, Default)]
    struct FakeFactory {
        preferred_ssl: bool,
        tls_available: bool,
        fail: bool,
        unavailable: bool,
        /// Waited on twice by `create`: once on entry, once before returning.
        gate: Option<Arc<Barrier>>,
        counters: Arc<Counters>,
    }

    impl FakeFactory {
        fn make(&self, ssl: bool) -> Box<dyn Downloader> {
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            Box::new(FakeDownloader {
                ssl,
                fail: self.fail,
                counters: Arc::clone(&self.counters),
            })
        }
    }

    impl DownloaderFactory for FakeFactory {
        fn create(&self) -> Result<Box<dyn Downloader>, FetchError> {
            if let Some(gate) = &self.gate {
                gate.wait();
                gate.wait();
            }
            if self.unavailable {
                return Err(FetchError::configuration("no backend"));
            }
            Ok(self.make(self.preferred_ssl))
        }

        fn create_tls_capable(&self) -> Result<Box<dyn Downloader>, FetchError> {
            if self.tls_available {
                Ok(self.make(true))
            } else {
                Err(FetchError::configuration("no TLS backend"))
            }
        }
    }

    fn manager(factory: FakeFactory, window: Duration) -> (DownloadManager, Arc<Counters>) {
        let counters = Arc::clone(&factory.counters);
        (
            DownloadManager::with_idle_window(Arc::new(factory), window),
            counters,
        )
    }

    fn tls_factory() -> FakeFactory {
        FakeFactory {
            preferred_ssl: true,
            tls_available: true,
            ..FakeFactory::default()
        }
    }

    #[test]
    fn test_released_instance_is_reused() {
        let (manager, counters) = manager(tls_factory(), Duration::from_secs(60));

        let first = manager.grab("https://a.test/one").unwrap();
        assert_eq!(manager.in_use(), 1);
        drop(first);
        assert_eq!(manager.in_use(), 0);
        assert_eq!(manager.pooled("a.test"), 1);

        let second = manager.grab("https://A.test/two").unwrap();
        assert_eq!(second.connection().unwrap().use_count, 2);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(manager.live_instances(), 1);
    }

    #[test]
    fn test_concurrent_checkouts_create_separate_instances() {
        let (manager, _) = manager(tls_factory(), Duration::from_secs(60));
        let a = manager.grab("http://a.test/1").unwrap();
        let b = manager.grab("http://a.test/2").unwrap();
        let c = manager.grab("http://b.test/1").unwrap();
        assert_eq!(manager.live_instances(), 3);
        assert_eq!(manager.in_use(), 3);
        drop((a, b, c));
        assert_eq!(manager.pooled("a.test"), 2);
        assert_eq!(manager.pooled("b.test"), 1);
    }

    #[test]
    fn test_idle_timer_closes_everything() {
        let (manager, counters) = manager(tls_factory(), Duration::from_millis(50));
        let a = manager.grab("http://a.test/").unwrap();
        let b = manager.grab("http://b.test/").unwrap();
        drop(a);
        drop(b);

        thread::sleep(Duration::from_millis(400));
        assert_eq!(manager.live_instances(), 0);
        assert_eq!(manager.pooled("a.test"), 0);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_grab_cancels_pending_timer() {
        let (manager, counters) = manager(tls_factory(), Duration::from_millis(100));
        drop(manager.grab("http://a.test/").unwrap());
        let held = manager.grab("http://a.test/").unwrap();

        thread::sleep(Duration::from_millis(300));
        assert_eq!(manager.live_instances(), 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 0);
        drop(held);
    }

    #[test]
    fn test_https_swaps_in_tls_backend() {
        let factory = FakeFactory {
            preferred_ssl: false,
            tls_available: true,
            ..FakeFactory::default()
        };
        let (manager, counters) = manager(factory, Duration::from_secs(60));
        let checkout = manager.grab("https://secure.test/").unwrap();
        assert_eq!(checkout.connection().unwrap().backend(), "fake-tls");
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.live_instances(), 1);
    }

    #[test]
    fn test_https_without_tls_backend_is_configuration_error() {
        let factory = FakeFactory {
            preferred_ssl: false,
            tls_available: false,
            ..FakeFactory::default()
        };
        let (manager, _) = manager(factory, Duration::from_secs(60));
        let err = manager.grab("https://secure.test/").unwrap_err();
        assert!(matches!(err, FetchError::Configuration { .. }));
        assert_eq!(manager.in_use(), 0);
        assert!(manager.grab("http://secure.test/").is_ok());
    }

    #[test]
    fn test_failed_fetch_still_returns_instance() {
        let factory = FakeFactory {
            fail: true,
            ..tls_factory()
        };
        let (manager, counters) = manager(factory, Duration::from_secs(60));
        let request = DownloadRequest::new("http://a.test/x");
        assert!(manager.fetch(&request).is_err());
        assert_eq!(manager.in_use(), 0);
        assert_eq!(manager.pooled("a.test"), 1);
        assert_eq!(counters.fetched.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_urls() {
        let (manager, _) = manager(tls_factory(), Duration::from_secs(60));
        for url in ["", "relative/path", "ftp://a.test/", "file:///tmp/x"] {
            assert!(matches!(manager.grab(url), Err(FetchError::InvalidUrl { .. })), "{url}");
        }
    }

    #[test]
    fn test_close_idle_drains_immediately() {
        let (manager, counters) = manager(tls_factory(), Duration::from_secs(60));
        drop(manager.grab("http://a.test/").unwrap());
        manager.close_idle();
        assert_eq!(manager.live_instances(), 0);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_is_shared_across_threads() {
        let (manager, _) = manager(tls_factory(), Duration::from_secs(60));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = manager.clone();
                thread::spawn(move || {
                    let request = DownloadRequest::new(format!("http://h{}.test/{i}", i % 2));
                    manager.fetch(&request).unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(manager.in_use(), 0);
        assert!(manager.live_instances() <= 8);
        assert_eq!(
            manager.live_instances(),
            manager.pooled("h0.test") + manager.pooled("h1.test")
        );
    }

    #[test]
    fn test_pool_stays_usable_while_a_downloader_is_built() {
        let gate = Arc::new(Barrier::new(2));
        let factory = FakeFactory {
            gate: Some(Arc::clone(&gate)),
            ..tls_factory()
        };
        let (manager, _) = manager(factory, Duration::from_secs(60));

        let builder = {
            let manager = manager.clone();
            thread::spawn(move || manager.grab("http://slow.test/").map(drop))
        };
        gate.wait();

        let (tx, rx) = mpsc::channel();
        let observer = {
            let manager = manager.clone();
            thread::spawn(move || {
                let _ = tx.send((manager.in_use(), manager.live_instances()));
            })
        };
        let observed = rx.recv_timeout(Duration::from_secs(2));
        gate.wait();

        builder.join().unwrap().unwrap();
        observer.join().unwrap();
        assert_eq!(observed.unwrap(), (1, 1));
        assert_eq!(manager.in_use(), 0);
        assert_eq!(manager.pooled("slow.test"), 1);
    }

    #[test]
    fn test_failed_build_releases_reservation() {
        let factory = FakeFactory {
            unavailable: true,
            ..tls_factory()
        };
        let (manager, _) = manager(factory, Duration::from_secs(60));
        let err = manager.grab("http://a.test/").unwrap_err();
        assert!(matches!(err, FetchError::Configuration { .. }));
        assert_eq!(manager.in_use(), 0);
        assert_eq!(manager.live_instances(), 0);
    }

    #[test]
    fn test_one_timer_thread_serves_every_release() {
        let (manager, counters) = manager(tls_factory(), Duration::from_millis(50));
        for _ in 0..20 {
            drop(manager.grab("http://a.test/").unwrap());
        }
        assert_eq!(manager.shared.timer.lock().spawned, 1);

        thread::sleep(Duration::from_millis(400));
        assert_eq!(manager.live_instances(), 0);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);

        drop(manager.grab("http://b.test/").unwrap());
        thread::sleep(Duration::from_millis(400));
        assert_eq!(manager.live_instances(), 0);
        assert_eq!(manager.shared.timer.lock().spawned, 1);
    }
}
