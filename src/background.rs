//! Parallel prefetching, one worker thread per host.

use std::collections::BTreeMap;
use std::thread;

use tracing::{debug, instrument, warn};

use crate::download::{DownloadRequest, FetchError, extract_domain};
use crate::manager::DownloadManager;

/// Result of one queued request.
#[derive(Debug)]
pub struct FetchOutcome {
    /// The request as queued.
    pub request: DownloadRequest,
    /// Body bytes or the error the fetch produced.
    pub result: Result<Vec<u8>, FetchError>,
}

/// Fans queued requests out to one thread per distinct host.
///
/// Requests for the same host run sequentially on that host's worker, so a
/// slow mirror only delays its own requests. [`run`](Self::run) returns once
/// every worker has finished.
#[derive(Debug)]
pub struct BackgroundFetchCoordinator<'m> {
    manager: &'m DownloadManager,
    requests: Vec<DownloadRequest>,
}

impl<'m> BackgroundFetchCoordinator<'m> {
    /// Creates an empty coordinator fetching through `manager`.
    #[must_use]
    pub fn new(manager: &'m DownloadManager) -> Self {
        Self {
            manager,
            requests: Vec::new(),
        }
    }

    /// Queues a request.
    pub fn add(&mut self, request: DownloadRequest) -> &mut Self {
        self.requests.push(request);
        self
    }

    /// Number of queued requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Runs every queued request and returns the outcomes in submission order.
    #[instrument(skip(self), fields(requests = self.requests.len()))]
    pub fn run(self) -> Vec<FetchOutcome> {
        let mut results: Vec<Option<Result<Vec<u8>, FetchError>>> =
            (0..self.requests.len()).map(|_| None).collect();

        let mut by_host: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (index, request) in self.requests.iter().enumerate() {
            let host = url::Url::parse(&request.url)
                .ok()
                .filter(|u| u.host_str().is_some())
                .map(|_| extract_domain(&request.url));
            match host {
                Some(host) => by_host.entry(host).or_default().push(index),
                None => results[index] = Some(Err(FetchError::invalid_url(&request.url))),
            }
        }
        debug!(hosts = by_host.len(), "starting host workers");

        let manager = self.manager;
        let requests = &self.requests;
        let finished: Vec<(String, Vec<usize>, thread::Result<Vec<Result<Vec<u8>, FetchError>>>)> =
            thread::scope(|scope| {
                let workers: Vec<_> = by_host
                    .into_iter()
                    .map(|(host, indices)| {
                        let worker_indices = indices.clone();
                        let handle = scope.spawn(move || {
                            worker_indices
                                .iter()
                                .map(|&i| manager.fetch(&requests[i]))
                                .collect::<Vec<_>>()
                        });
                        (host, indices, handle)
                    })
                    .collect();
                workers
                    .into_iter()
                    .map(|(host, indices, handle)| (host, indices, handle.join()))
                    .collect()
            });

        for (host, indices, outcome) in finished {
            match outcome {
                Ok(host_results) => {
                    for (index, result) in indices.into_iter().zip(host_results) {
                        results[index] = Some(result);
                    }
                }
                Err(_) => {
                    warn!(host = %host, "fetch worker panicked");
                    for index in indices {
                        results[index] = Some(Err(FetchError::configuration(format!(
                            "fetch worker for {host} panicked"
                        ))));
                    }
                }
            }
        }

        self.requests
            .into_iter()
            .zip(results)
            .map(|(request, result)| FetchOutcome {
                result: result.unwrap_or_else(|| {
                    Err(FetchError::configuration(format!(
                        "no result recorded for {}",
                        request.url
                    )))
                }),
                request,
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::download::Downloader;
    use crate::download::backends::DownloaderFactory;

    /// Records which thread served each URL.
    #[derive(Debug, Default)]
    struct ThreadLog {
        seen: Mutex<Vec<(String, thread::ThreadId)>>,
    }

    #[derive(Debug)]
    struct LoggingDownloader {
        log: Arc<ThreadLog>,
    }

    impl Downloader for LoggingDownloader {
        fn name(&self) -> &'static str {
            "logging"
        }

        fn fetch(&mut self, request: &DownloadRequest) -> Result<Vec<u8>, FetchError> {
            if request.url.contains("panic") {
                panic!("scripted worker failure");
            }
            thread::sleep(Duration::from_millis(20));
            self.log
                .seen
                .lock()
                .unwrap()
                .push((request.url.clone(), thread::current().id()));
            if request.url.ends_with("/missing") {
                return Err(FetchError::protocol(&request.url, Some(404), "not found"));
            }
            Ok(request.url.as_bytes().to_vec())
        }

        fn close(&mut self) {}

        fn supports_ssl(&self) -> bool {
            true
        }
    }

    #[derive(Debug, Default)]
    struct LoggingFactory {
        log: Arc<ThreadLog>,
    }

    impl DownloaderFactory for LoggingFactory {
        fn create(&self) -> Result<Box<dyn Downloader>, FetchError> {
            Ok(Box::new(LoggingDownloader {
                log: Arc::clone(&self.log),
            }))
        }

        fn create_tls_capable(&self) -> Result<Box<dyn Downloader>, FetchError> {
            self.create()
        }
    }

    fn manager() -> (DownloadManager, Arc<ThreadLog>) {
        let factory = LoggingFactory::default();
        let log = Arc::clone(&factory.log);
        (
            DownloadManager::with_idle_window(Arc::new(factory), Duration::from_secs(60)),
            log,
        )
    }

    #[test]
    fn test_results_keep_submission_order() {
        let (manager, _) = manager();
        let mut coordinator = BackgroundFetchCoordinator::new(&manager);
        for url in [
            "https://b.test/1",
            "https://a.test/1",
            "https://b.test/missing",
            "not a url",
            "https://a.test/2",
        ] {
            coordinator.add(DownloadRequest::new(url));
        }
        assert_eq!(coordinator.len(), 5);

        let outcomes = coordinator.run();
        let urls: Vec<_> = outcomes.iter().map(|o| o.request.url.as_str()).collect();
        assert_eq!(
            urls,
            ["https://b.test/1", "https://a.test/1", "https://b.test/missing", "not a url", "https://a.test/2"]
        );
        assert_eq!(outcomes[0].result.as_ref().unwrap(), b"https://b.test/1");
        assert!(matches!(outcomes[2].result, Err(FetchError::Protocol { .. })));
        assert!(matches!(outcomes[3].result, Err(FetchError::InvalidUrl { .. })));
        assert!(outcomes[4].result.is_ok());
        assert_eq!(manager.in_use(), 0);
    }

    #[test]
    fn test_one_worker_per_host() {
        let (manager, log) = manager();
        let mut coordinator = BackgroundFetchCoordinator::new(&manager);
        for url in ["http://a.test/1", "http://a.test/2", "http://b.test/1", "http://c.test/1"] {
            coordinator.add(DownloadRequest::new(url));
        }
        coordinator.run();

        let seen = log.seen.lock().unwrap();
        let thread_of = |url: &str| seen.iter().find(|(u, _)| u == url).unwrap().1;
        assert_eq!(thread_of("http://a.test/1"), thread_of("http://a.test/2"));
        let distinct: HashSet<_> = seen.iter().map(|(_, t)| *t).collect();
        assert_eq!(distinct.len(), 3);
        assert!(!distinct.contains(&thread::current().id()));
    }

    #[test]
    fn test_panicking_worker_reports_errors_for_its_host() {
        let (manager, _) = manager();
        let mut coordinator = BackgroundFetchCoordinator::new(&manager);
        coordinator
            .add(DownloadRequest::new("http://bad.test/panic"))
            .add(DownloadRequest::new("http://good.test/ok"));
        let outcomes = coordinator.run();
        assert!(matches!(outcomes[0].result, Err(FetchError::Configuration { .. })));
        assert!(outcomes[1].result.is_ok());
    }

    #[test]
    fn test_empty_run() {
        let (manager, _) = manager();
        let coordinator = BackgroundFetchCoordinator::new(&manager);
        assert!(coordinator.is_empty());
        assert!(coordinator.run().is_empty());
    }
}
