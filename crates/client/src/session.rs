//! Session orchestration.
//!
//! A [`DataIoSession`] binds one adapter to one metadata store for the span
//! of a logical unit of work. It builds and records requests, applies the
//! cache policy, dispatches to the adapter's capabilities and persists what
//! comes back.
//!
//! ```ignore
//! let registry = AdapterRegistry::new();
//! registry.register_adapter(Arc::new(MyFetcher::default()))?;
//! let store = stores.get_or_create(&config).await?;
//!
//! let response = DataIoSession::scoped(&registry, store, SessionOptions::new("myfetcher"), async |s: &DataIoSession| {
//!     let req = s.request_with(RequestSpec::new("quote").param("symbol", "AAPL")).await?;
//!     s.fetch(&req).await
//! })
//! .await?;
//! ```

use std::fmt;
use std::ops::AsyncFnOnce;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use dataio_core::config::CacheDefaults;
use dataio_core::model::{CACHE_STORE_PATH, NormalizedOutput};
use dataio_core::{
    AdapterOutput, CacheDecision, CacheMode, CachePolicy, Error, Request, RequestSpec, Response, ResponseStatus,
    SendPayload, Session, SessionMode, Store,
};

use crate::adapter::Adapter;
use crate::cache_store::CacheStore;
use crate::registry::AdapterRegistry;

/// How a session should be opened.
#[derive(Clone, Default)]
pub struct SessionOptions {
    pub source: String,
    pub mode: SessionMode,
    pub as_of: Option<DateTime<Utc>>,
    pub cache_mode: CacheMode,
    pub ttl: Option<Duration>,
    pub as_of_bucket: Option<String>,
    pub cache_tag: Option<String>,
    /// Legacy switch: `Some(true)` means DEFAULT, `Some(false)` BYPASS. Overrides `cache_mode`.
    pub use_cache: Option<bool>,
    pub cache_store: Option<Arc<dyn CacheStore>>,
}

impl SessionOptions {
    pub fn new(source: impl Into<String>) -> Self {
        Self { source: source.into(), ..Default::default() }
    }

    /// Start from the configured cache defaults.
    pub fn from_defaults(source: impl Into<String>, defaults: &CacheDefaults) -> Self {
        Self { cache_mode: defaults.mode, ttl: defaults.ttl(), ..Self::new(source) }
    }

    pub fn mode(mut self, mode: SessionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn as_of(mut self, as_of: DateTime<Utc>) -> Self {
        self.as_of = Some(as_of);
        self
    }

    pub fn cache_mode(mut self, cache_mode: CacheMode) -> Self {
        self.cache_mode = cache_mode;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn as_of_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.as_of_bucket = Some(bucket.into());
        self
    }

    pub fn cache_tag(mut self, tag: impl Into<String>) -> Self {
        self.cache_tag = Some(tag.into());
        self
    }

    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = Some(use_cache);
        self
    }

    pub fn cache_store(mut self, cache_store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(cache_store);
        self
    }

    /// Effective policy after applying the `use_cache` override.
    pub fn policy(&self) -> CachePolicy {
        match self.use_cache {
            Some(use_cache) => CachePolicy::from_use_cache(use_cache, self.ttl),
            None => CachePolicy::new(self.cache_mode, self.ttl),
        }
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("source", &self.source)
            .field("mode", &self.mode)
            .field("policy", &self.policy())
            .field("as_of_bucket", &self.as_of_bucket)
            .field("cache_tag", &self.cache_tag)
            .field("cache_store", &self.cache_store)
            .finish_non_exhaustive()
    }
}

/// An open session over one adapter and one store.
pub struct DataIoSession {
    session: Session,
    adapter: Arc<dyn Adapter>,
    store: Arc<Store>,
    policy: CachePolicy,
    as_of_bucket: Option<String>,
    cache_tag: Option<String>,
    cache_store: Option<Arc<dyn CacheStore>>,
    closed: bool,
}

impl DataIoSession {
    /// Resolve the adapter and record a new session.
    ///
    /// # Errors
    ///
    /// `AdapterNotFound` when `options.source` is not registered; store
    /// errors if the session row cannot be written.
    pub async fn open(registry: &AdapterRegistry, store: Arc<Store>, options: SessionOptions) -> Result<Self, Error> {
        let adapter = registry.resolve(&options.source)?;
        let policy = options.policy();
        let session = Session::new(options.source, options.mode).with_as_of(options.as_of);
        store.insert_session(&session).await?;

        info!(
            session_id = %session.id,
            source = %session.source,
            cache_mode = %policy.mode,
            ttl_seconds = ?policy.ttl_seconds(),
            "opened session"
        );

        Ok(Self {
            session,
            adapter,
            store,
            policy,
            as_of_bucket: options.as_of_bucket,
            cache_tag: options.cache_tag,
            cache_store: options.cache_store,
            closed: false,
        })
    }

    /// Open a session, run `f`, and close the session on every exit path.
    ///
    /// An error from `f` takes precedence over an error from closing. A panic
    /// in `f` is resumed once the session is closed.
    pub async fn scoped<T, F>(
        registry: &AdapterRegistry, store: Arc<Store>, options: SessionOptions, f: F,
    ) -> Result<T, Error>
    where
        F: AsyncFnOnce(&DataIoSession) -> Result<T, Error>,
    {
        let mut session = Self::open(registry, store, options).await?;
        let outcome = AssertUnwindSafe(f(&session)).catch_unwind().await;
        let closed = session.close().await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                if let Err(close_err) = closed {
                    warn!(session_id = %session.id(), error = %close_err, "close failed after panic in session scope");
                }
                std::panic::resume_unwind(panic);
            }
        };
        match result {
            Ok(value) => closed.map(|()| value),
            Err(e) => {
                if let Err(close_err) = closed {
                    warn!(session_id = %session.id(), error = %close_err, "close failed after session error");
                }
                Err(e)
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.session.id
    }

    pub fn source(&self) -> &str {
        &self.session.source
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Build and record a request of `kind` with no parameters.
    pub async fn request(&self, kind: impl Into<String>) -> Result<Request, Error> {
        self.request_with(RequestSpec::new(kind)).await
    }

    /// Bind `spec` to this session, stamping the session's bucket and tag.
    pub async fn request_with(&self, spec: RequestSpec) -> Result<Request, Error> {
        self.ensure_open()?;
        let request = Request::new(&self.session.id, spec, self.as_of_bucket.clone(), self.cache_tag.clone());
        self.store.insert_request(&request).await?;
        debug!(request_id = %request.id, kind = %request.kind, hash = %request.hash, "recorded request");
        Ok(request)
    }

    /// Serve `request` from cache or fetch it through the adapter.
    ///
    /// Lookup order is the short-circuit cache store, then the metadata
    /// store, then the adapter. A cache hit returns the stored response
    /// itself; nothing new is recorded.
    ///
    /// # Errors
    ///
    /// `CapabilityMismatch` if the adapter cannot fetch, `CacheMiss` under
    /// ONLY_IF_CACHED with nothing stored, and adapter errors unchanged.
    pub async fn fetch(&self, request: &Request) -> Result<Response, Error> {
        self.ensure_open()?;
        let fetcher = self.adapter.as_fetcher().ok_or_else(|| self.mismatch("fetch"))?;

        if let Some(response) = self.from_cache_store(request).await {
            return Ok(response);
        }

        let cached = if self.policy.consults_cache() {
            self.store
                .get_cached_response_by_request_hash_and_bucket(&request.hash, request.as_of_bucket.as_deref())
                .await?
        } else {
            None
        };

        match self.policy.evaluate(cached, Utc::now()) {
            CacheDecision::Hit(response) => {
                debug!(request_id = %request.id, response_id = %response.id, "cache hit");
                return Ok(response);
            }
            CacheDecision::Refuse => {
                debug!(request_id = %request.id, hash = %request.hash, "cache miss under only_if_cached");
                return Err(Error::CacheMiss { hash: request.hash.clone(), bucket: request.as_of_bucket.clone() });
            }
            CacheDecision::Fetch => {
                debug!(request_id = %request.id, cache_mode = %self.policy.mode, "fetching");
            }
        }

        let output = fetcher.fetch(request).await.map_err(Error::Adapter)?;
        let normalized = output.normalize()?;
        self.write_through(request, &normalized.result.data).await;
        self.record(request, ResponseStatus::Ok, normalized).await
    }

    /// Push `payload` through the adapter and record the acknowledgement.
    ///
    /// The adapter is always called; sends are never served from cache.
    pub async fn send(&self, request: &Request, payload: impl Into<SendPayload>) -> Result<Response, Error> {
        self.ensure_open()?;
        let sender = self.adapter.as_sender().ok_or_else(|| self.mismatch("send"))?;

        let payload = payload.into().into_bytes()?;
        let output: AdapterOutput = sender.send(request, payload).await.map_err(Error::Adapter)?;
        self.record(request, ResponseStatus::Ack, output.normalize()?).await
    }

    /// Stream through the adapter into `sink`. Streamed data is not persisted.
    pub async fn stream(&self, request: &Request, sink: mpsc::Sender<Bytes>) -> Result<(), Error> {
        self.ensure_open()?;
        let streamer = self.adapter.as_streamer().ok_or_else(|| self.mismatch("stream"))?;
        streamer.stream(request, sink).await.map_err(Error::Adapter)
    }

    /// Stamp the session's end time and release the adapter.
    ///
    /// Closing twice is a no-op. The adapter is released even if the end
    /// time cannot be written.
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let ended_at = self.session.end();
        let marked = self.store.mark_session_ended(&self.session.id, Some(ended_at)).await;
        let released = self.adapter.close().await.map_err(Error::Adapter);
        info!(session_id = %self.session.id, source = %self.session.source, "closed session");

        marked?;
        released
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::InvalidState(format!("session {} is closed", self.session.id)));
        }
        Ok(())
    }

    fn mismatch(&self, capability: &'static str) -> Error {
        Error::CapabilityMismatch { source_name: self.session.source.clone(), capability }
    }

    fn stamp(&self, response: Response, request: &Request) -> Response {
        response.with_provenance(
            self.policy.mode,
            self.policy.ttl_seconds(),
            request.as_of_bucket.clone(),
            request.cache_tag.clone(),
        )
    }

    async fn from_cache_store(&self, request: &Request) -> Option<Response> {
        let cache = self.cache_store.as_ref()?;
        if !self.policy.consults_cache() {
            return None;
        }
        match cache.get(&request.hash, self.policy.freshness_window()).await {
            Ok(Some(data)) => {
                debug!(request_id = %request.id, hash = %request.hash, "cache store hit");
                let response = Response::from_bytes(&request.id, ResponseStatus::Ok, &data, CACHE_STORE_PATH);
                Some(self.stamp(response, request))
            }
            Ok(None) => None,
            Err(e) => {
                warn!(hash = %request.hash, error = %e, "cache store lookup failed");
                None
            }
        }
    }

    async fn write_through(&self, request: &Request, data: &[u8]) {
        let Some(cache) = &self.cache_store else {
            return;
        };
        if !self.policy.persists() {
            return;
        }
        if let Err(e) = cache.put(&request.hash, data).await {
            warn!(hash = %request.hash, error = %e, "cache store write failed");
        }
    }

    async fn record(&self, request: &Request, status: ResponseStatus, output: NormalizedOutput) -> Result<Response, Error> {
        let NormalizedOutput { result, sidecar } = output;

        if !self.policy.persists() {
            return Ok(self.stamp(Response::ephemeral(&request.id, status, &result), request));
        }

        let path = self.store.write_payload(&result.data).await?;
        let response = Response::from_adapter_result(&request.id, status, &result, path.to_string_lossy());
        if let (Some(meta), Some(checksum)) = (sidecar, response.checksum.as_deref()) {
            self.store.write_metadata(checksum, &meta).await?;
        }

        let response = self.stamp(response, request);
        self.store.insert_response(&response).await?;
        debug!(
            request_id = %request.id,
            response_id = %response.id,
            size = response.size_bytes,
            "recorded response"
        );
        Ok(response)
    }
}

impl fmt::Debug for DataIoSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataIoSession")
            .field("id", &self.session.id)
            .field("source", &self.session.source)
            .field("policy", &self.policy)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Drop for DataIoSession {
    fn drop(&mut self) {
        if !self.closed {
            warn!(session_id = %self.session.id, source = %self.session.source, "session dropped without close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Fetcher, Sender, Streamer};
    use crate::cache_store::{FileCacheStore, MemoryCacheStore};
    use dataio_core::{AdapterError, AdapterResult, DataIoConfig, RequestMethod, StoreRegistry};
    use serde_json::{Value, json};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Returns a distinct payload on every call.
    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
        closes: AtomicUsize,
    }

    impl CountingFetcher {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Fetcher for CountingFetcher {
        async fn fetch(&self, _request: &Request) -> Result<AdapterOutput, AdapterError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let mut headers = BTreeMap::new();
            headers.insert("X-Dummy".to_string(), "1".to_string());
            Ok(AdapterResult {
                content_type: Some("text/plain".into()),
                url: Some("http://example.test".into()),
                elapsed_ms: Some(1),
                headers: Some(headers),
                ..AdapterResult::new(format!("payload-{n}").into_bytes())
            }
            .into())
        }
    }

    #[async_trait::async_trait]
    impl Adapter for CountingFetcher {
        fn source(&self) -> &str {
            "dummy"
        }

        async fn close(&self) -> Result<(), AdapterError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn as_fetcher(&self) -> Option<&dyn Fetcher> {
            Some(self)
        }
    }

    /// Returns the same raw bytes for every request.
    struct RawFetcher;

    #[async_trait::async_trait]
    impl Fetcher for RawFetcher {
        async fn fetch(&self, _request: &Request) -> Result<AdapterOutput, AdapterError> {
            Ok(b"raw-bytes".to_vec().into())
        }
    }

    impl Adapter for RawFetcher {
        fn source(&self) -> &str {
            "raw"
        }

        fn as_fetcher(&self) -> Option<&dyn Fetcher> {
            Some(self)
        }
    }

    /// Acknowledges with a structured summary of what it was sent.
    struct JsonSender;

    #[async_trait::async_trait]
    impl Sender for JsonSender {
        async fn send(&self, _request: &Request, payload: Bytes) -> Result<AdapterOutput, AdapterError> {
            Ok(json!({"accepted": true, "len": payload.len()}).into())
        }
    }

    impl Adapter for JsonSender {
        fn source(&self) -> &str {
            "send_json"
        }

        fn as_sender(&self) -> Option<&dyn Sender> {
            Some(self)
        }
    }

    /// Acknowledges with transport details.
    struct MetaSender;

    #[async_trait::async_trait]
    impl Sender for MetaSender {
        async fn send(&self, _request: &Request, payload: Bytes) -> Result<AdapterOutput, AdapterError> {
            Ok(AdapterResult {
                transport_status: Some(202),
                adapter_meta: json!({"ack": true}).as_object().cloned(),
                ..AdapterResult::new(payload)
            }
            .into())
        }
    }

    impl Adapter for MetaSender {
        fn source(&self) -> &str {
            "send_meta"
        }

        fn as_sender(&self) -> Option<&dyn Sender> {
            Some(self)
        }
    }

    struct FailingFetcher;

    #[async_trait::async_trait]
    impl Fetcher for FailingFetcher {
        async fn fetch(&self, _request: &Request) -> Result<AdapterOutput, AdapterError> {
            Err(std::io::Error::other("upstream exploded").into())
        }
    }

    impl Adapter for FailingFetcher {
        fn source(&self) -> &str {
            "failing"
        }

        fn as_fetcher(&self) -> Option<&dyn Fetcher> {
            Some(self)
        }
    }

    /// Panics mid-fetch.
    #[derive(Default)]
    struct PanickingFetcher {
        closes: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Fetcher for PanickingFetcher {
        async fn fetch(&self, _request: &Request) -> Result<AdapterOutput, AdapterError> {
            panic!("adapter bug");
        }
    }

    #[async_trait::async_trait]
    impl Adapter for PanickingFetcher {
        fn source(&self) -> &str {
            "panicking"
        }

        async fn close(&self) -> Result<(), AdapterError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn as_fetcher(&self) -> Option<&dyn Fetcher> {
            Some(self)
        }
    }

    struct Ticker;

    #[async_trait::async_trait]
    impl Streamer for Ticker {
        async fn stream(&self, _request: &Request, sink: mpsc::Sender<Bytes>) -> Result<(), AdapterError> {
            for tick in ["a", "b", "c"] {
                if sink.send(Bytes::from_static(tick.as_bytes())).await.is_err() {
                    break;
                }
            }
            Ok(())
        }
    }

    impl Adapter for Ticker {
        fn source(&self) -> &str {
            "ticker"
        }

        fn as_streamer(&self) -> Option<&dyn Streamer> {
            Some(self)
        }
    }

    struct Harness {
        dir: TempDir,
        registry: AdapterRegistry,
        store: Arc<Store>,
        fetcher: Arc<CountingFetcher>,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let stores = StoreRegistry::new();
        let store = stores.get_or_create(&DataIoConfig::rooted_at(dir.path().join("dataio"))).await.unwrap();

        let registry = AdapterRegistry::new();
        let fetcher = Arc::new(CountingFetcher::default());
        registry.register_adapter(fetcher.clone()).unwrap();
        let others: [Arc<dyn Adapter>; 5] = [
            Arc::new(RawFetcher),
            Arc::new(JsonSender),
            Arc::new(MetaSender),
            Arc::new(FailingFetcher),
            Arc::new(Ticker),
        ];
        for adapter in others {
            registry.register_adapter(adapter).unwrap();
        }
        Harness { dir, registry, store, fetcher }
    }

    impl Harness {
        /// Open a session, fetch `{"u": "A"}` once, and close.
        async fn fetch_once(&self, options: SessionOptions) -> Result<Response, Error> {
            DataIoSession::scoped(&self.registry, Arc::clone(&self.store), options, async |s: &DataIoSession| {
                let req = s.request_with(RequestSpec::new("http").param("u", "A")).await?;
                s.fetch(&req).await
            })
            .await
        }

        fn sidecar_path(&self, response: &Response) -> std::path::PathBuf {
            self.store.payloads().metadata_path_for(response.checksum.as_deref().unwrap())
        }
    }

    fn dummy() -> SessionOptions {
        SessionOptions::new("dummy")
    }

    #[tokio::test]
    async fn test_session_lifecycle_sets_ended_at() {
        let h = harness().await;
        let mut s = DataIoSession::open(&h.registry, Arc::clone(&h.store), dummy()).await.unwrap();
        let id = s.id().to_string();
        assert!(h.store.get_session(&id).await.unwrap().unwrap().ended_at.is_none());

        s.close().await.unwrap();
        s.close().await.unwrap();
        let row = h.store.get_session(&id).await.unwrap().unwrap();
        assert!(row.ended_at.unwrap() >= row.started_at);
        assert_eq!(h.fetcher.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_unknown_source_fails_fast() {
        let h = harness().await;
        let err = DataIoSession::open(&h.registry, Arc::clone(&h.store), SessionOptions::new("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AdapterNotFound(_)));
        assert!(h.store.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_after_close_is_rejected() {
        let h = harness().await;
        let mut s = DataIoSession::open(&h.registry, Arc::clone(&h.store), dummy()).await.unwrap();
        s.close().await.unwrap();
        assert!(matches!(s.request("http").await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_fetch_persists_request_response_and_payload() {
        let h = harness().await;
        let resp = h.fetch_once(dummy()).await.unwrap();

        assert_eq!(resp.status, ResponseStatus::Ok);
        assert_eq!(std::fs::read(&resp.path).unwrap(), b"payload-1");
        let stored = h.store.get_response(&resp.id).await.unwrap().unwrap();
        assert_eq!(stored.checksum, resp.checksum);
        assert_eq!(stored.path, resp.path);
        assert_eq!(stored.fetched_at.timestamp_micros(), resp.fetched_at.timestamp_micros());
        let req = h.store.get_request(&resp.request_id).await.unwrap().unwrap();
        assert_eq!(req.method, RequestMethod::Get);
    }

    #[tokio::test]
    async fn test_cache_hit_returns_same_response() {
        let h = harness().await;
        let first = h.fetch_once(dummy()).await.unwrap();
        let second = h.fetch_once(dummy()).await.unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(h.store.responses_with_checksum(first.checksum.as_deref().unwrap()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_default_mode_respects_ttl() {
        let h = harness().await;
        let opts = || dummy().as_of_bucket("D");

        let first = h.fetch_once(opts().ttl(Duration::from_secs(1))).await.unwrap();
        let second = h.fetch_once(opts().ttl(Duration::from_secs(10))).await.unwrap();
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(second.path, first.path);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let third = h.fetch_once(opts().ttl(Duration::from_secs(1))).await.unwrap();
        assert_eq!(h.fetcher.calls(), 2);
        assert_ne!(third.checksum, first.checksum);
    }

    #[tokio::test]
    async fn test_only_if_cached_hits_or_misses() {
        let h = harness().await;
        h.fetch_once(dummy().as_of_bucket("B")).await.unwrap();

        let hit = h
            .fetch_once(dummy().cache_mode(CacheMode::OnlyIfCached).ttl(Duration::ZERO).as_of_bucket("B"))
            .await
            .unwrap();
        assert_eq!(hit.as_of_bucket.as_deref(), Some("B"));
        assert_eq!(h.fetcher.calls(), 1);

        let err = h
            .fetch_once(dummy().cache_mode(CacheMode::OnlyIfCached).as_of_bucket("C"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CacheMiss { bucket: Some(ref b), .. } if b == "C"));
        assert_eq!(h.fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_bypass_always_fetches_and_persists() {
        let h = harness().await;
        let opts = || dummy().cache_mode(CacheMode::Bypass).as_of_bucket("X");
        let r1 = h.fetch_once(opts()).await.unwrap();
        let r2 = h.fetch_once(opts()).await.unwrap();
        assert_eq!(h.fetcher.calls(), 2);
        assert_ne!(r1.checksum, r2.checksum);
        assert!(h.store.get_response(&r2.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_never_mode_is_ephemeral() {
        let h = harness().await;
        let r = h.fetch_once(dummy().cache_mode(CacheMode::Never).as_of_bucket("E")).await.unwrap();
        assert_eq!(r.path, dataio_core::model::EPHEMERAL_PATH);
        assert!(r.checksum.is_none());
        assert!(h.store.get_response(&r.id).await.unwrap().is_none());

        h.fetch_once(dummy().as_of_bucket("E")).await.unwrap();
        assert_eq!(h.fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_revalidate_behaves_like_default() {
        let h = harness().await;
        let opts = || dummy().cache_mode(CacheMode::Revalidate).ttl(Duration::from_secs(999)).as_of_bucket("R");
        h.fetch_once(opts()).await.unwrap();
        h.fetch_once(opts()).await.unwrap();
        assert_eq!(h.fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_provenance_fields_present() {
        let h = harness().await;
        let resp = h
            .fetch_once(dummy().ttl(Duration::from_secs(86_400)).as_of_bucket("P").cache_tag("en"))
            .await
            .unwrap();
        assert_eq!(resp.cache_mode, Some(CacheMode::Default));
        assert_eq!(resp.ttl_seconds, Some(86_400.0));
        assert_eq!(resp.as_of_bucket.as_deref(), Some("P"));
        assert_eq!(resp.cache_tag.as_deref(), Some("en"));
    }

    #[tokio::test]
    async fn test_use_cache_shim() {
        let h = harness().await;
        h.fetch_once(dummy().use_cache(true).as_of_bucket("S")).await.unwrap();
        h.fetch_once(dummy().use_cache(true).as_of_bucket("S")).await.unwrap();
        assert_eq!(h.fetcher.calls(), 1);

        h.fetch_once(dummy().cache_mode(CacheMode::OnlyIfCached).use_cache(false).as_of_bucket("S"))
            .await
            .unwrap();
        assert_eq!(h.fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_bucket_lookup_agrees_with_hash_lookup() {
        let h = harness().await;
        let resp = h.fetch_once(dummy().as_of_bucket("L")).await.unwrap();
        let req = h.store.get_request(&resp.request_id).await.unwrap().unwrap();

        let by_hash = h.store.get_cached_response_by_request_hash(&req.hash).await.unwrap().unwrap();
        let by_bucket = h
            .store
            .get_cached_response_by_request_hash_and_bucket(&req.hash, Some("L"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_hash.id, by_bucket.id);
    }

    #[tokio::test]
    async fn test_bucket_and_tag_partition_requests() {
        let h = harness().await;
        let hash_for = |options: SessionOptions| {
            let h = &h;
            async move {
                DataIoSession::scoped(&h.registry, Arc::clone(&h.store), options, async |s: &DataIoSession| {
                    Ok::<_, Error>(s.request_with(RequestSpec::new("http").param("u", "A")).await?.hash)
                })
                .await
                .unwrap()
            }
        };

        let a = hash_for(dummy().as_of_bucket("2025-10-27")).await;
        let b = hash_for(dummy().as_of_bucket("2025-10-28")).await;
        let en = hash_for(dummy().as_of_bucket("T").cache_tag("en")).await;
        let de = hash_for(dummy().as_of_bucket("T").cache_tag("de")).await;
        let ttl_1 = hash_for(dummy().as_of_bucket("K").ttl(Duration::from_secs(1))).await;
        let bypass = hash_for(dummy().as_of_bucket("K").cache_mode(CacheMode::Bypass)).await;
        assert_ne!(a, b);
        assert_ne!(en, de);
        assert_eq!(ttl_1, bypass);
    }

    #[tokio::test]
    async fn test_cache_isolated_by_cache_tag() {
        let h = harness().await;
        h.fetch_once(dummy().as_of_bucket("T2").cache_tag("en")).await.unwrap();
        h.fetch_once(dummy().as_of_bucket("T2").cache_tag("de")).await.unwrap();
        assert_eq!(h.fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_file_cache_store_short_circuit() {
        let h = harness().await;
        let fcs: Arc<dyn CacheStore> = Arc::new(FileCacheStore::open(h.dir.path().join("fcs")).await.unwrap());
        let opts = || dummy().cache_store(Arc::clone(&fcs)).ttl(Duration::from_secs(999)).as_of_bucket("Z");

        let first = h.fetch_once(opts()).await.unwrap();
        assert_eq!(h.fetcher.calls(), 1);

        let second = h.fetch_once(opts()).await.unwrap();
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(second.path, CACHE_STORE_PATH);
        assert_eq!(second.checksum, first.checksum);
        assert!(h.store.get_response(&second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_store_skipped_under_bypass_and_never() {
        let h = harness().await;
        let mem = Arc::new(MemoryCacheStore::new());
        let cache: Arc<dyn CacheStore> = mem.clone();

        h.fetch_once(dummy().cache_store(Arc::clone(&cache)).cache_mode(CacheMode::Never)).await.unwrap();
        assert!(mem.is_empty().await);

        h.fetch_once(dummy().cache_store(Arc::clone(&cache)).cache_mode(CacheMode::Bypass)).await.unwrap();
        assert_eq!(mem.len().await, 1);
        h.fetch_once(dummy().cache_store(Arc::clone(&cache)).cache_mode(CacheMode::Bypass)).await.unwrap();
        assert_eq!(h.fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn test_fetch_result_writes_sidecar() {
        let h = harness().await;
        let resp = h.fetch_once(dummy()).await.unwrap();
        let meta = h.store.read_metadata(resp.checksum.as_deref().unwrap()).await.unwrap();
        assert_eq!(meta["content_type"], json!("text/plain"));
        assert_eq!(meta["headers"], json!({"X-Dummy": "1"}));
        assert!(h.sidecar_path(&resp).exists());
    }

    #[tokio::test]
    async fn test_raw_bytes_have_no_sidecar() {
        let h = harness().await;
        let resp = h.fetch_once(SessionOptions::new("raw")).await.unwrap();
        assert_eq!(resp.size_bytes, 9);
        assert!(resp.content_type.is_none());
        assert!(!h.sidecar_path(&resp).exists());
    }

    #[tokio::test]
    async fn test_use_cache_false_new_response_same_payload() {
        let h = harness().await;
        let opts = || SessionOptions::new("raw").use_cache(false);
        let r1 = h.fetch_once(opts()).await.unwrap();
        let r2 = h.fetch_once(opts()).await.unwrap();
        assert_ne!(r1.id, r2.id);
        assert_eq!(r1.checksum, r2.checksum);
        assert_eq!(r1.path, r2.path);
    }

    #[tokio::test]
    async fn test_send_json_result_is_canonical_and_has_no_sidecar() {
        let h = harness().await;
        let resp = DataIoSession::scoped(
            &h.registry,
            Arc::clone(&h.store),
            SessionOptions::new("send_json"),
            async |s: &DataIoSession| {
                let req = s
                    .request_with(RequestSpec::new("post").method(RequestMethod::Post).body(json!({"y": 2})))
                    .await?;
                s.send(&req, json!({"hello": "world"})).await
            },
        )
        .await
        .unwrap();

        assert_eq!(resp.status, ResponseStatus::Ack);
        let payload = std::fs::read(&resp.path).unwrap();
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value, json!({"accepted": true, "len": br#"{"hello":"world"}"#.len()}));
        assert_eq!(payload, br#"{"accepted":true,"len":17}"#);
        assert!(!h.sidecar_path(&resp).exists());
    }

    #[tokio::test]
    async fn test_send_result_writes_sidecar_and_always_calls_adapter() {
        let h = harness().await;
        let opts = || SessionOptions::new("send_meta").cache_mode(CacheMode::OnlyIfCached);
        let send = |options: SessionOptions| {
            let h = &h;
            async move {
                DataIoSession::scoped(&h.registry, Arc::clone(&h.store), options, async |s: &DataIoSession| {
                    let req = s.request("post").await?;
                    s.send(&req, &b"abc"[..]).await
                })
                .await
                .unwrap()
            }
        };

        let r1 = send(opts()).await;
        let r2 = send(opts()).await;
        assert_ne!(r1.id, r2.id);
        assert_eq!(r1.status, ResponseStatus::Ack);
        let meta = h.store.read_metadata(r1.checksum.as_deref().unwrap()).await.unwrap();
        assert_eq!(meta["transport_status"], json!(202));
        assert_eq!(meta["adapter_meta"], json!({"ack": true}));
    }

    #[tokio::test]
    async fn test_send_never_is_ephemeral() {
        let h = harness().await;
        let resp = DataIoSession::scoped(
            &h.registry,
            Arc::clone(&h.store),
            SessionOptions::new("send_meta").cache_mode(CacheMode::Never),
            async |s: &DataIoSession| {
                let req = s.request("post").await?;
                s.send(&req, &b"abc"[..]).await
            },
        )
        .await
        .unwrap();
        assert!(resp.is_ephemeral());
        assert_eq!(resp.status, ResponseStatus::Ack);
        assert!(h.store.get_response(&resp.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_capability_mismatch() {
        let h = harness().await;
        let err = DataIoSession::scoped(&h.registry, Arc::clone(&h.store), dummy(), async |s: &DataIoSession| {
            let req = s.request("post").await?;
            s.send(&req, &b"x"[..]).await
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::CapabilityMismatch { capability: "send", .. }));

        let err = DataIoSession::scoped(
            &h.registry,
            Arc::clone(&h.store),
            SessionOptions::new("send_json"),
            async |s: &DataIoSession| {
                let req = s.request("get").await?;
                s.fetch(&req).await
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::CapabilityMismatch { capability: "fetch", .. }));
    }

    #[tokio::test]
    async fn test_panic_in_scope_still_closes_session() {
        let h = harness().await;
        let adapter = Arc::new(PanickingFetcher::default());
        h.registry.register_adapter(adapter.clone()).unwrap();

        let outcome = AssertUnwindSafe(h.fetch_once(SessionOptions::new("panicking"))).catch_unwind().await;
        let panic = outcome.err().unwrap();
        assert_eq!(panic.downcast_ref::<&str>(), Some(&"adapter bug"));

        let sessions = h.store.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].ended_at.is_some());
        assert_eq!(adapter.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_adapter_error_propagates_and_session_still_ends() {
        let h = harness().await;
        let err = h.fetch_once(SessionOptions::new("failing")).await.unwrap_err();
        assert!(matches!(err, Error::Adapter(_)));
        assert_eq!(err.to_string(), "upstream exploded");

        let sessions = h.store.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].ended_at.is_some());
    }

    #[tokio::test]
    async fn test_stream_delegates_without_persisting() {
        let h = harness().await;
        let (tx, mut rx) = mpsc::channel(8);
        DataIoSession::scoped(&h.registry, Arc::clone(&h.store), SessionOptions::new("ticker"), async |s: &DataIoSession| {
            let req = s.request("ticks").await?;
            s.stream(&req, tx).await
        })
        .await
        .unwrap();

        let mut got = Vec::new();
        while let Some(chunk) = rx.recv().await {
            got.push(chunk);
        }
        assert_eq!(got, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b"), Bytes::from_static(b"c")]);

        let session_id = h.store.list_sessions().await.unwrap()[0].id.clone();
        let requests = h.store.requests_for_session(&session_id).await.unwrap();
        assert!(h.store.responses_for_request(&requests[0].id).await.unwrap().is_empty());
    }
}
