//! # In-Memory LRU File Cache MSU
//!
//! The representative stateful MSU: an in-memory cache of web documents
//! with least-recently-used eviction, sitting between the HTTP side of a
//! pipeline and the blocking file-reader MSU.
//!
//! Receive semantics follow the message's body:
//!
//! - **Lookup** (empty body): resolve the URL to a path under the document
//!   root. On a hit, move the entry to the LRU tail and forward a filled
//!   200 response (MIME inferred from the extension) toward the write
//!   type; on a miss, forward the request to the file-reader type.
//! - **Store** (non-empty body): a response coming back from the file
//!   reader. Skip files too large for the configured budget, evict from
//!   the LRU head until both the byte and file budgets hold, insert at the
//!   tail.
//!
//! ## Invariants
//!
//! The hash index and the LRU list always contain the same entries; the
//! file count equals the index size; the byte total equals the sum of
//! entry sizes; head is least-recently-touched, tail most-recently. The
//! list itself is an index arena (slot vector with prev/next indices), so
//! no reference cycles exist and the structure is directly checkable; see
//! [`LruFileCache::check_consistency`].

use crate::error::{CoreError, CoreResult};
use crate::message::{Envelope, MsuTypeId};
use crate::msu::{MsuContext, MsuKind, MsuTypeSpec};
use crate::routing::RouteStrategy;
use crate::runtime::Runtime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Wire-stable type ids of the bundled webserver MSUs.
pub const WRITE_MSU_TYPE_ID: MsuTypeId = 554;
pub const CACHE_MSU_TYPE_ID: MsuTypeId = 555;
pub const FILEIO_MSU_TYPE_ID: MsuTypeId = 556;

/// The response object web pipeline MSUs pass along.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebResponse {
    pub url: String,
    pub path: String,
    pub code: u16,
    pub mime_type: Option<String>,
    pub header: String,
    pub body: Vec<u8>,
}

impl WebResponse {
    pub fn request(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            path: String::new(),
            code: 0,
            mime_type: None,
            header: String::new(),
            body: Vec::new(),
        }
    }

    pub fn to_payload(&self) -> CoreResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> CoreResult<Self> {
        Ok(bincode::deserialize(payload)?)
    }
}

/// Resolve a request URL to a filesystem path under the document root.
///
/// The query string is ignored and parent-directory components are
/// stripped so a request cannot escape the root.
pub fn url_to_path(url: &str, www_dir: &Path) -> PathBuf {
    let path_part = url.split(['?', '#']).next().unwrap_or("");
    let mut path = www_dir.to_path_buf();
    for component in path_part.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            continue;
        }
        path.push(component);
    }
    path
}

/// Infer a MIME type from a path extension.
pub fn path_to_mimetype(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

/// Render the response status line and headers.
pub fn generate_header(code: u16, body_len: usize, mime_type: Option<&str>) -> String {
    let reason = match code {
        200 => "OK",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let mut header = format!("HTTP/1.1 {code} {reason}\r\nContent-Length: {body_len}\r\n");
    if let Some(mime) = mime_type {
        header.push_str(&format!("Content-Type: {mime}\r\n"));
    }
    header.push_str("\r\n");
    header
}

/// Outcome of a store attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Inserted; the named entries were evicted to make room.
    Stored { evicted: Vec<String> },
    /// The file exceeds the cache's per-file budget and was not cached.
    TooLarge,
}

struct CacheEntry {
    path: String,
    contents: Vec<u8>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// LRU-evicting file cache over an index arena.
pub struct LruFileCache {
    max_files: usize,
    max_kb_size: u64,
    max_occupancy_rate: f32,
    byte_size: u64,
    slots: Vec<Option<CacheEntry>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl LruFileCache {
    pub fn new(max_files: usize, max_kb_size: u64, max_occupancy_rate: f32) -> Self {
        Self {
            max_files,
            max_kb_size,
            max_occupancy_rate,
            byte_size: 0,
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn file_count(&self) -> usize {
        self.index.len()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }

    /// Entry paths from LRU head (coldest) to tail (hottest).
    pub fn lru_order(&self) -> Vec<String> {
        let mut order = Vec::with_capacity(self.index.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let entry = self.slots[idx].as_ref().expect("linked slot occupied");
            order.push(entry.path.clone());
            cursor = entry.next;
        }
        order
    }

    /// Fetch a cached file and mark it most recently used.
    pub fn lookup(&mut self, path: &str) -> Option<&[u8]> {
        let idx = *self.index.get(path)?;
        debug!(path, "cache hit");
        self.detach(idx);
        self.attach_tail(idx);
        self.slots[idx].as_ref().map(|e| e.contents.as_slice())
    }

    /// Insert a file, evicting from the head until the budgets hold.
    pub fn store(&mut self, path: &str, contents: Vec<u8>) -> StoreOutcome {
        let length = contents.len() as u64;
        let kbytes = length as f32 / 1024.0;
        if kbytes > self.max_kb_size as f32
            || kbytes / self.max_kb_size as f32 > self.max_occupancy_rate
        {
            info!(path, length, "file too large for cache");
            return StoreOutcome::TooLarge;
        }

        // A refreshed path replaces its old entry rather than duplicating.
        if let Some(&idx) = self.index.get(path) {
            self.evict_slot(idx);
        }

        let byte_budget = self.max_kb_size.saturating_mul(1024);
        let mut evicted = Vec::new();
        while self.byte_size + length > byte_budget || self.index.len() >= self.max_files {
            let Some(head) = self.head else {
                // Nothing left to evict and still over budget.
                warn!(path, length, "cannot make room in cache");
                return StoreOutcome::TooLarge;
            };
            evicted.push(self.evict_slot(head));
        }
        for path in &evicted {
            info!(%path, "evicted from cache");
        }

        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(CacheEntry {
                    path: path.to_string(),
                    contents,
                    prev: None,
                    next: None,
                });
                idx
            }
            None => {
                self.slots.push(Some(CacheEntry {
                    path: path.to_string(),
                    contents,
                    prev: None,
                    next: None,
                }));
                self.slots.len() - 1
            }
        };
        self.index.insert(path.to_string(), idx);
        self.attach_tail(idx);
        self.byte_size += length;
        debug!(path, length, "added to cache");
        StoreOutcome::Stored { evicted }
    }

    fn evict_slot(&mut self, idx: usize) -> String {
        self.detach(idx);
        let entry = self.slots[idx].take().expect("evicting occupied slot");
        self.index.remove(&entry.path);
        self.byte_size -= entry.contents.len() as u64;
        self.free.push(idx);
        entry.path
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let entry = self.slots[idx].as_ref().expect("detaching occupied slot");
            (entry.prev, entry.next)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().next = next,
            None if self.head == Some(idx) => self.head = next,
            None => {}
        }
        match next {
            Some(n) => self.slots[n].as_mut().unwrap().prev = prev,
            None if self.tail == Some(idx) => self.tail = prev,
            None => {}
        }
        let entry = self.slots[idx].as_mut().unwrap();
        entry.prev = None;
        entry.next = None;
    }

    fn attach_tail(&mut self, idx: usize) {
        let old_tail = self.tail;
        {
            let entry = self.slots[idx].as_mut().expect("attaching occupied slot");
            entry.prev = old_tail;
            entry.next = None;
        }
        if let Some(t) = old_tail {
            self.slots[t].as_mut().unwrap().next = Some(idx);
        }
        self.tail = Some(idx);
        if self.head.is_none() {
            self.head = Some(idx);
        }
    }

    /// Verify the structural invariants; returns a description of the
    /// first violation found.
    pub fn check_consistency(&self) -> Result<(), String> {
        let occupied = self.slots.iter().filter(|s| s.is_some()).count();
        if occupied != self.index.len() {
            return Err(format!(
                "{} occupied slots but {} indexed paths",
                occupied,
                self.index.len()
            ));
        }
        let order = self.lru_order();
        if order.len() != self.index.len() {
            return Err(format!(
                "LRU list has {} entries, index has {}",
                order.len(),
                self.index.len()
            ));
        }
        let total: u64 = self
            .slots
            .iter()
            .flatten()
            .map(|e| e.contents.len() as u64)
            .sum();
        if total != self.byte_size {
            return Err(format!(
                "byte_size {} but entries sum to {}",
                self.byte_size, total
            ));
        }
        for path in &order {
            if !self.index.contains_key(path) {
                return Err(format!("LRU entry {path} missing from index"));
            }
        }
        if let Some(tail) = self.tail {
            if self.slots[tail].as_ref().unwrap().next.is_some() {
                return Err("tail has a successor".to_string());
            }
        }
        if let Some(head) = self.head {
            if self.slots[head].as_ref().unwrap().prev.is_some() {
                return Err("head has a predecessor".to_string());
            }
        }
        Ok(())
    }
}

/// Configuration parsed from the cache MSU's init data.
///
/// The init string is whitespace-separated
/// `max_files max_kb_size max_occupancy_rate www_dir`, every field
/// optional from the left.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub max_files: usize,
    pub max_kb_size: u64,
    pub max_occupancy_rate: f32,
    pub www_dir: PathBuf,
}

impl CacheConfig {
    pub fn parse(init_data: &[u8], default_www: &Path) -> CoreResult<Self> {
        let text = std::str::from_utf8(init_data).map_err(|err| CoreError::InitFailure {
            msu_id: 0,
            reason: format!("cache init data is not UTF-8: {err}"),
        })?;
        let mut fields = text.split_whitespace();
        let mut config = Self {
            max_files: crate::defaults::CACHE_MAX_FILES,
            max_kb_size: crate::defaults::CACHE_MAX_KB,
            max_occupancy_rate: crate::defaults::CACHE_OCCUPANCY_RATE,
            www_dir: default_www.to_path_buf(),
        };
        if let Some(field) = fields.next() {
            config.max_files = field.parse().map_err(bad_init)?;
        }
        if let Some(field) = fields.next() {
            config.max_kb_size = field.parse().map_err(bad_init)?;
        }
        if let Some(field) = fields.next() {
            config.max_occupancy_rate = field.parse().map_err(bad_init)?;
        }
        if let Some(field) = fields.next() {
            config.www_dir = PathBuf::from(field);
        }
        Ok(config)
    }
}

fn bad_init(err: impl std::fmt::Display) -> CoreError {
    CoreError::InitFailure {
        msu_id: 0,
        reason: format!("bad cache init field: {err}"),
    }
}

/// The cache MSU itself: config plus the LRU store.
pub struct CacheMsu {
    cache: LruFileCache,
    www_dir: PathBuf,
}

impl CacheMsu {
    pub fn from_init(init_data: &[u8], default_www: &Path) -> CoreResult<Self> {
        let config = CacheConfig::parse(init_data, default_www)?;
        Ok(Self {
            cache: LruFileCache::new(
                config.max_files,
                config.max_kb_size,
                config.max_occupancy_rate,
            ),
            www_dir: config.www_dir,
        })
    }

    #[cfg(test)]
    pub fn cache(&self) -> &LruFileCache {
        &self.cache
    }
}

impl MsuKind for CacheMsu {
    fn receive(&mut self, ctx: &mut MsuContext<'_>, env: Envelope) -> CoreResult<()> {
        let mut resp = WebResponse::from_payload(&env.payload)?;
        resp.path = url_to_path(&resp.url, &self.www_dir)
            .to_string_lossy()
            .into_owned();

        if resp.body.is_empty() {
            // Lookup path.
            if let Some(contents) = self.cache.lookup(&resp.path) {
                resp.code = 200;
                resp.body = contents.to_vec();
                let mime = path_to_mimetype(Path::new(&resp.path));
                resp.mime_type = Some(mime.to_string());
                resp.header = generate_header(200, resp.body.len(), Some(mime));
                ctx.call_type(WRITE_MSU_TYPE_ID, env.key, resp.to_payload()?)
            } else {
                // Miss: hand the request to the blocking file reader.
                ctx.call_type(FILEIO_MSU_TYPE_ID, env.key, resp.to_payload()?)
            }
        } else {
            // Store path: a filled response came back from the reader.
            let outcome = self.cache.store(&resp.path, resp.body);
            debug!(path = %resp.path, ?outcome, "cache store");
            Ok(())
        }
    }
}

/// Register the cache type in a runtime's registry.
pub fn register(runtime: &Runtime) -> CoreResult<()> {
    let www_dir = runtime.config.www_dir.clone();
    runtime.types.register(MsuTypeSpec::new(
        CACHE_MSU_TYPE_ID,
        "webserver-cache",
        RouteStrategy::ShortestQueue,
        Arc::new(move |init_data: &[u8]| {
            Ok(Box::new(CacheMsu::from_init(init_data, &www_dir)?) as Box<dyn MsuKind>)
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn kb(n: usize) -> Vec<u8> {
        vec![0xAB; n * 1024]
    }

    #[test]
    fn eviction_follows_lru_order() {
        // 4KB budget, full occupancy allowed, file budget irrelevant.
        let mut cache = LruFileCache::new(100, 4, 1.0);
        assert!(matches!(
            cache.store("f1", kb(2)),
            StoreOutcome::Stored { .. }
        ));
        assert!(matches!(
            cache.store("f2", kb(2)),
            StoreOutcome::Stored { .. }
        ));
        // Touch f1 so f2 becomes the eviction candidate.
        assert!(cache.lookup("f1").is_some());
        let outcome = cache.store("f3", kb(2));
        assert_eq!(
            outcome,
            StoreOutcome::Stored {
                evicted: vec!["f2".to_string()]
            }
        );

        assert!(cache.contains("f1"));
        assert!(!cache.contains("f2"));
        assert!(cache.contains("f3"));
        assert_eq!(cache.byte_size(), 4096);
        assert_eq!(cache.lru_order(), vec!["f1".to_string(), "f3".to_string()]);
        cache.check_consistency().unwrap();
    }

    #[test]
    fn oversized_files_are_not_cached() {
        let mut cache = LruFileCache::new(100, 4, 1.0);
        assert_eq!(cache.store("big", kb(5)), StoreOutcome::TooLarge);
        assert_eq!(cache.file_count(), 0);

        // Occupancy rate binds before the absolute budget does.
        let mut cache = LruFileCache::new(100, 100, 0.02);
        assert_eq!(cache.store("wide", kb(3)), StoreOutcome::TooLarge);
        cache.check_consistency().unwrap();
    }

    #[test]
    fn file_count_budget_evicts_from_the_head() {
        let mut cache = LruFileCache::new(2, 1024, 1.0);
        cache.store("a", kb(1));
        cache.store("b", kb(1));
        cache.store("c", kb(1));
        assert_eq!(cache.file_count(), 2);
        assert!(!cache.contains("a"));
        assert_eq!(cache.lru_order(), vec!["b".to_string(), "c".to_string()]);
        cache.check_consistency().unwrap();
    }

    #[test]
    fn storing_an_existing_path_refreshes_it() {
        let mut cache = LruFileCache::new(10, 1024, 1.0);
        cache.store("a", kb(1));
        cache.store("b", kb(1));
        cache.store("a", kb(2));
        assert_eq!(cache.file_count(), 2);
        assert_eq!(cache.byte_size(), 3 * 1024);
        assert_eq!(cache.lru_order(), vec!["b".to_string(), "a".to_string()]);
        cache.check_consistency().unwrap();
    }

    /// Randomized workload: the invariants and budgets hold after every
    /// operation.
    #[test]
    fn invariants_hold_under_random_workload() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut cache = LruFileCache::new(8, 16, 1.0);
        for step in 0..500 {
            let path = format!("file-{}", rng.gen_range(0..20));
            if rng.gen_bool(0.5) {
                let size = rng.gen_range(0..4096);
                cache.store(&path, vec![1; size]);
            } else {
                cache.lookup(&path);
            }
            cache
                .check_consistency()
                .unwrap_or_else(|msg| panic!("step {step}: {msg}"));
            assert!(cache.byte_size() / 1024 <= 16, "byte budget exceeded");
            assert!(cache.file_count() <= 8, "file budget exceeded");
        }
    }

    #[test]
    fn url_resolution_stays_under_the_root() {
        let root = Path::new("www");
        assert_eq!(
            url_to_path("/index.html?q=1", root),
            PathBuf::from("www/index.html")
        );
        assert_eq!(
            url_to_path("/../../etc/passwd", root),
            PathBuf::from("www/etc/passwd")
        );
        assert_eq!(url_to_path("a/b/c.css", root), PathBuf::from("www/a/b/c.css"));
    }

    #[test]
    fn mime_types_follow_extensions() {
        assert_eq!(path_to_mimetype(Path::new("x/index.html")), "text/html");
        assert_eq!(path_to_mimetype(Path::new("s.css")), "text/css");
        assert_eq!(
            path_to_mimetype(Path::new("blob.bin")),
            "application/octet-stream"
        );
    }

    #[test]
    fn init_data_parses_from_the_left() {
        let defaults = CacheConfig::parse(b"", Path::new("www")).unwrap();
        assert_eq!(defaults.max_files, crate::defaults::CACHE_MAX_FILES);
        assert_eq!(defaults.www_dir, PathBuf::from("www"));

        let full = CacheConfig::parse(b"100 4 0.5 /srv/site", Path::new("www")).unwrap();
        assert_eq!(full.max_files, 100);
        assert_eq!(full.max_kb_size, 4);
        assert!((full.max_occupancy_rate - 0.5).abs() < f32::EPSILON);
        assert_eq!(full.www_dir, PathBuf::from("/srv/site"));

        assert!(CacheConfig::parse(b"many", Path::new("www")).is_err());
    }

    #[test]
    fn response_payload_round_trips() {
        let mut resp = WebResponse::request("/index.html");
        resp.body = b"<html></html>".to_vec();
        let payload = resp.to_payload().unwrap();
        assert_eq!(WebResponse::from_payload(&payload).unwrap(), resp);
    }
}
