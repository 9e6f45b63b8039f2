#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use failure::format_err;

use quarry::prelude::*;

/// A trivial binary-blob resource; content is the raw bytes.
pub struct Blob;

impl ResourceKind for Blob {
    type Value = Vec<u8>;
}

impl Register for Blob {
    type Intermediate = Vec<u8>;

    fn load(&self, _id: &str, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    fn attach(
        &self,
        _env: &ResourceManagerShared,
        _id: &str,
        item: Vec<u8>,
    ) -> Result<Vec<u8>> {
        Ok(item)
    }

    fn memory_usage(&self, value: &Vec<u8>) -> MemoryUsage {
        MemoryUsage {
            cpu: value.len() as u64,
            gpu: 0,
        }
    }
}

/// An in-memory loader with controllable contents, latency and staleness.
pub struct MemLoader {
    files: Mutex<HashMap<String, Vec<u8>>>,
    delay: Duration,
    loads: AtomicUsize,
    outdated: AtomicBool,
}

impl MemLoader {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::from_millis(0))
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(MemLoader {
            files: Mutex::new(HashMap::new()),
            delay,
            loads: AtomicUsize::new(0),
            outdated: AtomicBool::new(true),
        })
    }

    pub fn put(&self, id: &str, bytes: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(id.to_string(), bytes.to_vec());
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn set_outdated(&self, outdated: bool) {
        self.outdated.store(outdated, Ordering::SeqCst);
    }
}

impl ResourceTypeLoader for MemLoader {
    fn load(&self, id: &str) -> Result<Vec<u8>> {
        if self.delay > Duration::from_millis(0) {
            thread::sleep(self.delay);
        }

        self.loads.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| format_err!("no such file '{}'", id))
    }

    fn is_outdated(&self, _id: &str) -> bool {
        self.outdated.load(Ordering::SeqCst)
    }
}

/// A manager with the `Blob` type registered against `loader`.
pub fn setup(loader: Arc<MemLoader>) -> ResourceManager {
    let _ = env_logger::try_init();

    let manager = ResourceManager::new(Arc::new(ThreadPool::new(4)));
    manager
        .register_type(
            TypeDescriptor {
                name: "Blob",
                ..Default::default()
            },
            Blob,
        )
        .unwrap();
    manager.register_type_loader::<Blob>(loader).unwrap();
    manager
}

/// Polls until `probe` holds, panicking after five seconds.
pub fn wait_until(what: &str, probe: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !probe() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}
