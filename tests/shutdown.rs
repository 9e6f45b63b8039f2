mod support;

use std::sync::{Arc, Mutex};

use log::{Level, LevelFilter, Log, Metadata, Record};

use quarry::prelude::*;
use support::{setup, Blob, MemLoader};

/// Collects error-level log records so tests can assert on them.
struct ErrorCapture(Arc<Mutex<Vec<String>>>);

impl Log for ErrorCapture {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Error
    }

    fn log(&self, record: &Record) {
        if record.level() == Level::Error {
            self.0.lock().unwrap().push(record.args().to_string());
        }
    }

    fn flush(&self) {}
}

#[test]
fn core_shutdown_reports_only_real_leaks() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    log::set_boxed_logger(Box::new(ErrorCapture(errors.clone()))).unwrap();
    log::set_max_level(LevelFilter::Error);

    // fallback handles are the manager's own references, not leaks
    {
        let loader = MemLoader::new();
        loader.put("tex/pink", b"pink");
        loader.put("tex/checker", b"checker");
        loader.put("tex/wall", b"bricks");
        let manager = setup(loader);
        let shared = manager.shared();

        let loading = shared.load::<Blob>("tex/pink").unwrap();
        shared.force_load_now(loading.untyped());
        shared.set_type_loading_fallback(Some(loading)).unwrap();

        let missing = shared.load::<Blob>("tex/checker").unwrap();
        shared.force_load_now(missing.untyped());
        shared.set_type_missing_fallback(Some(missing)).unwrap();

        let instance_fb = shared.load::<Blob>("tex/pink").unwrap();
        let wall = shared
            .load_with_fallback("tex/wall", instance_fb)
            .unwrap();
        drop(wall);

        manager.on_core_shutdown();
    }
    assert_eq!(*errors.lock().unwrap(), Vec::<String>::new());

    // a handle the host still holds at teardown is reported
    let loader = MemLoader::new();
    loader.put("tex/held", b"x");
    let manager = setup(loader);
    let held = manager.shared().load::<Blob>("tex/held").unwrap();
    manager.on_core_shutdown();

    assert!(errors
        .lock()
        .unwrap()
        .iter()
        .any(|m| m.contains("tex/held")));
    drop(held);
}
