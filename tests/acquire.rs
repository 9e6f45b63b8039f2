mod support;

use std::time::Duration;

use quarry::prelude::*;
use support::{setup, Blob, MemLoader};

#[test]
fn loading_fallback_then_real_content() {
    let loader = MemLoader::with_delay(Duration::from_millis(300));
    loader.put("tex/wall", b"real");
    let manager = setup(loader);
    let shared = manager.shared();

    let fallback = shared.create::<Blob>("tex/pink", b"pink".to_vec()).unwrap();
    shared
        .set_type_loading_fallback::<Blob>(Some(fallback))
        .unwrap();

    let handle = shared.load::<Blob>("tex/wall").unwrap();

    {
        let content =
            shared.begin_acquire_with(&handle, AcquireMode::AllowLoadingFallback, None);
        assert_eq!(content.kind(), AcquireKind::LoadingFallback);
        assert_eq!(*content, b"pink".to_vec());
    }

    {
        let content = shared.begin_acquire(&handle);
        assert_eq!(content.kind(), AcquireKind::Final);
        assert_eq!(*content, b"real".to_vec());
    }

    // once loaded, fallback mode returns the real thing too
    let content =
        shared.begin_acquire_with(&handle, AcquireMode::AllowLoadingFallback, None);
    assert_eq!(content.kind(), AcquireKind::Final);
}

#[test]
fn fallback_order_instance_then_call_site_then_type() {
    let loader = MemLoader::with_delay(Duration::from_millis(300));
    loader.put("mat/a", b"a");
    loader.put("mat/b", b"b");
    let manager = setup(loader);
    let shared = manager.shared();

    let type_fb = shared.create::<Blob>("fb/type", b"type".to_vec()).unwrap();
    let site_fb = shared.create::<Blob>("fb/site", b"site".to_vec()).unwrap();
    let inst_fb = shared.create::<Blob>("fb/inst", b"inst".to_vec()).unwrap();

    shared
        .set_type_loading_fallback::<Blob>(Some(type_fb))
        .unwrap();

    // no instance fallback: call-site wins over type
    let plain = shared.load::<Blob>("mat/a").unwrap();
    {
        let content = shared.begin_acquire_with(
            &plain,
            AcquireMode::AllowLoadingFallback,
            Some(&site_fb),
        );
        assert_eq!(content.kind(), AcquireKind::LoadingFallback);
        assert_eq!(*content, b"site".to_vec());
    }

    // instance fallback wins over both
    let with_inst = shared.load_with_fallback::<Blob>("mat/b", inst_fb).unwrap();
    let content = shared.begin_acquire_with(
        &with_inst,
        AcquireMode::AllowLoadingFallback,
        Some(&site_fb),
    );
    assert_eq!(content.kind(), AcquireKind::LoadingFallback);
    assert_eq!(*content, b"inst".to_vec());
}

#[test]
fn missing_resource_substitutes_the_missing_fallback() {
    let loader = MemLoader::new();
    let manager = setup(loader);
    let shared = manager.shared();

    let fallback = shared
        .create::<Blob>("fb/missing", b"checkerboard".to_vec())
        .unwrap();
    shared
        .set_type_missing_fallback::<Blob>(Some(fallback))
        .unwrap();

    let handle = shared.load::<Blob>("tex/not-on-disk").unwrap();
    let content = shared.begin_acquire(&handle);
    assert_eq!(content.kind(), AcquireKind::MissingFallback);
    assert_eq!(*content, b"checkerboard".to_vec());
    assert_eq!(handle.state(), ResourceState::LoadedResourceMissing);
}

#[test]
#[should_panic(expected = "could not be loaded")]
fn missing_resource_without_fallback_panics() {
    let manager = setup(MemLoader::new());
    let shared = manager.shared();

    let handle = shared.load::<Blob>("tex/not-on-disk").unwrap();
    let _content = shared.begin_acquire(&handle);
}

#[test]
fn force_no_fallback_upgrades_to_blocking() {
    let loader = MemLoader::with_delay(Duration::from_millis(100));
    loader.put("tex/floor", b"real");
    let manager = setup(loader);
    let shared = manager.shared();

    let fallback = shared.create::<Blob>("fb/load", b"stand-in".to_vec()).unwrap();
    shared
        .set_type_loading_fallback::<Blob>(Some(fallback))
        .unwrap();

    shared.force_no_fallback(100);

    let handle = shared.load::<Blob>("tex/floor").unwrap();
    let content =
        shared.begin_acquire_with(&handle, AcquireMode::AllowLoadingFallback, None);
    assert_eq!(content.kind(), AcquireKind::Final);
    assert_eq!(*content, b"real".to_vec());
}

#[test]
fn end_acquire_releases_the_guard() {
    let loader = MemLoader::new();
    loader.put("a", b"1");
    let manager = setup(loader);
    let shared = manager.shared();

    let handle = shared.load::<Blob>("a").unwrap();
    let guard = shared.begin_acquire(&handle);
    shared.end_acquire(guard);

    // re-acquiring after release works
    let again = shared.begin_acquire(&handle);
    assert_eq!(again.kind(), AcquireKind::Final);
}
