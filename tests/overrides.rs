mod support;

use std::sync::Arc;

use quarry::prelude::*;
use support::MemLoader;

/// Abstract base; only ever requested, never allocated.
struct Image;

impl ResourceKind for Image {
    type Value = Vec<u8>;
}

struct PlainImage;

impl ResourceKind for PlainImage {
    type Value = Vec<u8>;
}

impl Register for PlainImage {
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
}

struct CompressedImage;

impl ResourceKind for CompressedImage {
    type Value = Vec<u8>;
}

impl Register for CompressedImage {
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
        // tag the content so tests can tell which register ran
        let mut out = b"dds:".to_vec();
        out.extend(item);
        Ok(out)
    }
}

fn setup() -> (ResourceManager, Arc<MemLoader>) {
    let _ = env_logger::try_init();
    let loader = MemLoader::new();

    let manager = ResourceManager::new(Arc::new(ThreadPool::new(2)));
    let image = manager
        .register_abstract_type::<Image>(TypeDescriptor {
            name: "Image",
            ..Default::default()
        })
        .unwrap();
    manager
        .register_type(
            TypeDescriptor {
                name: "PlainImage",
                parent: Some(image),
                ..Default::default()
            },
            PlainImage,
        )
        .unwrap();
    manager
        .register_type(
            TypeDescriptor {
                name: "CompressedImage",
                parent: Some(image),
                ..Default::default()
            },
            CompressedImage,
        )
        .unwrap();

    manager
        .register_override::<CompressedImage>(|id| id.ends_with(".dds"))
        .unwrap();
    manager
        .register_override::<PlainImage>(|id| id.ends_with(".png"))
        .unwrap();

    manager.set_default_loader(Some(loader.clone()));
    (manager, loader)
}

#[test]
fn base_requests_redirect_by_resolved_id() {
    let (manager, loader) = setup();
    loader.put("tex/wall.dds", b"blocks");
    loader.put("tex/ui.png", b"pixels");

    let compressed = manager.load::<Image>("tex/wall.dds").unwrap();
    let content = manager.begin_acquire(&compressed);
    assert_eq!(*content, b"dds:blocks".to_vec());

    let plain = manager.load::<Image>("tex/ui.png").unwrap();
    let content = manager.begin_acquire(&plain);
    assert_eq!(*content, b"pixels".to_vec());

    assert_ne!(compressed.untyped().type_id(), plain.untyped().type_id());
}

#[test]
fn base_and_derived_requests_share_one_instance() {
    let (manager, loader) = setup();
    loader.put("tex/rock.dds", b"rock");

    let via_base = manager.load::<Image>("tex/rock.dds").unwrap();
    let via_derived = manager.load::<CompressedImage>("tex/rock.dds").unwrap();
    assert!(via_base.untyped().ptr_eq(via_derived.untyped()));
}

#[test]
fn unmatched_abstract_request_is_an_error() {
    let (manager, _loader) = setup();

    let err = manager.load::<Image>("tex/unknown.xyz").unwrap_err();
    let err = err.downcast_ref::<ResourceError>();
    assert!(matches!(err, Some(ResourceError::AbstractType(_))));
}
