//! End-to-end captures of well-formed volumes

use super::test_utils::{capture_image, DEVICE};
use volcap::config::CaptureConfig;
use volcap::security::{SecurityData, SecurityIndex};
use volcap::store::{StreamLocation, StreamStore};
use volcap::tree::hasher::compute_hash;
use volcap::tree::{capture, Dentry, ImageCapture};
use volcap::volume::memory::DEFAULT_SECURITY_DESCRIPTOR;
use volcap::volume::{attributes, MemoryVolume};

#[test]
fn test_identical_content_shares_one_record() {
    let mut builder = MemoryVolume::builder(DEVICE);
    let root = builder.root();
    builder.file(root, "a", b"X");
    builder.file(root, "b", b"X");
    builder.file(root, "c", b"Y");
    let image = capture_image(&builder.build()).unwrap();

    assert_eq!(image.streams.len(), 2);
    let x = image.streams.get(&compute_hash(b"X")).unwrap();
    let y = image.streams.get(&compute_hash(b"Y")).unwrap();
    assert_eq!(x.refcount(), 2);
    assert_eq!(y.refcount(), 1);

    let a = image.root.find("/a").unwrap();
    let b = image.root.find("/b").unwrap();
    assert_eq!(a.stream, b.stream);
    assert_eq!(image.stats.unique_streams, 2);
    assert_eq!(image.stats.shared_references, 1);
}

#[test]
fn test_n_files_over_k_blobs() {
    let blobs: [&[u8]; 3] = [b"first blob", b"second blob", b"third blob"];
    let mut builder = MemoryVolume::builder(DEVICE);
    let dir = builder.directory(builder.root(), "many");
    for i in 0..10 {
        builder.file(dir, &format!("f{}", i), blobs[i % blobs.len()]);
    }
    let image = capture_image(&builder.build()).unwrap();

    assert_eq!(image.streams.len(), 3);
    assert_eq!(image.streams.total_refcount(), 10);
    let refcounts: Vec<u32> = blobs
        .iter()
        .map(|blob| image.streams.get(&compute_hash(blob)).unwrap().refcount())
        .collect();
    assert_eq!(refcounts, vec![4, 3, 3]);
}

#[test]
fn test_identical_descriptors_share_id() {
    let mut builder = MemoryVolume::builder(DEVICE);
    let root = builder.root();
    builder.file(root, "one", b"1");
    builder.file(root, "two", b"2");
    let special = builder.file(root, "special", b"3");
    builder.security(special, b"O:SYG:SYD:P(A;;FA;;;SY)");
    let image = capture_image(&builder.build()).unwrap();

    assert_eq!(image.security.len(), 2);
    assert_eq!(image.root.security_id, Some(0));
    assert_eq!(image.root.find("/one").unwrap().security_id, Some(0));
    assert_eq!(image.root.find("/two").unwrap().security_id, Some(0));
    assert_eq!(image.root.find("/special").unwrap().security_id, Some(1));
    assert_eq!(image.security.get(1), Some(&b"O:SYG:SYD:P(A;;FA;;;SY)"[..]));
    assert_eq!(image.stats.security_descriptors, 2);
}

#[test]
fn test_empty_descriptor_means_none() {
    let mut builder = MemoryVolume::builder(DEVICE);
    let file = builder.file(builder.root(), "bare", b"data");
    builder.security(file, b"");
    builder.raw_security_id(file, 42);
    let image = capture_image(&builder.build()).unwrap();

    assert_eq!(image.root.find("/bare").unwrap().security_id, None);
    assert_eq!(image.security.len(), 1);
}

#[test]
fn test_empty_directory() {
    let mut builder = MemoryVolume::builder(DEVICE);
    builder.directory(builder.root(), "empty");
    let image = capture_image(&builder.build()).unwrap();

    let empty = image.root.find("/empty").unwrap();
    assert!(empty.is_directory());
    assert!(empty.children.is_empty());
    assert!(empty.stream.is_none());
    assert!(empty.named_streams.is_empty());
}

#[test]
fn test_reparse_point_has_primary_stream_only() {
    let payload = b"\x0c\x00\x00\xa0 symlink payload";
    let mut builder = MemoryVolume::builder(DEVICE);
    builder.reparse_point(builder.root(), "link", payload);
    let image = capture_image(&builder.build()).unwrap();

    let link = image.root.find("/link").unwrap();
    assert!(link.is_reparse_point());
    assert!(link.children.is_empty());
    assert!(link.named_streams.is_empty());
    let record = image.streams.get(&link.stream.unwrap()).unwrap();
    assert_eq!(record.size(), payload.len() as u64);
    assert_eq!(image.read_primary_stream("/link").unwrap(), payload);
    assert_eq!(image.stats.reparse_points, 1);
}

#[test]
fn test_named_streams_are_counted_as_references() {
    let mut builder = MemoryVolume::builder(DEVICE);
    let root = builder.root();
    let file = builder.file(root, "doc.txt", b"body");
    builder.named_stream(file, "Zone.Identifier", b"[ZoneTransfer]");
    builder.file(root, "copy.txt", b"[ZoneTransfer]");
    let image = capture_image(&builder.build()).unwrap();

    let doc = image.root.find("/doc.txt").unwrap();
    assert_eq!(doc.named_streams.len(), 1);
    assert_eq!(doc.named_streams[0].name, "Zone.Identifier");
    let zone = image.streams.get(&doc.named_streams[0].stream).unwrap();
    assert_eq!(zone.refcount(), 2);
    assert_eq!(image.streams.total_refcount(), 3);
    assert_eq!(image.stats.named_streams, 1);
}

#[test]
fn test_deep_paths_are_separated() {
    let mut builder = MemoryVolume::builder(DEVICE);
    let a = builder.directory(builder.root(), "a");
    let b = builder.directory(a, "b");
    builder.file(b, "c.txt", b"deep");
    builder.file(a, "sibling.txt", b"shallow");
    let volume = builder.build();
    let image = capture_image(&volume).unwrap();

    assert_eq!(
        volume.opened_paths(),
        vec!["/", "/a", "/a/b", "/a/b/c.txt", "/a/sibling.txt"]
    );
    match image.primary_stream("/a/b/c.txt").unwrap().location() {
        StreamLocation::Volume(location) => assert_eq!(location.path, "/a/b/c.txt"),
        other => panic!("expected a deferred location, got {:?}", other),
    }
    assert_eq!(image.root.node_count(), 5);
}

#[test]
fn test_enumeration_order_is_kept() {
    let mut builder = MemoryVolume::builder(DEVICE);
    let root = builder.root();
    for name in ["zeta", "alpha", "mid"] {
        builder.file(root, name, name.as_bytes());
    }
    let image = capture_image(&builder.build()).unwrap();

    let names: Vec<&str> = image.root.children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["zeta", "alpha", "mid"]);
}

#[test]
fn test_metadata_is_copied() {
    let mut builder = MemoryVolume::builder(DEVICE);
    let file = builder.file(builder.root(), "stamped", b"t");
    builder.times(file, 100, 200, 300);
    builder.attributes(file, attributes::ARCHIVE | attributes::HIDDEN);
    let image = capture_image(&builder.build()).unwrap();

    let node = image.root.find("/stamped").unwrap();
    assert_eq!(node.creation_time, 100);
    assert_eq!(node.last_write_time, 200);
    assert_eq!(node.last_access_time, 300);
    assert_eq!(node.attributes, attributes::ARCHIVE | attributes::HIDDEN);
    assert_eq!(node.hard_link, 5 + file);
}

#[test]
fn test_empty_and_small_streams_inline() {
    let mut builder = MemoryVolume::builder(DEVICE);
    let root = builder.root();
    builder.file(root, "empty", b"");
    builder.file(root, "tiny", b"abc");
    builder.file(root, "large", &[9u8; 64]);
    let volume = builder.build();
    let config = CaptureConfig {
        inline_limit: 8,
        ..CaptureConfig::default()
    };
    let image = ImageCapture::new(DEVICE)
        .with_config(config)
        .run(&volume)
        .unwrap();

    let is_buffer = |path: &str| {
        matches!(
            image.primary_stream(path).unwrap().location(),
            StreamLocation::Buffer(_)
        )
    };
    assert!(is_buffer("/empty"));
    assert!(is_buffer("/tiny"));
    assert!(!is_buffer("/large"));
    assert_eq!(image.stats.inline_streams, 2);
    assert_eq!(image.stats.bytes_hashed, 67);
}

#[test]
fn test_empty_stream_inline_by_default() {
    let mut builder = MemoryVolume::builder(DEVICE);
    builder.file(builder.root(), "empty", b"");
    let image = capture_image(&builder.build()).unwrap();
    assert!(matches!(
        image.primary_stream("/empty").unwrap().location(),
        StreamLocation::Buffer(data) if data.is_empty()
    ));
}

#[test]
fn test_names_normalized_on_request() {
    let mut builder = MemoryVolume::builder(DEVICE);
    builder.file(builder.root(), "cafe\u{0301}", b"coffee");
    let volume = builder.build();

    let plain = capture_image(&volume).unwrap();
    assert!(plain.root.child("cafe\u{0301}").is_some());

    let config = CaptureConfig {
        normalize_names: true,
        ..CaptureConfig::default()
    };
    let normalized = ImageCapture::new(DEVICE)
        .with_config(config)
        .run(&volume)
        .unwrap();
    assert!(normalized.root.child("caf\u{e9}").is_some());
}

#[test]
fn test_every_handle_released_after_success() {
    let mut builder = MemoryVolume::builder(DEVICE);
    let dir = builder.directory(builder.root(), "d");
    builder.file(dir, "f", b"content kept on the volume");
    let volume = builder.build();

    let image = capture_image(&volume).unwrap();
    assert_eq!(volume.live_objects(), 0);
    assert!(!volume.is_closed(), "deferred records keep the volume open");

    drop(image);
    assert!(volume.is_closed());
    assert_eq!(volume.close_calls(), 1);
}

#[test]
fn test_volume_closed_at_once_without_deferred_records() {
    let mut builder = MemoryVolume::builder(DEVICE);
    builder.directory(builder.root(), "only-dirs");
    let volume = builder.build();

    let image = capture_image(&volume).unwrap();
    assert!(volume.is_closed());
    assert_eq!(volume.close_calls(), 1);
    drop(image);
    assert_eq!(volume.close_calls(), 1);
}

#[test]
fn test_capture_into_populated_table_reuses_entries() {
    let mut security = SecurityData::new();
    let mut index = SecurityIndex::new();
    index.add(&mut security, b"O:SYG:SYD:P(A;;FA;;;SY)").unwrap();
    index.add(&mut security, DEFAULT_SECURITY_DESCRIPTOR).unwrap();

    let mut builder = MemoryVolume::builder(DEVICE);
    builder.file(builder.root(), "plain", b"p");
    let mut root = Dentry::root();
    let mut store = StreamStore::new();
    let stats = capture(
        &builder.build(),
        DEVICE,
        &mut root,
        &mut store,
        &mut security,
        &CaptureConfig::default(),
    )
    .unwrap();

    assert_eq!(security.len(), 2);
    assert_eq!(root.security_id, Some(1));
    assert_eq!(root.find("/plain").unwrap().security_id, Some(1));
    assert_eq!(stats.security_descriptors, 2);
}
