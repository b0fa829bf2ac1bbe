//! Captures that fail, and what they leave behind

use super::test_utils::{capture_image, capture_partial, DEVICE};
use volcap::config::{CaptureConfig, MAX_INLINE_LIMIT};
use volcap::error::{CaptureError, ErrorKind};
use volcap::tree::hasher::{compute_hash, HASH_CHUNK_SIZE};
use volcap::tree::ImageCapture;
use volcap::volume::MemoryVolume;

#[test]
fn test_short_read_on_third_chunk_stops_siblings() {
    let mut builder = MemoryVolume::builder(DEVICE);
    let root = builder.root();
    let dir = builder.directory(root, "d");
    let big = builder.file(dir, "big", &vec![0x5a; 3 * HASH_CHUNK_SIZE]);
    builder.fail_read_at(big, "", 2 * HASH_CHUNK_SIZE as u64 + 10);
    builder.file(dir, "next", b"never read");
    builder.file(root, "z", b"never read either");
    let volume = builder.build();

    let partial = capture_partial(&volume, &CaptureConfig::default());
    let err = partial.result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Read);
    assert_eq!(err.location(), "/d/big");

    let opened = volume.opened_paths();
    assert_eq!(opened, vec!["/", "/d", "/d/big"]);

    // the failing object and its parent stay linked
    assert!(partial.root.find("/d/big").is_some());
    assert!(partial.root.find("/d/next").is_none());
    assert!(partial.root.find("/z").is_none());
    assert!(partial.store.is_empty());
    assert_eq!(volume.live_objects(), 0);
}

#[test]
fn test_device_object_rejected() {
    let mut builder = MemoryVolume::builder(DEVICE);
    builder.device(builder.root(), "console");
    let err = capture_image(&builder.build()).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::UnsupportedObject);
    assert_eq!(err.location(), "/console");
}

#[test]
fn test_second_unnamed_stream_rolls_back_refcount() {
    let mut builder = MemoryVolume::builder(DEVICE);
    let root = builder.root();
    builder.file(root, "first", b"X");
    let odd = builder.file(root, "odd", b"X");
    builder.extra_unnamed_stream(odd, b"X");
    let volume = builder.build();

    let partial = capture_partial(&volume, &CaptureConfig::default());
    let err = partial.result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedObject);
    assert_eq!(err.location(), "/odd");

    // one slot in /first, one in /odd; the rejected third is not counted
    let record = partial.store.get(&compute_hash(b"X")).unwrap();
    assert_eq!(record.refcount(), 2);
    assert_eq!(partial.store.total_refcount(), 2);
}

#[test]
fn test_descriptor_length_drift_is_query_error() {
    let mut builder = MemoryVolume::builder(DEVICE);
    let file = builder.file(builder.root(), "shifty", b"data");
    builder.security_drift(file);
    let err = capture_image(&builder.build()).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SecurityQuery);
    assert_eq!(err.location(), "/shifty");
}

#[test]
fn test_enumeration_failure() {
    let mut builder = MemoryVolume::builder(DEVICE);
    let dir = builder.directory(builder.root(), "broken");
    builder.file(dir, "hidden", b"h");
    builder.fail_enumeration(dir);
    let err = capture_image(&builder.build()).unwrap_err();

    assert!(matches!(err, CaptureError::Enumeration { ref path, .. } if path == "/broken"));
}

#[test]
fn test_object_open_failure_leaves_child_unlinked() {
    let mut builder = MemoryVolume::builder(DEVICE);
    let root = builder.root();
    builder.file(root, "ok", b"fine");
    let locked = builder.file(root, "locked", b"secret");
    builder.fail_open(locked);
    let volume = builder.build();

    let partial = capture_partial(&volume, &CaptureConfig::default());
    let err = partial.result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ObjectOpen);
    assert_eq!(err.location(), "/locked");
    assert!(partial.root.find("/ok").is_some());
    assert!(partial.root.find("/locked").is_none());
}

#[test]
fn test_invalid_child_name() {
    let mut builder = MemoryVolume::builder(DEVICE);
    let dir = builder.directory(builder.root(), "names");
    builder.file_utf16(dir, &[0x0062, 0xDC00], b"bad");
    let err = capture_image(&builder.build()).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidName);
    assert_eq!(err.location(), "/names");
}

#[test]
fn test_volume_open_failure() {
    let mut builder = MemoryVolume::builder(DEVICE);
    builder.fail_open_volume();
    let volume = builder.build();
    let err = capture_image(&volume).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::VolumeOpen);
    assert_eq!(err.location(), DEVICE);
    assert_eq!(volume.close_calls(), 0);
}

#[test]
fn test_root_open_failure_still_releases_volume() {
    let mut builder = MemoryVolume::builder(DEVICE);
    builder.fail_open_root();
    let volume = builder.build();
    let err = capture_image(&volume).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::VolumeOpen);
    assert_eq!(volume.close_calls(), 1);
}

#[test]
fn test_release_failure_reported_after_success() {
    let mut builder = MemoryVolume::builder(DEVICE);
    builder.file(builder.root(), "empty", b"");
    builder.fail_close();
    let err = capture_image(&builder.build()).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::VolumeRelease);
    assert_eq!(err.location(), DEVICE);
}

#[test]
fn test_release_failure_never_masks_capture_error() {
    let mut builder = MemoryVolume::builder(DEVICE);
    builder.device(builder.root(), "tty");
    builder.fail_close();
    let volume = builder.build();
    let err = capture_image(&volume).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::UnsupportedObject);
    assert_eq!(volume.close_calls(), 1);
}

#[test]
fn test_deferred_close_failure_is_not_an_error() {
    let mut builder = MemoryVolume::builder(DEVICE);
    builder.file(builder.root(), "kept", b"read back later");
    builder.fail_close();
    let volume = builder.build();

    let image = capture_image(&volume).unwrap();
    assert_eq!(volume.close_calls(), 0);
    drop(image);
    assert_eq!(volume.close_calls(), 1);
}

#[test]
fn test_every_handle_released_after_failure() {
    let mut builder = MemoryVolume::builder(DEVICE);
    let a = builder.directory(builder.root(), "a");
    let b = builder.directory(a, "b");
    builder.device(b, "dev");
    let volume = builder.build();

    assert!(capture_image(&volume).is_err());
    assert_eq!(volume.live_objects(), 0);
    assert!(volume.is_closed());
}

#[test]
fn test_out_of_range_inline_limit_rejected_before_open() {
    let mut builder = MemoryVolume::builder(DEVICE);
    builder.file(builder.root(), "f", b"data");
    let volume = builder.build();
    let config = CaptureConfig {
        inline_limit: MAX_INLINE_LIMIT + 1,
        ..CaptureConfig::default()
    };

    let err = ImageCapture::new(DEVICE)
        .with_config(config)
        .run(&volume)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    assert_eq!(err.location(), "capture");
    assert!(volume.opened_paths().is_empty());
    assert_eq!(volume.close_calls(), 0);
}
