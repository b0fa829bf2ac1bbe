//! Captures of real directory trees

use std::fs;
use tempfile::TempDir;
use volcap::error::ErrorKind;
use volcap::tree::hasher::compute_hash;
use volcap::tree::ImageCapture;
use volcap::volume::HostVolumeSource;

fn capture_dir(dir: &TempDir) -> Result<volcap::tree::CapturedImage, volcap::error::CaptureError> {
    ImageCapture::new(dir.path().to_str().unwrap()).run(&HostVolumeSource)
}

#[test]
fn test_host_tree_capture() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("src/nested")).unwrap();
    fs::write(dir.path().join("README"), b"readme").unwrap();
    fs::write(dir.path().join("src/a.rs"), b"fn main() {}").unwrap();
    fs::write(dir.path().join("src/nested/b.rs"), b"fn main() {}").unwrap();
    fs::create_dir(dir.path().join("empty")).unwrap();

    let image = capture_dir(&dir).unwrap();

    let names: Vec<&str> = image.root.children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["README", "empty", "src"]);
    assert!(image.root.find("/empty").unwrap().children.is_empty());

    let shared = image.streams.get(&compute_hash(b"fn main() {}")).unwrap();
    assert_eq!(shared.refcount(), 2);
    assert_eq!(image.streams.len(), 2);
    assert_eq!(
        image.read_primary_stream("/src/nested/b.rs").unwrap(),
        b"fn main() {}"
    );
    assert_eq!(image.stats.directories, 4);
    assert_eq!(image.stats.files, 3);
}

#[test]
fn test_missing_directory_is_volume_open_error() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("does-not-exist");
    let err = ImageCapture::new(missing.to_str().unwrap())
        .run(&HostVolumeSource)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VolumeOpen);
}

#[test]
fn test_changed_file_fails_read_back() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("mutable.txt");
    fs::write(&file, b"before").unwrap();

    let image = capture_dir(&dir).unwrap();
    fs::write(&file, b"AFTER!").unwrap();

    let err = image.read_primary_stream("/mutable.txt").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

#[cfg(unix)]
#[test]
fn test_same_mode_shares_security_id() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    for name in ["one", "two"] {
        let path = dir.path().join(name);
        fs::write(&path, name).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();
    }
    let odd = dir.path().join("odd");
    fs::write(&odd, b"odd").unwrap();
    fs::set_permissions(&odd, fs::Permissions::from_mode(0o600)).unwrap();

    let image = capture_dir(&dir).unwrap();
    let id = |path: &str| image.root.find(path).unwrap().security_id;
    assert_eq!(id("/one"), id("/two"));
    assert_ne!(id("/one"), id("/odd"));
}

#[cfg(unix)]
#[test]
fn test_symlink_captured_as_reparse_point() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("target.txt"), b"target").unwrap();
    std::os::unix::fs::symlink("target.txt", dir.path().join("link")).unwrap();

    let image = capture_dir(&dir).unwrap();
    let link = image.root.find("/link").unwrap();
    assert!(link.is_reparse_point());
    assert_eq!(image.read_primary_stream("/link").unwrap(), b"target.txt");
    assert_eq!(image.stats.reparse_points, 1);
}

#[cfg(unix)]
#[test]
fn test_fifo_rejected_as_unsupported() {
    let dir = TempDir::new().unwrap();
    let fifo = dir.path().join("pipe");
    let status = std::process::Command::new("mkfifo").arg(&fifo).status();
    if !matches!(status, Ok(s) if s.success()) {
        return;
    }

    let err = capture_dir(&dir).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedObject);
    assert_eq!(err.location(), "/pipe");
}

#[cfg(unix)]
#[test]
fn test_non_unicode_host_name_is_invalid_name() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("good"), b"good").unwrap();
    if fs::write(dir.path().join(OsStr::from_bytes(b"bad\xffname")), b"bad").is_err() {
        return;
    }

    let err = capture_dir(&dir).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidName);
    assert_eq!(err.location(), "/");
}
