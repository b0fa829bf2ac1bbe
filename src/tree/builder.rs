//! Capture entry point
//!
//! Opens a volume, walks it from the root and releases it again, on success
//! and on failure alike.

use crate::config::CaptureConfig;
use crate::error::CaptureError;
use crate::security::SecurityData;
use crate::store::{StreamRecord, StreamStore};
use crate::tree::node::Dentry;
use crate::tree::walker::{CaptureStats, TreeWalker};
use crate::volume::{SharedVolume, VolumeHandle, VolumeSource};
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Capture the volume `device` into `root`, `store` and `security`.
///
/// The stream store may keep references to the volume for streams that are
/// read back later; the volume is closed here only if nothing else holds
/// it, otherwise when the last such reference is dropped.
///
/// `config` is validated first; an out-of-range option fails before the
/// volume is opened. On error the manifest, store and table are partially
/// populated and must be discarded.
#[instrument(skip(source, root, store, security, config), fields(device = %device))]
pub fn capture(
    source: &dyn VolumeSource,
    device: &str,
    root: &mut Dentry,
    store: &mut StreamStore,
    security: &mut SecurityData,
    config: &CaptureConfig,
) -> Result<CaptureStats, CaptureError> {
    let start = Instant::now();
    config
        .validate()
        .map_err(|detail| CaptureError::InvalidConfig {
            key: "capture".to_string(),
            detail,
        })?;
    info!("Starting capture");

    let volume = source
        .open_volume(device)
        .map_err(|source| {
            error!("Failed to open volume: {}", source);
            CaptureError::VolumeOpen {
                device: device.to_string(),
                source,
            }
        })?;
    let volume = VolumeHandle::share(volume);

    let result = capture_volume(&volume, root, store, security, config);
    let released = VolumeHandle::release(volume);

    match (result, released) {
        (Ok(mut stats), Ok(closed)) => {
            stats.duration_ms = start.elapsed().as_millis() as u64;
            if !closed {
                debug!("Volume stays open for deferred streams");
            }
            info!(
                node_count = stats.objects,
                unique_streams = stats.unique_streams,
                shared_references = stats.shared_references,
                security_descriptors = stats.security_descriptors,
                bytes_hashed = stats.bytes_hashed,
                duration_ms = stats.duration_ms,
                "Capture completed"
            );
            Ok(stats)
        }
        (Ok(_), Err(source)) => {
            error!("Failed to release volume: {}", source);
            Err(CaptureError::VolumeRelease {
                device: device.to_string(),
                source,
            })
        }
        (Err(e), released) => {
            if let Err(release_error) = released {
                warn!("Failed to release volume after error: {}", release_error);
            }
            error!(
                kind = %e.kind(),
                location = e.location(),
                "Capture failed: {}",
                e
            );
            Err(e)
        }
    }
}

fn capture_volume(
    volume: &SharedVolume,
    root: &mut Dentry,
    store: &mut StreamStore,
    security: &mut SecurityData,
    config: &CaptureConfig,
) -> Result<CaptureStats, CaptureError> {
    let root_object = volume
        .open_root()
        .map_err(|source| CaptureError::VolumeOpen {
            device: volume.device().to_string(),
            source,
        })?;

    let mut walker = TreeWalker::new(volume, store, security, config);
    walker.capture_root(root, root_object.as_ref())?;
    Ok(walker.into_stats())
}

/// One-shot capture that owns its outputs
#[derive(Debug, Clone)]
pub struct ImageCapture {
    device: String,
    config: CaptureConfig,
}

impl ImageCapture {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            config: CaptureConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CaptureConfig) -> Self {
        self.config = config;
        self
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn run(&self, source: &dyn VolumeSource) -> Result<CapturedImage, CaptureError> {
        let mut root = Dentry::root();
        let mut streams = StreamStore::new();
        let mut security = SecurityData::new();
        let stats = capture(
            source,
            &self.device,
            &mut root,
            &mut streams,
            &mut security,
            &self.config,
        )?;
        Ok(CapturedImage {
            root,
            streams,
            security,
            stats,
        })
    }
}

/// Everything a capture produced, ready for serialization
#[derive(Debug)]
pub struct CapturedImage {
    pub root: Dentry,
    pub streams: StreamStore,
    pub security: SecurityData,
    pub stats: CaptureStats,
}

impl CapturedImage {
    /// Record of the primary stream of the node at `path`
    pub fn primary_stream(&self, path: &str) -> Option<&StreamRecord> {
        let hash = self.root.find(path)?.stream.as_ref()?;
        self.streams.get(hash)
    }

    /// Read back every byte of the primary stream of the node at `path`
    pub fn read_primary_stream(&self, path: &str) -> std::io::Result<Vec<u8>> {
        let record = self.primary_stream(path).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} has no primary stream", path),
            )
        })?;
        let mut out = Vec::new();
        record.copy_to(&mut out)?;
        Ok(out)
    }
}
