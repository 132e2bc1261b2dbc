// # GeoIP service
//
// IP → country lookups behind a hot-swappable reader. The database file
// parser is an external collaborator (`GeoReader`); this module owns the
// refresh job: fetch release metadata, download the asset, verify its SHA-256
// (mandatory), rename it into place atomically, and only then swap the
// reader. Any failure leaves the previous reader serving.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConfigHandle;
use crate::error::{ResinError, Result};
use crate::subscription::Downloader;

/// External database reader. `lookup` returns a two-letter country code.
pub trait GeoReader: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Option<String>;
    /// Release file handles; called only after a replacement is published.
    fn close(&self) {}
}

/// Opens a reader from a database file on disk.
pub type GeoReaderOpener = Arc<dyn Fn(&Path) -> Result<Arc<dyn GeoReader>> + Send + Sync>;

/// Release metadata returned by `geoip_download_url`.
#[derive(Debug, Deserialize)]
struct ReleaseMeta {
    url: String,
    sha256: String,
}

pub struct GeoIpService {
    db_path: PathBuf,
    stage_dir: PathBuf,
    opener: GeoReaderOpener,
    reader: RwLock<Option<Arc<dyn GeoReader>>>,
}

impl GeoIpService {
    pub fn new(db_path: PathBuf, stage_dir: PathBuf, opener: GeoReaderOpener) -> Self {
        Self {
            db_path,
            stage_dir,
            opener,
            reader: RwLock::new(None),
        }
    }

    /// Open the on-disk database if present. Absence is not an error; the
    /// service serves empty lookups until a refresh lands.
    pub fn open_existing(&self) {
        if !self.db_path.exists() {
            return;
        }
        match (self.opener)(&self.db_path) {
            Ok(reader) => {
                *self.reader.write() = Some(reader);
                info!(path = %self.db_path.display(), "geoip database opened");
            }
            Err(e) => warn!(error = %e, "geoip database failed to open"),
        }
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<String> {
        self.reader.read().as_ref()?.lookup(ip)
    }

    pub fn has_reader(&self) -> bool {
        self.reader.read().is_some()
    }

    /// Install new database bytes: verify the digest, write to a staging
    /// file, rename into place, open, publish, and only then close the old
    /// reader. A digest mismatch touches nothing.
    pub fn install(&self, bytes: &[u8], expected_sha256: &str) -> Result<()> {
        let digest = hex::encode(Sha256::digest(bytes));
        if !digest.eq_ignore_ascii_case(expected_sha256) {
            return Err(ResinError::InvalidArgument(format!(
                "geoip digest mismatch: expected {expected_sha256}, got {digest}"
            )));
        }

        std::fs::create_dir_all(&self.stage_dir)?;
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let staged = self.stage_dir.join(format!("geoip-{digest}.tmp"));
        std::fs::write(&staged, bytes)?;
        std::fs::rename(&staged, &self.db_path)?;

        let next = (self.opener)(&self.db_path)?;
        let previous = {
            let mut slot = self.reader.write();
            slot.replace(next)
        };
        if let Some(old) = previous {
            old.close();
        }
        info!(path = %self.db_path.display(), "geoip database refreshed");
        Ok(())
    }

    /// One refresh cycle through the release-metadata URL.
    pub async fn refresh(&self, downloader: &Downloader, meta_url: &str) -> Result<()> {
        let meta_bytes = downloader.fetch(meta_url).await?;
        let meta: ReleaseMeta = serde_json::from_slice(&meta_bytes)
            .map_err(|e| ResinError::InvalidArgument(format!("geoip metadata: {e}")))?;
        let asset = downloader.fetch(&meta.url).await?;
        self.install(&asset, &meta.sha256)
    }

    /// Periodic refresh loop; disabled while `geoip_download_url` is empty.
    pub async fn run(
        self: Arc<Self>,
        downloader: Arc<Downloader>,
        config: Arc<ConfigHandle>,
        cancel: CancellationToken,
    ) {
        loop {
            let cfg = config.get();
            let interval = Duration::from_secs(cfg.geoip_refresh_interval_secs);
            if !cfg.geoip_download_url.is_empty() {
                if let Err(e) = self.refresh(&downloader, &cfg.geoip_download_url).await {
                    warn!(error = %e, "geoip refresh failed");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeReader {
        answer: String,
    }

    impl GeoReader for FakeReader {
        fn lookup(&self, _ip: IpAddr) -> Option<String> {
            Some(self.answer.clone())
        }
    }

    fn sha(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn service(dir: &Path, opens: Arc<AtomicUsize>) -> GeoIpService {
        let opener: GeoReaderOpener = Arc::new(move |path: &Path| {
            opens.fetch_add(1, Ordering::SeqCst);
            let answer = std::fs::read_to_string(path)
                .map_err(ResinError::from)?
                .trim()
                .to_string();
            Ok(Arc::new(FakeReader { answer }) as Arc<dyn GeoReader>)
        });
        GeoIpService::new(dir.join("geoip.mmdb"), dir.join("stage"), opener)
    }

    #[test]
    fn test_install_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), Arc::new(AtomicUsize::new(0)));
        assert!(!svc.has_reader());
        svc.install(b"HK", &sha(b"HK")).unwrap();
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        assert_eq!(svc.lookup(ip).as_deref(), Some("HK"));
    }

    #[test]
    fn test_digest_mismatch_leaves_previous_reader() {
        let dir = tempfile::tempdir().unwrap();
        let opens = Arc::new(AtomicUsize::new(0));
        let svc = service(dir.path(), opens.clone());
        svc.install(b"HK", &sha(b"HK")).unwrap();
        let opens_before = opens.load(Ordering::SeqCst);
        let file_before = std::fs::read(dir.path().join("geoip.mmdb")).unwrap();

        let err = svc.install(b"JP", &sha(b"something else")).unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
        // The opener was not called again and the file is untouched.
        assert_eq!(opens.load(Ordering::SeqCst), opens_before);
        assert_eq!(
            std::fs::read(dir.path().join("geoip.mmdb")).unwrap(),
            file_before
        );
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        assert_eq!(svc.lookup(ip).as_deref(), Some("HK"));
    }

    #[test]
    fn test_open_existing_absent_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), Arc::new(AtomicUsize::new(0)));
        svc.open_existing();
        assert!(!svc.has_reader());
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        assert!(svc.lookup(ip).is_none());
    }

    #[test]
    fn test_digest_check_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), Arc::new(AtomicUsize::new(0)));
        svc.install(b"US", &sha(b"US").to_uppercase()).unwrap();
        assert!(svc.has_reader());
    }
}
