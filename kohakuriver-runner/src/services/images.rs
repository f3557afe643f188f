//! Docker image synchronisation from shared storage.
//!
//! Tarballs are published as `<shared>/kohakuriver-containers/
//! <name>-<unix_ts>.tar`. Before launching a task the runner compares the
//! local image's creation time against the newest matching tarball and
//! loads it when the shared copy is newer. A single mutex serialises
//! syncs: concurrent tasks needing the same unsynced image share one
//! load.

use crate::clients::docker::{DockerClient, DockerError};
use kohakuriver_models::naming;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ImageSyncError {
    #[error("no tarball found for container '{0}' in {1}")]
    NoTarball(String, PathBuf),

    #[error("cannot scan tarball directory {0}: {1}")]
    ScanFailed(PathBuf, std::io::Error),

    #[error(transparent)]
    Docker(#[from] DockerError),
}

pub struct ImageSyncService {
    docker: Arc<dyn DockerClient>,
    tar_dir: PathBuf,
    timeout: Duration,
    sync_lock: Mutex<()>,
}

impl ImageSyncService {
    pub fn new(docker: Arc<dyn DockerClient>, tar_dir: PathBuf, timeout: Duration) -> Self {
        Self { docker, tar_dir, timeout, sync_lock: Mutex::new(()) }
    }

    /// Ensure the local `kohakuriver/<name>:base` image is at least as
    /// new as the newest shared tarball, loading it when it is not.
    pub async fn ensure_synced(&self, container_name: &str) -> Result<(), ImageSyncError> {
        let _guard = self.sync_lock.lock().await;

        let tag = naming::image_tag(container_name);
        let local = self.docker.image_created(&tag).await.map(|dt| dt.timestamp());
        let newest = self.newest_tarball(container_name).await?;

        match (local, &newest) {
            (Some(local_ts), Some((_, shared_ts))) if local_ts >= *shared_ts => {
                info!("Local image '{tag}' is up-to-date");
                return Ok(());
            }
            (Some(_), None) => {
                // Only a local copy exists; nothing to sync from.
                info!("Local image '{tag}' is up-to-date");
                return Ok(());
            }
            (None, None) => {
                return Err(ImageSyncError::NoTarball(container_name.into(), self.tar_dir.clone()));
            }
            _ => {}
        }

        let (path, shared_ts) = newest.expect("checked above");
        info!("Syncing image '{tag}' from {} (tarball ts {shared_ts}, timeout {:?})", path.display(), self.timeout);
        self.docker.load_image(&path, self.timeout).await?;
        info!("Image '{tag}' synced");
        Ok(())
    }

    async fn newest_tarball(&self, container_name: &str) -> Result<Option<(PathBuf, i64)>, ImageSyncError> {
        let mut entries = match tokio::fs::read_dir(&self.tar_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ImageSyncError::ScanFailed(self.tar_dir.clone(), e)),
        };
        let mut newest: Option<(PathBuf, i64)> = None;
        while let Some(entry) =
            entries.next_entry().await.map_err(|e| ImageSyncError::ScanFailed(self.tar_dir.clone(), e))?
        {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(ts) = parse_tarball_timestamp(&file_name, container_name) else {
                continue;
            };
            debug!("Found tarball {file_name} (ts {ts})");
            if newest.as_ref().is_none_or(|(_, newest_ts)| ts > *newest_ts) {
                newest = Some((entry.path(), ts));
            }
        }
        Ok(newest)
    }
}

/// Extract the timestamp from `<name>-<unix_ts>.tar`. The name itself may
/// contain dashes, so only the final segment counts.
fn parse_tarball_timestamp(file_name: &str, container_name: &str) -> Option<i64> {
    let rest = file_name.strip_prefix(container_name)?.strip_prefix('-')?;
    let ts = rest.strip_suffix(".tar")?;
    ts.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::docker::MockDockerClient;
    use chrono::{DateTime, Utc};
    use rstest::rstest;
    use tempfile::TempDir;

    #[rstest]
    #[case::plain("envA-1700000000.tar", "envA", Some(1700000000))]
    #[case::dashed_name("env-a-1700000000.tar", "env-a", Some(1700000000))]
    #[case::other_container("envB-1700000000.tar", "envA", None)]
    #[case::no_timestamp("envA.tar", "envA", None)]
    #[case::bad_timestamp("envA-later.tar", "envA", None)]
    #[case::wrong_suffix("envA-1700000000.tgz", "envA", None)]
    fn tarball_timestamp_parsing(#[case] file: &str, #[case] name: &str, #[case] expected: Option<i64>) {
        assert_eq!(parse_tarball_timestamp(file, name), expected);
    }

    fn make_service(docker: MockDockerClient, dir: &TempDir) -> ImageSyncService {
        ImageSyncService::new(Arc::new(docker), dir.path().to_path_buf(), Duration::from_secs(600))
    }

    fn write_tarball(dir: &TempDir, name: &str) {
        std::fs::write(dir.path().join(name), b"layers").expect("failed to write tarball");
    }

    fn image_time(ts: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(ts, 0).expect("bad timestamp")
    }

    #[tokio::test]
    async fn loads_when_local_image_missing() {
        let dir = TempDir::new().unwrap();
        write_tarball(&dir, "envA-1700000000.tar");
        let mut docker = MockDockerClient::new();
        docker.expect_image_created().return_once(|_| None);
        let expected = dir.path().join("envA-1700000000.tar");
        docker
            .expect_load_image()
            .withf(move |path, _| path == expected)
            .once()
            .returning(|_, _| Ok(()));

        make_service(docker, &dir).ensure_synced("envA").await.expect("sync failed");
    }

    #[tokio::test]
    async fn loads_newest_when_shared_is_newer() {
        let dir = TempDir::new().unwrap();
        write_tarball(&dir, "envA-1700000000.tar");
        write_tarball(&dir, "envA-1800000000.tar");
        let mut docker = MockDockerClient::new();
        docker.expect_image_created().return_once(|_| Some(image_time(1_750_000_000)));
        let expected = dir.path().join("envA-1800000000.tar");
        docker
            .expect_load_image()
            .withf(move |path, _| path == expected)
            .once()
            .returning(|_, _| Ok(()));

        make_service(docker, &dir).ensure_synced("envA").await.expect("sync failed");
    }

    #[tokio::test]
    async fn skips_when_local_is_current() {
        let dir = TempDir::new().unwrap();
        write_tarball(&dir, "envA-1700000000.tar");
        let mut docker = MockDockerClient::new();
        docker.expect_image_created().return_once(|_| Some(image_time(1_750_000_000)));
        docker.expect_load_image().never();

        make_service(docker, &dir).ensure_synced("envA").await.expect("sync failed");
    }

    #[tokio::test]
    async fn missing_everything_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut docker = MockDockerClient::new();
        docker.expect_image_created().return_once(|_| None);

        let err = make_service(docker, &dir).ensure_synced("envA").await.expect_err("sync succeeded");
        assert!(matches!(err, ImageSyncError::NoTarball(..)));
    }

    #[tokio::test]
    async fn local_only_image_is_fine() {
        let dir = TempDir::new().unwrap();
        let mut docker = MockDockerClient::new();
        docker.expect_image_created().return_once(|_| Some(image_time(1_700_000_000)));
        docker.expect_load_image().never();

        make_service(docker, &dir).ensure_synced("envA").await.expect("sync failed");
    }
}
