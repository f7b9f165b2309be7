//! File backend (Linux/Windows hosts)
//!
//! A lock file serialises access across processes (systemd unit and CLI
//! subcommands share the same directory); the document's mtime is the
//! optimistic-concurrency baseline. Registration waits ride a filesystem
//! watcher on the config directory.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;
use fs2::FileExt;
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{ConfigBackend, ConfigDoc, ConfigError, ConfigResult};

/// One lock file guards every document in the directory
pub const LOCK_FILE_NAME: &str = "vault.lock";

pub struct FileBackend<T> {
    dir: PathBuf,
    last_mod: Option<SystemTime>,
    _marker: PhantomData<T>,
}

/// Held for the duration of one fetch or save
struct FileLock(File);

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}

impl<T: ConfigDoc> FileBackend<T> {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            last_mod: None,
            _marker: PhantomData,
        }
    }

    fn config_path(&self) -> PathBuf {
        self.dir.join(T::FILE_NAME)
    }

    fn acquire_lock(&self) -> ConfigResult<FileLock> {
        std::fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.dir.join(LOCK_FILE_NAME))?;
        file.lock_exclusive()?;
        Ok(FileLock(file))
    }

    fn modified(&self) -> ConfigResult<Option<SystemTime>> {
        match std::fs::metadata(self.config_path()) {
            Ok(metadata) => Ok(Some(metadata.modified()?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<T: ConfigDoc> ConfigBackend<T> for FileBackend<T> {
    async fn fetch(&mut self) -> ConfigResult<T> {
        let _lock = self.acquire_lock()?;

        let document = match std::fs::read(self.config_path()) {
            Ok(bytes) if bytes.is_empty() => T::default(),
            Ok(bytes) => match T::from_legacy_bytes(&bytes) {
                Some(document) => {
                    debug!(file = T::FILE_NAME, "read legacy binary config payload");
                    document
                }
                None => serde_json::from_slice(&bytes)?,
            },
            Err(e) if e.kind() == ErrorKind::NotFound => T::default(),
            Err(e) => return Err(e.into()),
        };

        self.last_mod = self.modified()?;
        Ok(document)
    }

    async fn save(&mut self, document: &T) -> ConfigResult<()> {
        let _lock = self.acquire_lock()?;

        if self.modified()? != self.last_mod {
            return Err(ConfigError::ChangedSinceFetch);
        }

        let bytes = serde_json::to_vec_pretty(document)?;
        std::fs::write(self.config_path(), bytes)?;
        self.last_mod = self.modified()?;
        Ok(())
    }

    async fn wait_for_registration(&mut self, cancel: &CancellationToken) -> ConfigResult<T> {
        std::fs::create_dir_all(&self.dir)?;

        // Watch the directory, not the file: the registering process may
        // be about to create it.
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut watcher =
            notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
                if let Ok(event) = result {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        let _ = event_tx.send(());
                    }
                }
            })?;
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;

        loop {
            let document = self.fetch().await?;
            if document.is_registered() {
                return Ok(document);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ConfigError::Cancelled),
                event = event_rx.recv() => {
                    if event.is_none() {
                        return Err(ConfigError::Cancelled);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::AgentConfig;
    use std::time::Duration;

    fn registered(key: &str) -> AgentConfig {
        AgentConfig {
            public_key: key.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fetch_of_missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend: FileBackend<AgentConfig> = FileBackend::new(dir.path());

        let config = backend.fetch().await.unwrap();
        assert_eq!(config, AgentConfig::default());
    }

    #[tokio::test]
    async fn test_save_then_fetch_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend: FileBackend<AgentConfig> = FileBackend::new(dir.path());

        backend.fetch().await.unwrap();
        backend.save(&registered("pub-1")).await.unwrap();

        let mut other: FileBackend<AgentConfig> = FileBackend::new(dir.path());
        assert_eq!(other.fetch().await.unwrap().public_key, "pub-1");
    }

    #[tokio::test]
    async fn test_concurrent_writers_conflict_then_recover() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer_a: FileBackend<AgentConfig> = FileBackend::new(dir.path());
        let mut writer_b: FileBackend<AgentConfig> = FileBackend::new(dir.path());

        writer_a.fetch().await.unwrap();
        writer_b.fetch().await.unwrap();

        // mtime granularity can be coarse; give the clock room to move.
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer_b.save(&registered("from-b")).await.unwrap();

        let denied = writer_a.save(&registered("from-a")).await;
        assert!(matches!(denied, Err(ConfigError::ChangedSinceFetch)));

        // After refetching, the same writer succeeds.
        assert_eq!(writer_a.fetch().await.unwrap().public_key, "from-b");
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer_a.save(&registered("from-a")).await.unwrap();

        assert_eq!(writer_b.fetch().await.unwrap().public_key, "from-a");
    }

    #[tokio::test]
    async fn test_save_without_fetch_conflicts_with_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut seeder: FileBackend<AgentConfig> = FileBackend::new(dir.path());
        seeder.fetch().await.unwrap();
        seeder.save(&registered("seed")).await.unwrap();

        let mut blind: FileBackend<AgentConfig> = FileBackend::new(dir.path());
        assert!(matches!(
            blind.save(&registered("blind")).await,
            Err(ConfigError::ChangedSinceFetch)
        ));
    }

    #[tokio::test]
    async fn test_legacy_binary_file_is_migrated_on_read() {
        let dir = tempfile::tempdir().unwrap();

        // A V1 agent wrote its binary payload directly.
        #[derive(serde::Serialize)]
        struct V1<'a>(
            &'a str,
            &'a str,
            &'a str,
            &'a str,
            &'a str,
            &'a str,
            &'a str,
            &'a str,
            &'a str,
            &'a str,
        );
        let v1 = V1(
            "1", "legacy-pub", "legacy-priv", "tok", "tid", "okta", "org", "url", "reason",
            "state",
        );
        std::fs::write(dir.path().join("vault.json"), bincode::serialize(&v1).unwrap()).unwrap();

        let mut backend: FileBackend<AgentConfig> = FileBackend::new(dir.path());
        let migrated = backend.fetch().await.unwrap();
        assert_eq!(migrated.public_key, "legacy-pub");
        assert!(migrated.shutdown_state.is_empty());

        // The next save rewrites it as JSON.
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.save(&migrated).await.unwrap();
        let bytes = std::fs::read(dir.path().join("vault.json")).unwrap();
        assert!(serde_json::from_slice::<AgentConfig>(&bytes).is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_registration_sees_the_registering_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let cancel = CancellationToken::new();

        let waiter = tokio::spawn({
            let path = path.clone();
            let cancel = cancel.clone();
            async move {
                let mut backend: FileBackend<AgentConfig> = FileBackend::new(path);
                backend.wait_for_registration(&cancel).await
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut registrar: FileBackend<AgentConfig> = FileBackend::new(&path);
        registrar.fetch().await.unwrap();
        registrar.save(&registered("fresh-key")).await.unwrap();

        let config = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(config.public_key, "fresh-key");
    }

    #[tokio::test]
    async fn test_wait_for_registration_is_cancellable() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend: FileBackend<AgentConfig> = FileBackend::new(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            backend.wait_for_registration(&cancel).await,
            Err(ConfigError::Cancelled)
        ));
    }
}
