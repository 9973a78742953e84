//! Filesystem-backed relay catalog.
//!
//! Each relay is a directory named after its port under `services/`; soft
//! deleted relays move to `recycle/`. The directory is the source of truth:
//! lifecycle state and expiry are recomputed on every read.

pub mod backup;
pub mod files;

use std::collections::HashSet;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use tracing::{debug, info, warn};

use ssrelay_core::{LifecycleState, RelayRecord};

use crate::process::pidfile;
use files::{
    CONFIG_JSON, ENV_FILE, EnvFile, INFO_TXT, KEY_SOFT_DELETED_AT, LEGACY_INFO, LOG_FILE, PID_FILE,
};

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("relay on port {port} not found")]
    NotFound { port: u16 },

    #[error("port {port} is already taken")]
    PortTaken { port: u16 },

    #[error("relay on port {port} is not in the recycle bin")]
    NotDeleted { port: u16 },

    #[error("relay on port {port} has unreadable metadata: {reason}")]
    InvalidRecord { port: u16, reason: String },

    #[error("backup {name} not found")]
    BackupNotFound { name: String },

    #[error("invalid backup name: {name}")]
    InvalidBackupName { name: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RegistryError {
    /// Short machine-classifiable reason.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::PortTaken { .. } => "port_taken",
            Self::NotDeleted { .. } => "not_deleted",
            Self::InvalidRecord { .. } => "invalid_record",
            Self::BackupNotFound { .. } => "backup_not_found",
            Self::InvalidBackupName { .. } => "invalid_backup_name",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

/// Relay catalog rooted at a data directory.
#[derive(Debug, Clone)]
pub struct Registry {
    root: PathBuf,
    services: PathBuf,
    recycle: PathBuf,
    backups: PathBuf,
}

impl Registry {
    /// Open (creating if needed) the catalog under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, RegistryError> {
        let services = data_dir.join("services");
        let recycle = data_dir.join("recycle");
        fs::create_dir_all(&services)?;
        fs::create_dir_all(&recycle)?;
        debug!(data_dir = %data_dir.display(), "Registry opened");
        Ok(Self {
            root: data_dir.to_path_buf(),
            services,
            recycle,
            backups: data_dir.join("backups"),
        })
    }

    pub fn service_dir(&self, port: u16) -> PathBuf {
        self.services.join(port.to_string())
    }

    fn recycle_dir(&self, port: u16) -> PathBuf {
        self.recycle.join(port.to_string())
    }

    pub fn pid_path(&self, port: u16) -> PathBuf {
        self.service_dir(port).join(PID_FILE)
    }

    pub fn log_path(&self, port: u16) -> PathBuf {
        self.service_dir(port).join(LOG_FILE)
    }

    /// True if an active relay directory exists for `port`.
    pub fn exists(&self, port: u16) -> bool {
        self.service_dir(port).is_dir()
    }

    /// True if `port` belongs to an active or soft-deleted relay.
    pub fn is_reserved(&self, port: u16) -> bool {
        self.exists(port) || self.recycle_dir(port).is_dir()
    }

    /// Every port held by an active or soft-deleted relay.
    pub fn ports_in_use(&self) -> Result<HashSet<u16>, RegistryError> {
        let mut ports = port_dirs(&self.services)?;
        ports.extend(port_dirs(&self.recycle)?);
        Ok(ports.into_iter().map(|(port, _)| port).collect())
    }

    /// Active relays ordered by port. Unreadable entries are logged and skipped.
    pub fn list(&self) -> Result<Vec<RelayRecord>, RegistryError> {
        let now = ssrelay_core::model::unix_timestamp();
        let mut records = Vec::new();
        for (port, dir) in port_dirs(&self.services)? {
            match load_record(port, &dir) {
                Ok(mut record) => {
                    record.lifecycle_state = live_state(&dir, record.expires_at, now);
                    records.push(record);
                }
                Err(e) => warn!(port, error = %e, "Skipping unreadable relay"),
            }
        }
        records.sort_by_key(|r| r.port);
        Ok(records)
    }

    /// One active relay with its state recomputed.
    pub fn get(&self, port: u16) -> Result<RelayRecord, RegistryError> {
        let dir = self.service_dir(port);
        if !dir.is_dir() {
            return Err(RegistryError::NotFound { port });
        }
        let mut record = load_record(port, &dir)?;
        record.lifecycle_state =
            live_state(&dir, record.expires_at, ssrelay_core::model::unix_timestamp());
        Ok(record)
    }

    /// Raw relay configuration of an active relay.
    pub fn relay_config(&self, port: u16) -> Result<serde_json::Value, RegistryError> {
        let dir = self.service_dir(port);
        if !dir.is_dir() {
            return Err(RegistryError::NotFound { port });
        }
        let content = fs::read_to_string(dir.join(CONFIG_JSON))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Create a relay directory. Fails with `PortTaken` if the port is held,
    /// including by a soft-deleted relay. The directory is created exclusively
    /// so two creators cannot both win.
    pub fn create(&self, record: &RelayRecord) -> Result<(), RegistryError> {
        let port = record.port;
        if self.recycle_dir(port).exists() {
            return Err(RegistryError::PortTaken { port });
        }
        let dir = self.service_dir(port);
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(RegistryError::PortTaken { port });
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = write_record(&dir, record, None) {
            warn!(port, error = %e, "Writing relay files failed, rolling back");
            if let Err(cleanup) = fs::remove_dir_all(&dir) {
                warn!(port, error = %cleanup, "Rollback left a partial relay directory");
            }
            return Err(e);
        }
        info!(port, label = %record.label, "Relay created");
        Ok(())
    }

    /// Rewrite metadata and relay configuration, stamping `EDITED_AT`.
    pub fn update(&self, record: &RelayRecord, now: u64) -> Result<(), RegistryError> {
        let dir = self.service_dir(record.port);
        if !dir.is_dir() {
            return Err(RegistryError::NotFound { port: record.port });
        }
        write_record(&dir, record, Some(now))?;
        info!(port = record.port, "Relay updated");
        Ok(())
    }

    /// Move a relay to the recycle bin and stamp the deletion time.
    pub fn soft_delete(&self, port: u16, now: u64) -> Result<(), RegistryError> {
        let src = self.service_dir(port);
        if !src.is_dir() {
            return Err(RegistryError::NotFound { port });
        }
        let dst = self.recycle_dir(port);
        if dst.exists() {
            warn!(port, "Replacing stale recycle bin entry");
            fs::remove_dir_all(&dst)?;
        }
        fs::rename(&src, &dst)?;
        if let Err(e) = edit_env(port, &dst, |env| env.set(KEY_SOFT_DELETED_AT, now.to_string())) {
            move_back(&dst, &src);
            return Err(e);
        }
        info!(port, "Relay moved to recycle bin");
        Ok(())
    }

    /// Soft-deleted relays ordered by port.
    pub fn list_deleted(&self) -> Result<Vec<RelayRecord>, RegistryError> {
        let mut records = Vec::new();
        for (port, dir) in port_dirs(&self.recycle)? {
            match load_record(port, &dir) {
                Ok(mut record) => {
                    record.lifecycle_state = LifecycleState::SoftDeleted;
                    record.soft_deleted_at = Some(deleted_at(&dir));
                    records.push(record);
                }
                Err(e) => warn!(port, error = %e, "Skipping unreadable recycle bin entry"),
            }
        }
        records.sort_by_key(|r| r.port);
        Ok(records)
    }

    /// Move a relay back out of the recycle bin.
    pub fn restore(&self, port: u16) -> Result<RelayRecord, RegistryError> {
        let src = self.recycle_dir(port);
        if !src.is_dir() {
            return Err(RegistryError::NotDeleted { port });
        }
        let dst = self.service_dir(port);
        if dst.exists() {
            return Err(RegistryError::PortTaken { port });
        }
        fs::rename(&src, &dst)?;
        if let Err(e) = edit_env(port, &dst, |env| env.remove(KEY_SOFT_DELETED_AT)) {
            move_back(&dst, &src);
            return Err(e);
        }
        info!(port, "Relay restored from recycle bin");
        self.get(port)
    }

    /// Permanently remove a soft-deleted relay.
    pub fn purge(&self, port: u16) -> Result<(), RegistryError> {
        let dir = self.recycle_dir(port);
        if !dir.is_dir() {
            return Err(RegistryError::NotDeleted { port });
        }
        fs::remove_dir_all(&dir)?;
        info!(port, "Relay purged");
        Ok(())
    }

    /// Purge recycle bin entries deleted at least `retention` ago.
    /// Returns the purged ports; individual failures are logged and skipped.
    pub fn sweep(&self, retention: Duration, now: u64) -> Result<Vec<u16>, RegistryError> {
        let mut purged = Vec::new();
        for (port, dir) in port_dirs(&self.recycle)? {
            if now.saturating_sub(deleted_at(&dir)) < retention.as_secs() {
                continue;
            }
            match fs::remove_dir_all(&dir) {
                Ok(()) => purged.push(port),
                Err(e) => warn!(port, error = %e, "Failed to purge expired recycle bin entry"),
            }
        }
        purged.sort_unstable();
        if !purged.is_empty() {
            info!(count = purged.len(), ports = ?purged, "Recycle bin swept");
        }
        Ok(purged)
    }

    /// Last `lines` lines of the relay log; empty when there is no log yet.
    pub fn tail_log(&self, port: u16, lines: usize) -> Result<Vec<String>, RegistryError> {
        if !self.exists(port) {
            return Err(RegistryError::NotFound { port });
        }
        let bytes = match fs::read(self.log_path(port)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let content = String::from_utf8_lossy(&bytes);
        let all: Vec<&str> = content.lines().collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].iter().map(ToString::to_string).collect())
    }

    /// Truncate the relay log.
    pub fn clear_log(&self, port: u16) -> Result<(), RegistryError> {
        if !self.exists(port) {
            return Err(RegistryError::NotFound { port });
        }
        let path = self.log_path(port);
        if path.exists() {
            fs::write(&path, b"")?;
        }
        info!(port, "Relay log cleared");
        Ok(())
    }
}

/// Subdirectories of `root` whose names are port numbers.
fn port_dirs(root: &Path) -> Result<Vec<(u16, PathBuf)>, RegistryError> {
    let mut dirs = Vec::new();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(dirs),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let Some(port) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u16>().ok())
            .filter(|port| *port != 0)
        else {
            continue;
        };
        if entry.file_type()?.is_dir() {
            dirs.push((port, entry.path()));
        }
    }
    Ok(dirs)
}

fn live_state(dir: &Path, expires_at: Option<u64>, now: u64) -> LifecycleState {
    pidfile::liveness(&dir.join(PID_FILE)).with_expiry(expires_at, now)
}

/// Modification time of `path` as unix seconds, 0 if unknown.
fn mtime(path: &Path) -> u64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs())
}

/// Metadata of a relay directory: `config.env`, else the legacy `info`, else
/// a panel-written `info.txt`.
fn read_env(dir: &Path) -> Result<Option<EnvFile>, RegistryError> {
    for name in [ENV_FILE, LEGACY_INFO, INFO_TXT] {
        match fs::read_to_string(dir.join(name)) {
            Ok(content) if name == INFO_TXT => return Ok(Some(files::env_from_info_txt(&content))),
            Ok(content) => return Ok(Some(EnvFile::parse(&content))),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(None)
}

fn load_record(port: u16, dir: &Path) -> Result<RelayRecord, RegistryError> {
    let fallback_created = mtime(dir);
    let parsed = if let Some(env) = read_env(dir)? {
        files::record_from_env(port, &env, fallback_created)
    } else {
        let content = fs::read_to_string(dir.join(CONFIG_JSON)).map_err(|e| {
            RegistryError::InvalidRecord {
                port,
                reason: format!("no metadata and no readable {CONFIG_JSON}: {e}"),
            }
        })?;
        let config: serde_json::Value = serde_json::from_str(&content)?;
        files::record_from_relay_config(port, &config, fallback_created)
    };
    parsed.map_err(|reason| RegistryError::InvalidRecord { port, reason })
}

fn write_record(dir: &Path, record: &RelayRecord, edited_at: Option<u64>) -> Result<(), RegistryError> {
    let config = serde_json::to_string_pretty(&files::relay_config(record))?;
    fs::write(dir.join(CONFIG_JSON), config)?;
    fs::write(dir.join(ENV_FILE), files::record_to_env(record, edited_at).render())?;
    Ok(())
}

/// Apply `edit` to the metadata of `dir`, writing the result to `config.env`.
/// A relay known only by its `config.json` gets full metadata written first.
fn edit_env(port: u16, dir: &Path, edit: impl FnOnce(&mut EnvFile)) -> Result<(), RegistryError> {
    let mut env = match read_env(dir)? {
        Some(env) => env,
        None => files::record_to_env(&load_record(port, dir)?, None),
    };
    edit(&mut env);
    fs::write(dir.join(ENV_FILE), env.render())?;
    Ok(())
}

/// Undo a directory move after a failed metadata edit.
fn move_back(from: &Path, to: &Path) {
    if let Err(e) = fs::rename(from, to) {
        warn!(from = %from.display(), to = %to.display(), error = %e, "Failed to roll back relay move");
    }
}

/// When a recycle bin entry was deleted: its stamp, else the directory mtime.
fn deleted_at(dir: &Path) -> u64 {
    read_env(dir)
        .ok()
        .flatten()
        .and_then(|env| env.get(KEY_SOFT_DELETED_AT).and_then(|v| v.parse().ok()))
        .unwrap_or_else(|| mtime(dir))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ssrelay_core::{Endpoint, RelayCredential};

    fn record(port: u16) -> RelayRecord {
        RelayRecord {
            port,
            label: format!("relay-{port}"),
            backend: Endpoint::new("10.0.0.9", 1080),
            backend_auth: None,
            credential: RelayCredential::new("chacha20-ietf-poly1305", "0123456789abcdef"),
            created_at: 1_700_000_000,
            expires_at: None,
            lifecycle_state: LifecycleState::Stopped,
            soft_deleted_at: None,
        }
    }

    fn registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path()).unwrap();
        (dir, registry)
    }

    #[test]
    fn create_then_get() {
        let (_dir, registry) = registry();
        registry.create(&record(20001)).unwrap();
        let got = registry.get(20001).unwrap();
        assert_eq!(got, record(20001));
        assert!(registry.service_dir(20001).join(CONFIG_JSON).is_file());
    }

    #[test]
    fn create_twice_is_port_taken() {
        let (_dir, registry) = registry();
        registry.create(&record(20001)).unwrap();
        let err = registry.create(&record(20001)).unwrap_err();
        assert!(matches!(err, RegistryError::PortTaken { port: 20001 }));
        assert_eq!(err.code(), "port_taken");
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_dir, registry) = registry();
        assert!(matches!(
            registry.get(1234),
            Err(RegistryError::NotFound { port: 1234 })
        ));
    }

    #[test]
    fn list_is_sorted_and_skips_junk() {
        let (dir, registry) = registry();
        registry.create(&record(30000)).unwrap();
        registry.create(&record(20000)).unwrap();
        fs::create_dir(dir.path().join("services").join("not-a-port")).unwrap();
        fs::create_dir(dir.path().join("services").join("40000")).unwrap();

        let ports: Vec<u16> = registry.list().unwrap().iter().map(|r| r.port).collect();
        assert_eq!(ports, vec![20000, 30000]);
        assert!(registry.ports_in_use().unwrap().contains(&40000));
    }

    #[test]
    fn expired_state_is_derived() {
        let (_dir, registry) = registry();
        let mut expired = record(20002);
        expired.expires_at = Some(1);
        registry.create(&expired).unwrap();
        assert_eq!(
            registry.get(20002).unwrap().lifecycle_state,
            LifecycleState::Expired
        );
    }

    #[test]
    fn legacy_info_file_is_read() {
        let (_dir, registry) = registry();
        let dir = registry.service_dir(20003);
        fs::create_dir(&dir).unwrap();
        fs::write(
            dir.join(LEGACY_INFO),
            "PORT=20003\nPASSWORD=legacy\nNODE_NAME=old\nSOCKS_IP=1.2.3.4\nSOCKS_PORT=1080\nCREATED_AT=2023-01-01T00:00:00\n",
        )
        .unwrap();
        let got = registry.get(20003).unwrap();
        assert_eq!(got.credential.secret, "legacy");
        assert_eq!(got.label, "old");
    }

    #[test]
    fn config_json_only_is_recovered() {
        let (_dir, registry) = registry();
        let dir = registry.service_dir(20004);
        fs::create_dir(&dir).unwrap();
        let config = files::relay_config(&record(20004));
        fs::write(dir.join(CONFIG_JSON), config.to_string()).unwrap();

        let got = registry.get(20004).unwrap();
        assert_eq!(got.credential.secret, "0123456789abcdef");
        assert_eq!(got.label, "port_20004");
    }

    #[test]
    fn info_txt_is_read() {
        let (_dir, registry) = registry();
        let dir = registry.service_dir(20011);
        fs::create_dir(&dir).unwrap();
        fs::write(
            dir.join(INFO_TXT),
            "节点名称: panel\nShadowsocks密码: pw\nSOCKS5后端: 1.2.3.4:1080\nSOCKS5认证: 无\n",
        )
        .unwrap();
        let got = registry.get(20011).unwrap();
        assert_eq!(got.label, "panel");
        assert_eq!(got.backend, Endpoint::new("1.2.3.4", 1080));
    }

    #[test]
    fn config_json_only_survives_delete_and_restore() {
        let (_dir, registry) = registry();
        let dir = registry.service_dir(20004);
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join(CONFIG_JSON), files::relay_config(&record(20004)).to_string()).unwrap();

        registry.soft_delete(20004, 1_000).unwrap();
        let deleted = registry.list_deleted().unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].credential.secret, "0123456789abcdef");
        assert_eq!(deleted[0].soft_deleted_at, Some(1_000));

        let restored = registry.restore(20004).unwrap();
        assert_eq!(restored.backend, Endpoint::new("10.0.0.9", 1080));
        assert_eq!(restored.soft_deleted_at, None);
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[test]
    fn unreadable_relay_is_not_moved_to_recycle_bin() {
        let (_dir, registry) = registry();
        fs::create_dir(registry.service_dir(20012)).unwrap();

        let err = registry.soft_delete(20012, 1_000).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRecord { port: 20012, .. }));
        assert!(registry.exists(20012));
        assert!(!registry.recycle_dir(20012).exists());
    }

    #[test]
    fn soft_delete_keeps_port_reserved() {
        let (_dir, registry) = registry();
        registry.create(&record(20005)).unwrap();
        registry.soft_delete(20005, 1_000).unwrap();

        assert!(!registry.exists(20005));
        assert!(registry.is_reserved(20005));
        assert!(registry.ports_in_use().unwrap().contains(&20005));
        assert!(registry.list().unwrap().is_empty());
        assert!(matches!(
            registry.create(&record(20005)),
            Err(RegistryError::PortTaken { .. })
        ));

        let deleted = registry.list_deleted().unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].lifecycle_state, LifecycleState::SoftDeleted);
        assert_eq!(deleted[0].soft_deleted_at, Some(1_000));
    }

    #[test]
    fn restore_clears_deletion_stamp() {
        let (_dir, registry) = registry();
        registry.create(&record(20006)).unwrap();
        registry.soft_delete(20006, 1_000).unwrap();
        let restored = registry.restore(20006).unwrap();
        assert_eq!(restored.soft_deleted_at, None);
        assert_eq!(restored.lifecycle_state, LifecycleState::Stopped);
        assert!(matches!(
            registry.restore(20006),
            Err(RegistryError::NotDeleted { .. })
        ));
    }

    #[test]
    fn purge_requires_soft_delete() {
        let (_dir, registry) = registry();
        registry.create(&record(20007)).unwrap();
        assert!(matches!(
            registry.purge(20007),
            Err(RegistryError::NotDeleted { .. })
        ));
        registry.soft_delete(20007, 1_000).unwrap();
        registry.purge(20007).unwrap();
        assert!(!registry.is_reserved(20007));
    }

    #[test]
    fn sweep_honours_retention() {
        let (_dir, registry) = registry();
        let day = 24 * 60 * 60;
        registry.create(&record(20008)).unwrap();
        registry.create(&record(20009)).unwrap();
        registry.soft_delete(20008, 0).unwrap();
        registry.soft_delete(20009, 29 * day).unwrap();

        let purged = registry
            .sweep(Duration::from_secs(30 * day), 30 * day)
            .unwrap();
        assert_eq!(purged, vec![20008]);
        assert!(registry.is_reserved(20009));
    }

    #[test]
    fn tail_and_clear_log() {
        let (_dir, registry) = registry();
        registry.create(&record(20010)).unwrap();
        assert!(registry.tail_log(20010, 100).unwrap().is_empty());

        let body: String = (1..=150).map(|i| format!("line {i}\n")).collect();
        let mut bytes = body.into_bytes();
        bytes.extend_from_slice(b"bad \xff byte\n");
        fs::write(registry.log_path(20010), bytes).unwrap();

        let tail = registry.tail_log(20010, 100).unwrap();
        assert_eq!(tail.len(), 100);
        assert_eq!(tail[0], "line 52");
        assert!(tail[99].starts_with("bad "));

        registry.clear_log(20010).unwrap();
        assert!(registry.tail_log(20010, 100).unwrap().is_empty());
    }
}
