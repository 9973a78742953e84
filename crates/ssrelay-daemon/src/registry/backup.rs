//! Archives of the relay catalog.
//!
//! A backup is a gzip-compressed tar of every relay directory under
//! `services/` (PID files left out), stored in `backups/`. Restoring extracts
//! the archived relays over the current ones, after archiving the current
//! catalog as a `pre_restore` backup.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::files::PID_FILE;
use super::{Registry, RegistryError, mtime, port_dirs};

const EXTENSION: &str = ".tar.gz";
const SERVICES: &str = "services";

/// One archive in the backup directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    pub name: String,
    pub size: u64,
    pub created_at: u64,
}

/// Outcome of restoring a backup.
#[derive(Debug, Clone, Serialize)]
pub struct RestoredBackup {
    pub name: String,
    /// Archive of the catalog as it was before the restore.
    pub pre_restore: BackupInfo,
    /// Ports whose files were extracted.
    pub relays: Vec<u16>,
}

impl Registry {
    /// Archive every active relay.
    pub fn create_backup(&self, now: u64) -> Result<BackupInfo, RegistryError> {
        self.write_backup("backup", now)
    }

    /// Archives in the backup directory, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, RegistryError> {
        let entries = match fs::read_dir(&self.backups) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Some(name) = entry
                .file_name()
                .to_str()
                .filter(|name| name.ends_with(EXTENSION))
                .map(str::to_string)
            else {
                continue;
            };
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            backups.push(BackupInfo {
                name,
                size: meta.len(),
                created_at: mtime(&entry.path()),
            });
        }
        backups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(backups)
    }

    /// Extract the relays archived in `name` into `services/`. Files of a
    /// relay present in both are overwritten; other relays are left alone.
    pub fn restore_backup(&self, name: &str, now: u64) -> Result<RestoredBackup, RegistryError> {
        let path = self.backup_path(name)?;
        if !path.is_file() {
            return Err(RegistryError::BackupNotFound {
                name: name.to_string(),
            });
        }
        let pre_restore = self.write_backup("pre_restore", now)?;

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&path)?));
        let mut relays = BTreeSet::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            let entry_path = entry.path()?.into_owned();
            let Some(port) = archived_port(&entry_path) else {
                debug!(path = %entry_path.display(), "Skipping archive entry outside services/");
                continue;
            };
            if self.recycle_dir(port).exists() {
                warn!(port, "Skipping archived relay whose port is in the recycle bin");
                continue;
            }
            if !entry.unpack_in(&self.root)? {
                warn!(path = %entry_path.display(), "Skipping archive entry escaping the data directory");
                continue;
            }
            relays.insert(port);
        }

        let relays: Vec<u16> = relays.into_iter().collect();
        info!(name, pre_restore = %pre_restore.name, ports = ?relays, "Backup restored");
        Ok(RestoredBackup {
            name: name.to_string(),
            pre_restore,
            relays,
        })
    }

    /// Path of the archive `name`; rejects names that are not plain archive
    /// file names.
    fn backup_path(&self, name: &str) -> Result<PathBuf, RegistryError> {
        let plain = name.len() > EXTENSION.len()
            && name.ends_with(EXTENSION)
            && !name.starts_with('.')
            && !name.contains(['/', '\\']);
        if !plain {
            return Err(RegistryError::InvalidBackupName {
                name: name.to_string(),
            });
        }
        Ok(self.backups.join(name))
    }

    fn write_backup(&self, prefix: &str, now: u64) -> Result<BackupInfo, RegistryError> {
        fs::create_dir_all(&self.backups)?;
        let name = self.unused_backup_name(prefix, now);
        let path = self.backups.join(&name);
        let partial = self.backups.join(format!("{name}.partial"));

        if let Err(e) = self.archive_services(&partial) {
            if let Err(cleanup) = fs::remove_file(&partial) {
                warn!(path = %partial.display(), error = %cleanup, "Failed to remove partial backup");
            }
            return Err(e);
        }
        fs::rename(&partial, &path)?;

        let size = fs::metadata(&path)?.len();
        info!(name = %name, size, "Backup created");
        Ok(BackupInfo {
            name,
            size,
            created_at: now,
        })
    }

    fn unused_backup_name(&self, prefix: &str, now: u64) -> String {
        let mut name = format!("{prefix}_{now}{EXTENSION}");
        let mut n = 1;
        while self.backups.join(&name).exists() {
            name = format!("{prefix}_{now}_{n}{EXTENSION}");
            n += 1;
        }
        name
    }

    fn archive_services(&self, dest: &Path) -> Result<(), RegistryError> {
        let encoder = GzEncoder::new(File::create(dest)?, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (port, dir) in port_dirs(&self.services)? {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if entry.file_name() == PID_FILE || !entry.file_type()?.is_file() {
                    continue;
                }
                let archived = Path::new(SERVICES)
                    .join(port.to_string())
                    .join(entry.file_name());
                builder.append_path_with_name(entry.path(), archived)?;
            }
        }
        builder.into_inner()?.finish()?;
        Ok(())
    }
}

/// Port of an archive entry under `services/<port>/`.
fn archived_port(path: &Path) -> Option<u16> {
    let mut parts = path.components();
    if parts.next()? != Component::Normal(OsStr::new(SERVICES)) {
        return None;
    }
    let port: u16 = parts.next()?.as_os_str().to_str()?.parse().ok()?;
    (port != 0 && parts.next().is_some()).then_some(port)
}
