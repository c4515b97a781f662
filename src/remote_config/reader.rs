//! Shared-memory-backed snapshot reader.
//!
//! The manifest is a newline-delimited list of records of the form
//! `shm-path:limiter-index:base64(config-key)`. Each record's content is
//! read from the named POSIX shared-memory object — after verifying the
//! object belongs to our own user, since /dev/shm is a shared namespace —
//! and keyed by the decoded structured key.
//!
//! A malformed record skips that record, not the snapshot: one corrupt
//! line from the agent must not blind the daemon to every other entry.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use nix::fcntl::OFlag;
use nix::sys::mman::shm_open;
use nix::sys::stat::Mode;
use tracing::warn;

use super::{ConfigKey, ConfigSource, RemoteConfigError};

pub struct ShmReader {
    manifest_path: PathBuf,
}

impl ShmReader {
    pub fn new(manifest_path: &Path) -> Self {
        Self {
            manifest_path: manifest_path.to_path_buf(),
        }
    }
}

impl ConfigSource for ShmReader {
    fn snapshot(&self) -> Result<BTreeMap<ConfigKey, Vec<u8>>, RemoteConfigError> {
        let manifest = std::fs::read_to_string(&self.manifest_path).map_err(|source| {
            RemoteConfigError::Manifest {
                path: self.manifest_path.display().to_string(),
                source,
            }
        })?;

        let mut entries = BTreeMap::new();
        for line in manifest.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match read_record(line) {
                Ok((key, content)) => {
                    entries.insert(key, content);
                }
                Err(e) => {
                    warn!(record = %line, error = %e, "skipping remote-config record");
                }
            }
        }
        Ok(entries)
    }
}

/// Parse one record and fetch its shared-memory content.
fn read_record(record: &str) -> Result<(ConfigKey, Vec<u8>), RemoteConfigError> {
    let (shm_path, limiter_index, key_b64) = split_record(record)?;

    // The limiter index is owned by the agent side; only its shape is
    // validated here.
    if limiter_index.parse::<u32>().is_err() {
        return Err(RemoteConfigError::BadRecord {
            record: record.to_string(),
        });
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(key_b64)
        .map_err(|_| RemoteConfigError::BadKeyEncoding)?;
    let key_text = String::from_utf8(decoded).map_err(|_| RemoteConfigError::BadKeyEncoding)?;
    let key = ConfigKey::parse(&key_text)?;

    let content = read_shm(shm_path)?;
    Ok((key, content))
}

/// Split `shm-path:limiter-index:base64key` from the right, so the path
/// may itself contain colons.
fn split_record(record: &str) -> Result<(&str, &str, &str), RemoteConfigError> {
    let mut parts = record.rsplitn(3, ':');
    let (Some(key_b64), Some(limiter_index), Some(shm_path)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(RemoteConfigError::BadRecord {
            record: record.to_string(),
        });
    };
    Ok((shm_path, limiter_index, key_b64))
}

fn read_shm(path: &str) -> Result<Vec<u8>, RemoteConfigError> {
    let fd = shm_open(path, OFlag::O_RDONLY, Mode::empty()).map_err(|source| {
        RemoteConfigError::Shm {
            path: path.to_string(),
            source,
        }
    })?;
    let mut file = File::from(fd);

    let meta = file.metadata().map_err(|source| RemoteConfigError::ShmRead {
        path: path.to_string(),
        source,
    })?;
    if meta.uid() != nix::unistd::geteuid().as_raw() {
        return Err(RemoteConfigError::NotOwned {
            path: path.to_string(),
        });
    }

    let mut content = Vec::new();
    file.read_to_end(&mut content)
        .map_err(|source| RemoteConfigError::ShmRead {
            path: path.to_string(),
            source,
        })?;
    Ok(content)
}
