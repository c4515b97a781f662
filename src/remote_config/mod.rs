//! Remote configuration intake.
//!
//! An external agent exposes configuration entries through shared memory
//! and a newline-delimited manifest of records. The poller turns manifest
//! snapshots into [`Changeset`] deltas and drives engine hot-reload; the
//! key structure routes each entry to the detectors whose product it
//! addresses.

pub mod poller;
pub mod reader;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use thiserror::Error;

pub use poller::PollerHandle;
pub use reader::ShmReader;

/// Structured configuration key: `scope/product/config-id/name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigKey {
    pub scope: String,
    pub product: String,
    pub config_id: String,
    pub name: String,
}

impl ConfigKey {
    /// Parse the canonical four-segment path form.
    pub fn parse(raw: &str) -> Result<Self, RemoteConfigError> {
        let mut parts = raw.splitn(4, '/');
        let (Some(scope), Some(product), Some(config_id), Some(name)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(RemoteConfigError::KeyShape {
                key: raw.to_string(),
            });
        };
        if scope.is_empty() || product.is_empty() || config_id.is_empty() || name.is_empty() {
            return Err(RemoteConfigError::KeyShape {
                key: raw.to_string(),
            });
        }
        Ok(Self {
            scope: scope.to_string(),
            product: product.to_string(),
            config_id: config_id.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.scope, self.product, self.config_id, self.name
        )
    }
}

/// Added/removed delta of configuration entries, consumed exactly once by
/// `Engine::update`.
#[derive(Debug, Default)]
pub struct Changeset {
    pub added: BTreeMap<ConfigKey, Vec<u8>>,
    pub removed: BTreeSet<ConfigKey>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Entries addressed to one product.
    pub fn added_for_product<'a>(
        &'a self,
        product: &'a str,
    ) -> impl Iterator<Item = (&'a ConfigKey, &'a Vec<u8>)> {
        self.added
            .iter()
            .filter(move |(key, _)| key.product == product)
    }
}

/// A provider of full configuration snapshots; the poller diffs successive
/// snapshots into changesets. Behind a trait so tests can feed snapshots
/// without shared memory.
pub trait ConfigSource: Send {
    fn snapshot(&self) -> Result<BTreeMap<ConfigKey, Vec<u8>>, RemoteConfigError>;
}

#[derive(Debug, Error)]
pub enum RemoteConfigError {
    #[error("cannot read manifest {path}: {source}")]
    Manifest {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record '{record}'")]
    BadRecord { record: String },

    #[error("config key '{key}' is not scope/product/config-id/name")]
    KeyShape { key: String },

    #[error("record key is not valid base64/UTF-8")]
    BadKeyEncoding,

    #[error("shared memory {path} unavailable: {source}")]
    Shm {
        path: String,
        #[source]
        source: nix::Error,
    },

    #[error("shared memory {path} is not owned by this user")]
    NotOwned { path: String },

    #[error("cannot read shared memory {path}: {source}")]
    ShmRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
