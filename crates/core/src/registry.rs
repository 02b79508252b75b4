//! Host registry
//!
//! Administrative CRUD over worker hosts.

use crate::model::{Host, HostFilter};
use crate::store::{Store, StoreError};
use chrono::Utc;
use thiserror::Error;
use tracing::info;

/// Weight given to hosts added without one
pub const DEFAULT_WEIGHT: u32 = 1;

/// Error type for registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("host already exists: {0}")]
    DuplicateHost(String),

    #[error("host not found: {0}")]
    NotFound(String),

    #[error("host weight must be at least 1")]
    InvalidWeight,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub struct HostRegistry<'a> {
    store: &'a Store,
}

impl<'a> HostRegistry<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Register a host. `weight` defaults to [`DEFAULT_WEIGHT`].
    pub fn add_host(
        &self,
        servername: &str,
        hostname: &str,
        weight: Option<u32>,
    ) -> Result<Host, RegistryError> {
        let weight = weight.unwrap_or(DEFAULT_WEIGHT);
        if weight == 0 {
            return Err(RegistryError::InvalidWeight);
        }

        let host = self
            .store
            .insert_host(servername, hostname, weight, Utc::now())
            .map_err(|e| match e {
                StoreError::Conflict => RegistryError::DuplicateHost(servername.to_string()),
                other => RegistryError::Store(other),
            })?;

        info!(
            id = host.id,
            servername = %host.servername,
            hostname = %host.hostname,
            weight = host.weight,
            "added host"
        );
        Ok(host)
    }

    /// Remove a host by servername. Its process and state rows are kept.
    pub fn remove_host(&self, servername: &str) -> Result<Host, RegistryError> {
        let host = self.find_by_servername(servername)?;
        if self.store.delete_host(host.id)? == 0 {
            return Err(RegistryError::NotFound(servername.to_string()));
        }
        info!(id = host.id, servername = %host.servername, "removed host");
        Ok(host)
    }

    /// All hosts, oldest first
    pub fn list_hosts(&self) -> Result<Vec<Host>, RegistryError> {
        Ok(self.store.hosts()?)
    }

    /// Hosts matching `filter`; may be empty
    pub fn lookup(&self, filter: &HostFilter) -> Result<Vec<Host>, RegistryError> {
        Ok(self.store.hosts_by(filter)?)
    }

    pub fn find_by_servername(&self, servername: &str) -> Result<Host, RegistryError> {
        self.lookup(&HostFilter::Servername(servername.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| RegistryError::NotFound(servername.to_string()))
    }
}
