//! Errors surfaced to callers of the discovery service

use rollcall_core::{CacheError, RangeError, SettingsError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Invalid IP range: {0}")]
    InvalidRange(#[from] RangeError),
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Settings error: {0}")]
    Settings(SettingsError),
    #[error("Discovery session not found: {0}")]
    SessionNotFound(String),
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Command failed: {0}")]
    Command(String),
}

impl From<SettingsError> for DiscoveryError {
    fn from(e: SettingsError) -> Self {
        match e {
            SettingsError::InvalidRange(range) => Self::InvalidRange(range),
            SettingsError::Invalid(msg) => Self::InvalidSettings(msg),
            other => Self::Settings(other),
        }
    }
}

impl DiscoveryError {
    /// True for errors caused by the caller's input
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidRange(_) | Self::InvalidSettings(_) | Self::InvalidAddress(_)
        )
    }

    /// True for lookups of sessions or devices that do not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound(_) | Self::DeviceNotFound(_))
    }
}

pub type Result<T, E = DiscoveryError> = std::result::Result<T, E>;
