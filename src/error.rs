//! Error types for the Converge control plane.

use crate::types::GenerationHash;
use thiserror::Error;

/// Wire codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Malformed tagged value: {0}")]
    MalformedTag(String),

    #[error("Unexpected shape for {expected}: {actual}")]
    UnexpectedShape { expected: &'static str, actual: String },

    #[error("Missing field '{0}'")]
    MissingField(&'static str),

    #[error("Unsupported number: {0}")]
    UnsupportedNumber(String),
}

/// Structural diff errors
#[derive(Debug, Error)]
pub enum DiffError {
    #[error("Diff path not applicable at segment {segment}: {reason}")]
    BadPath { segment: usize, reason: String },

    #[error("Diff applied to structurally incompatible base: {0}")]
    IncompatibleBase(String),
}

/// Control protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Protocol major version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(u32),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unknown generation hash: {0}")]
    UnknownGeneration(GenerationHash),

    #[error("Command failed remotely: {0}")]
    CommandFailed(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("TLS setup error: {0}")]
    TlsSetup(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration and persistence errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {path:?}: {source}")]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot write {path:?}: {source}")]
    Write {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Stored document version {stored} is newer than supported version {current}")]
    VersionFromTheFuture { stored: u32, current: u32 },

    #[error("No migration from version {0} to {1}")]
    MissingMigration(u32, u32),

    #[error("Migration from version {version} failed: {reason}")]
    MigrationFailed { version: u32, reason: String },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}
