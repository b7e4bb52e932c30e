//! Typed error families for every component of the edit pipeline.
//!
//! Library call sites return the specific family (`ConfigError`, `WorkspaceError`, ...)
//! so callers that need to match on a cause aren't forced to downcast. `CoreError`
//! exists for call sites that just want one error type to propagate with `?`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config layer {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config layer {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("missing environment variable {0}")]
    MissingApiKey(&'static str),
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to read workspace root {path}: {source}")]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}")]
    FileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    FileUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid ignore pattern {pattern} in {path}: {source}")]
    InvalidIgnorePattern {
        path: PathBuf,
        pattern: String,
        #[source]
        source: ignore::Error,
    },
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no <changes> envelope found in model output")]
    EnvelopeNotFound,
    #[error("malformed envelope XML: {0}")]
    MalformedXml(String),
    #[error("<change> element missing required <file>")]
    MissingFile,
    #[error("update record for {path} is missing <content>")]
    MissingContent { path: String },
    #[error("delete record for {path} must not carry <content>")]
    UnexpectedContent { path: String },
    #[error("unrecognized change type {kind} for {path}")]
    UnknownChangeType { path: String, kind: String },
    #[error("block entry for {path} has neither child <path>/<content> nor a name attribute")]
    MalformedBlock { path: String },
    #[error("source parse failed for {path}: {reason}")]
    SourceUnparsable { path: String, reason: String },
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request to {provider} failed: {message}")]
    Transport { provider: String, message: String },
    #[error("{provider} responded with status {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("{provider} response could not be decoded: {message}")]
    Decode { provider: String, message: String },
    #[error("unsupported api provider: {0}")]
    UnsupportedProvider(String),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to create snapshot directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to copy {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot {label} does not exist")]
    NotFound { label: String },
    #[error("failed to remove tracked file {path} during restore: {source}")]
    RemoveDuringRestore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
