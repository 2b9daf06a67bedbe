/*
 * Copyright (c) 2025 RookDB Project. All rights reserved.
 *
 * RookDB - Distributed document database replication and storage core
 * Built with Rust for superior performance and reliability
 *
 * @file error.rs
 * @brief RookDB error handling
 */

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RookDBError {
    #[error("Not yet initialized: {0}")]
    NotYetInitialized(String),

    #[error("Already initialized: {0}")]
    AlreadyInitialized(String),

    #[error("Configuration in progress: {0}")]
    ConfigurationInProgress(String),

    #[error("Not master: {0}")]
    NotMaster(String),

    #[error("Not master or secondary: {0}")]
    NotMasterOrSecondary(String),

    #[error("Exceeded time limit: {0}")]
    ExceededTimeLimit(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node not electable: {0}")]
    NodeNotElectable(String),

    #[error("Namespace exists: {0}")]
    NamespaceExists(String),

    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("Unknown replica set write concern: {0}")]
    UnknownReplWriteConcern(String),

    #[error("Cannot satisfy write concern: {0}")]
    CannotSatisfyWriteConcern(String),

    #[error("Shutdown in progress: {0}")]
    ShutdownInProgress(String),

    #[error("No replication enabled: {0}")]
    NoReplicationEnabled(String),

    #[error("Not secondary: {0}")]
    NotSecondary(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Operation interrupted: {0}")]
    Interrupted(String),

    #[error("Bad value: {0}")]
    BadValue(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Host unreachable: {0}")]
    HostUnreachable(String),

    #[error("Storage engine error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("BSON error: {0}")]
    Bson(#[from] bson::de::Error),

    #[error("BSON serialization error: {0}")]
    BsonSerialization(#[from] bson::ser::Error),
}

impl RookDBError {
    /// Sentinel used to pre-fill out-parameters of driver tasks; a surfaced
    /// instance means a task completed without setting its result.
    pub fn status_never_set() -> RookDBError {
        RookDBError::Internal("status never set by scheduled task".to_string())
    }

    pub fn is_exceeded_time_limit(&self) -> bool {
        matches!(self, RookDBError::ExceededTimeLimit(_))
    }

    pub fn is_shutdown_in_progress(&self) -> bool {
        matches!(self, RookDBError::ShutdownInProgress(_))
    }

    pub fn is_not_master(&self) -> bool {
        matches!(self, RookDBError::NotMaster(_))
    }
}

pub type Result<T> = std::result::Result<T, RookDBError>;
