/*
 * Copyright (c) 2025 RookDB Project. All rights reserved.
 *
 * RookDB - Distributed document database replication and storage core
 * Built with Rust for superior performance and reliability
 *
 * @file lib.rs
 * @brief RookDB library entry point
 */

pub mod error;
pub mod config;
pub mod logger;

// Replication coordinator core
pub mod optime;
pub mod member_state;
pub mod write_concern;
pub mod replica_set_config;
pub mod protocol;
pub mod topology;
pub mod executor;
pub mod election;
pub mod quorum;
pub mod network;
pub mod external_state;
pub mod coordinator;

// Storage catalog core
pub mod recovery_unit;
pub mod engine;
pub mod heap_engine;
pub mod catalog;
pub mod catalog_entry;
pub mod database_catalog;
pub mod storage_engine;
pub mod storage_external_state;

// Re-export main types for external use
pub use error::{Result, RookDBError};
pub use config::{NodeConfig, ReplicationSettings};
pub use logger::init_logging;
pub use optime::OpTime;
pub use member_state::MemberState;
pub use write_concern::WriteConcern;
pub use replica_set_config::{HostAndPort, MemberConfig, ReplicaSetConfig};
pub use protocol::{
    HandshakeArgs, HeartbeatRequest, HeartbeatResponse, IsMasterResponse, Rid,
    UpdatePositionArgs, UpdatePositionEntry,
};
pub use topology::{Role, TopologyCoordinator};
pub use executor::{CallbackHandle, EventHandle, TopologyExecutor};
pub use network::{MockNetwork, ReplicationNetwork};
pub use external_state::{ExternalState, GlobalLock, MemoryExternalState};
pub use coordinator::{ConfigState, ReplicationCoordinator, ReplicationMode};
pub use recovery_unit::{Change, OperationContext, RecoveryUnit, WriteUnitOfWork};
pub use engine::{
    CollectionOptions, Direction, IndexDescriptor, KvEngine, RecordId, RecordStore,
    SortedDataInterface,
};
pub use heap_engine::HeapEngine;
pub use catalog::KvCatalog;
pub use catalog_entry::{CollectionCatalogEntry, CollectionMetaData, IndexMetaData};
pub use database_catalog::DatabaseCatalogEntry;
pub use storage_engine::KvStorageEngine;
pub use storage_external_state::StorageExternalState;
