/*
 * Copyright (c) 2025 RookDB Project. All rights reserved.
 *
 * RookDB - Distributed document database replication and storage core
 * Built with Rust for superior performance and reliability
 *
 * @file main.rs
 * @brief RookDB node bootstrap entry point
 */

use std::sync::Arc;

use tracing::info;

use rookdb::{
    init_logging,
    network::MockNetwork,
    storage_external_state::StorageExternalState,
    HeapEngine, HostAndPort, KvStorageEngine, NodeConfig, ReplicationCoordinator,
};

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config = match args.get(1) {
        Some(path) => NodeConfig::load_from_file(path)?,
        None => NodeConfig::load_from_file("config/rookdb.toml").unwrap_or_default(),
    };

    // Initialize logging system
    init_logging(&config.logging);

    info!("RookDB node starting");
    info!("==========================================");
    info!("Storage Engine: {}", config.storage.engine);
    match &config.replication.replset {
        Some(name) => info!("Replica Set: {}", name),
        None => info!("Replication: DISABLED"),
    }
    info!(
        "Heartbeat Interval: {}ms",
        config.replication.heartbeat_interval_ms
    );
    info!(
        "Election Timeout: {}ms",
        config.replication.election_timeout_ms
    );
    info!("==========================================");

    let engine = Arc::new(HeapEngine::new());
    let storage = Arc::new(KvStorageEngine::open(engine)?);
    info!("Storage engine opened");

    let me = HostAndPort::new("localhost", 27017);
    let external = Arc::new(StorageExternalState::new(me, Arc::clone(&storage)));
    let network = Arc::new(MockNetwork::new());
    let coordinator = ReplicationCoordinator::new(config.replication.clone(), external, network);

    coordinator.start_replication();
    coordinator.wait_for_startup_complete();
    info!(
        "Replication coordinator started; member state {}",
        coordinator.get_current_member_state()
    );

    coordinator.shutdown();
    info!("RookDB node shut down cleanly");
    Ok(())
}
