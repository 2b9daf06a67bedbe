/*
 * Copyright (c) 2025 RookDB Project. All rights reserved.
 *
 * RookDB - Distributed document database replication and storage core
 * Built with Rust for superior performance and reliability
 *
 * @file logger.rs
 * @brief Tracing subscriber setup for RookDB
 */

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingSettings;

/// Install the process-wide tracing subscriber from the node's logging
/// settings. `RUST_LOG` overrides the configured level. Detailed mode adds
/// the emitting target and thread name, which tells replication log lines
/// apart by origin: client threads, the `topology-driver` thread, or the
/// storage layer. Calling this more than once is a no-op so test binaries
/// can share one subscriber.
pub fn init_logging(settings: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.clone()));

    if settings.detailed {
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_names(true)
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init();
    }
}
