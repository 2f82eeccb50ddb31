//! The `run` subcommand: build the roster, wire ctrl-c, supervise.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use eyre::Result;

use cryomon_config::Config;
use cryomon_core::scheduler::{RestartPolicy, Supervisor};
use cryomon_traits::MonotonicClock;

use crate::registry;

/// Blocks until ctrl-c stops the supervisor or every uploader has died.
pub fn run(cfg: &Config) -> Result<()> {
    let mut supervisor = Supervisor::new(
        RestartPolicy::from(&cfg.upload),
        Arc::new(MonotonicClock::new()),
        Arc::new(AtomicBool::new(false)),
    );

    let shutdown = supervisor.shutdown_flag();
    ctrlc::set_handler(move || {
        tracing::info!("interrupt received, shutting down");
        shutdown.store(true, Ordering::Relaxed);
    })?;

    for factory in registry::build_factories(cfg)? {
        supervisor.spawn(factory)?;
    }

    tracing::info!(
        fridge = %cfg.upload.fridge,
        store = %cfg.upload.base_url,
        uploaders = supervisor.poller_count(),
        mock = cfg.upload.mock,
        restart_on_failure = cfg.upload.restart_on_failure,
        "monitor running"
    );
    supervisor.run()
}
