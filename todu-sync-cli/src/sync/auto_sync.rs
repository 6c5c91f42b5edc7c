//! Automatic sync around CLI commands.
//!
//! Runs before read commands and after write commands when `auto_sync` is
//! enabled. Failures only print a note: the CLI keeps working offline and
//! queued edits go out on a later run.

use std::time::Duration;

use crate::config::Config;
use crate::sync::{http_backend, open_coordinator, pull, push, report, SyncOutcome};

/// Shorter than an explicit sync so commands stay responsive.
const AUTO_SYNC_TIMEOUT: Duration = Duration::from_secs(10);

pub fn try_auto_sync(config: &Config) {
    if !config.sync.auto_sync {
        return;
    }
    let (Some(url), Some(backend)) = (config.sync.server_url.as_ref(), http_backend(&config.sync))
    else {
        return;
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(_) => return,
    };

    let coordinator = match open_coordinator(config) {
        Ok(coordinator) => coordinator,
        Err(e) => {
            eprintln!("Auto-sync: {}", e);
            return;
        }
    };
    let mut events = coordinator.subscribe_events();

    rt.block_on(async {
        match push(&coordinator, url, AUTO_SYNC_TIMEOUT).await {
            Ok(SyncOutcome::Unreachable) => {
                eprintln!("Auto-sync: server unreachable, changes stay queued");
                return;
            }
            Ok(SyncOutcome::TimedOut) => {
                eprintln!("Auto-sync: server is slow, will retry on the next run");
            }
            Ok(SyncOutcome::Settled(_)) => {}
            Err(e) => {
                eprintln!("Auto-sync: {}", e);
                return;
            }
        }

        if let Err(e) = pull(&coordinator, &backend).await {
            eprintln!("Auto-sync: {}", e);
        }
    });

    // Only surface what needs the user's attention.
    for event in report::collect(&mut events) {
        if let Some(line) = report::describe(&event).filter(|l| !l.starts_with('✓')) {
            eprintln!("Auto-sync: {}", line);
        }
    }
}
