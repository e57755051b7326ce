//! Shared scaffolding for the example binaries: config loading, Ctrl-C
//! driven shutdown, and logging setup. None of this is exercised by the
//! core reactor or WebSocket crates -- it only wires them up into runnable
//! programs.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Demo-wide tunables, loaded from an optional `net-demos.toml` next to the
/// binary's working directory. Missing or unparsable config falls back to
/// `Default::default()` with a warning rather than failing startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub bind_addr: String,
    pub reuse_port: bool,
    pub verbose: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self { bind_addr: "127.0.0.1:9000".to_string(), reuse_port: false, verbose: false }
    }
}

impl DemoConfig {
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(err) => {
                    tracing::warn!(%err, path = %path.display(), "net-demos: failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

pub fn init_logging(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .try_init();
}

/// An `AtomicBool` flipped by a `ctrlc` handler; demos poll this each time
/// around the reactor loop and stop once it's set. `ctrlc`'s handler runs on
/// its own OS thread, so this has to be `Send`-safe even though every demo
/// is otherwise single-threaded.
#[derive(Clone)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    /// Installs the process-wide Ctrl-C handler. Only one of these should
    /// exist per process -- `ctrlc::set_handler` itself enforces that by
    /// erroring on a second call, which we log and ignore.
    pub fn install() -> Self {
        let flag = Arc::new(AtomicBool::new(false));
        let signal_flag = flag.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            signal_flag.store(true, Ordering::Relaxed);
        }) {
            tracing::warn!(%err, "net-demos: failed to install ctrl-c handler");
        }
        Self(flag)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Lets a demo request its own shutdown (e.g. once a one-shot exchange
    /// completes), same as a Ctrl-C would.
    pub fn force_set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}
