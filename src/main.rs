// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Thin process wiring for local smoke-testing. Loads a JSON stream list,
//! starts a [`lightnvr_core::registry::Registry`], and runs until
//! SIGINT/SIGTERM. Real deployments' config-file format, CLI surface, and
//! HTTP/web layer are external to this crate by design; see `DESIGN.md`.

use base::{err, Error};
use lightnvr_core::config::StreamConfig;
use lightnvr_core::registry::Registry;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

/// One process's worth of streams and the directories their sinks root
/// under. An external config loader (out of scope for this crate) is
/// free to deserialize this from TOML, YAML, or anything else; this
/// binary reads plain JSON since that's all a smoke-test needs.
#[derive(Deserialize)]
struct AppConfig {
    storage_root: PathBuf,
    hls_root: PathBuf,
    #[serde(default = "default_capacity")]
    capacity: usize,
    streams: Vec<StreamConfig>,
}

fn default_capacity() -> usize {
    16
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    // SIGINT/SIGTERM just flip a flag the main loop polls below; nothing
    // done directly in the handler needs to be async-signal-safe beyond
    // that store.
    unsafe {
        libc::signal(libc::SIGINT, request_shutdown as libc::sighandler_t);
        libc::signal(libc::SIGTERM, request_shutdown as libc::sighandler_t);
    }
}

fn load_config(path: &std::path::Path) -> Result<AppConfig, Error> {
    let file = std::fs::File::open(path).map_err(|e| err!(Io, source(e)).with_path(path.to_path_buf()))?;
    serde_json::from_reader(std::io::BufReader::new(file))
        .map_err(|e| err!(Io, msg("invalid config {}: {e}", path.display())))
}

fn run(config_path: &std::path::Path) -> Result<(), Error> {
    let config = load_config(config_path)?;
    std::fs::create_dir_all(&config.storage_root)
        .map_err(|e| err!(Io, source(e)).with_path(config.storage_root.clone()))?;
    let db = db::Database::open(&config.storage_root.join("index.db"))?;

    let registry = Registry::new_real(
        db,
        config.storage_root.clone(),
        config.hls_root.clone(),
        config.capacity,
    );

    let mut started = Vec::new();
    for stream in config.streams {
        if !stream.enabled {
            continue;
        }
        let name = stream.name.clone();
        match registry.start_stream(stream) {
            Ok(()) => {
                info!(stream = %name, "started");
                started.push(name);
            }
            Err(e) => error!(stream = %name, error = %e.chain(), "failed to start"),
        }
    }

    install_signal_handlers();
    info!(streams = started.len(), "running; send SIGINT or SIGTERM to stop");
    while !SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("shutdown requested, stopping streams");
    registry.coordinator().begin_shutdown();
    for name in &started {
        if let Err(e) = registry.stop_stream(name, Duration::from_secs(10)) {
            warn!(stream = %name, error = %e.chain(), "stream did not stop cleanly");
        }
    }
    let stuck = registry.coordinator().wait_all_stopped(Duration::from_secs(5));
    if !stuck.is_empty() {
        warn!(components = ?stuck, "some components had not reported stopped by the shutdown deadline");
    }
    Ok(())
}

fn main() {
    // If using the clock will fail, find out now, before trying to log
    // anything with timestamps.
    if let Err(e) = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        eprintln!(
            "clock_gettime failed: {e}\n\n\
             This indicates a broken environment. See the troubleshooting guide."
        );
        std::process::exit(1);
    }

    base::tracing_setup::install();

    let mut args = std::env::args_os().skip(1);
    let Some(config_path) = args.next() else {
        eprintln!("usage: lightnvr-core <config.json>");
        std::process::exit(2);
    };

    if let Err(e) = run(std::path::Path::new(&config_path)) {
        error!(err = %e.chain(), "exiting due to error");
        std::process::exit(1);
    }
}
