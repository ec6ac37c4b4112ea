// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

#![deny(clippy::all, clippy::pedantic)]
#![deny(rustdoc::all)]
#![allow(rustdoc::missing_crate_level_docs)]

mod args;

use crate::args::{CmdArgs, Parser};
use inbound::{Listener, ListenerOptions, Protocol};
use pipeline::PipelineLayout;
use pipeline::sample_filters::{Dump, Passthrough};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use worker::codebase::{self, ModuleInit, StaticCodebase};
use worker::net::{self, MainLoop};
use worker::{WorkerManager, api};

fn init_logging(filter: &str) {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_line_number(true)
        .with_env_filter(EnvFilter::new(filter))
        .init();
}

/// Builds the entry module run on every worker thread. The scripting
/// engine would evaluate the codebase here; the built-in module wires the
/// configured addresses to an echo pipeline.
fn setup_module(
    tcp: Vec<String>,
    udp: Vec<String>,
    options: ListenerOptions,
) -> ModuleInit {
    Arc::new(move || {
        let filters = || -> Vec<Box<dyn pipeline::Filter>> {
            if false {
                /* replace false by true to dump traffic and write your own chain */
                vec![Box::new(Dump::new("echo")), Box::new(Passthrough)]
            } else {
                vec![Box::new(Passthrough)]
            }
        };
        for addr in &tcp {
            let layout = PipelineLayout::new("echo-tcp", filters());
            api::listen(addr.as_str(), Protocol::Tcp, options.clone(), &layout)?;
        }
        for addr in &udp {
            let layout = PipelineLayout::new("echo-udp", filters());
            api::listen(addr.as_str(), Protocol::Udp, options.clone(), &layout)?;
        }
        Ok(())
    })
}

/// Routes POSIX signals through the main loop: SIGINT drains and exits,
/// SIGHUP reloads the codebase, SIGTSTP dumps a memory report to the log.
#[cfg(unix)]
async fn watch_signals() {
    use tokio::signal::unix::{SignalKind, signal};

    let Ok(mut interrupt) = signal(SignalKind::interrupt()) else {
        error!("unable to install the SIGINT handler");
        return;
    };
    let Ok(mut hangup) = signal(SignalKind::hangup()) else {
        error!("unable to install the SIGHUP handler");
        return;
    };
    let Ok(mut stop) = signal(SignalKind::from_raw(libc::SIGTSTP)) else {
        error!("unable to install the SIGTSTP handler");
        return;
    };

    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                info!("SIGINT: shutting down");
                let manager = WorkerManager::global();
                while !manager.stop(false) {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                net::request_exit(-1);
                return;
            }
            _ = hangup.recv() => {
                info!("SIGHUP: reloading codebase");
                WorkerManager::global().reload();
            }
            _ = stop.recv() => {
                dump_memory_report();
            }
        }
    }
}

#[cfg(not(unix))]
async fn watch_signals() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("interrupt: shutting down");
        let manager = WorkerManager::global();
        while !manager.stop(false) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        net::request_exit(-1);
    }
}

fn dump_memory_report() {
    WorkerManager::global().stats_async(|stats| {
        info!(
            chunks_allocated = stats.chunks_allocated,
            chunks_pooled = stats.chunks_pooled,
            active_pipelines = stats.active_pipelines,
            traffic_in = stats.traffic_in,
            traffic_out = stats.traffic_out,
            "memory report"
        );
    });
}

fn main() {
    let args = CmdArgs::parse();
    init_logging(args.log_level());
    info!("Starting flowgate process...");

    Listener::set_reuse_port(args.reuse_port());

    let options = ListenerOptions {
        idle_timeout: args.idle_timeout(),
        ..ListenerOptions::default()
    };
    let module = setup_module(
        args.tcp_listens().to_vec(),
        args.udp_listens().to_vec(),
        options,
    );
    codebase::set_current(Arc::new(StaticCodebase::new(
        env!("CARGO_PKG_VERSION"),
        module,
    )));

    let main_loop = MainLoop::new();

    if args.verify() {
        match WorkerManager::global().start(1) {
            Ok(()) => {
                WorkerManager::global().stop(true);
                info!("verify ok");
                std::process::exit(0);
            }
            Err(e) => {
                error!("verify failed: {e}");
                std::process::exit(1);
            }
        }
    }

    if let Err(e) = WorkerManager::global().start(args.threads()) {
        error!("failed to start workers: {e}");
        std::process::exit(1);
    }

    let code = main_loop.run(watch_signals());
    info!("Shutting down flowgate");
    WorkerManager::global().stop(true);
    std::process::exit(code);
}
