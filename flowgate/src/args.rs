// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

#![allow(unused)]

pub(crate) use clap::Parser;
use std::time::Duration;

fn parse_duration_ms(arg: &str) -> Result<Duration, std::num::ParseIntError> {
    arg.parse().map(Duration::from_millis)
}

#[derive(Parser)]
#[command(name = "Flowgate proxy")]
#[command(version)]
#[command(about = "A scriptable streaming proxy core", long_about = None)]
pub(crate) struct CmdArgs {
    /// TCP addresses to listen on with the built-in echo pipeline.
    #[arg(long, value_name = "ADDRESS", default_value = "127.0.0.1:8080")]
    listen: Vec<String>,

    /// UDP addresses to listen on with the built-in echo pipeline.
    #[arg(long, value_name = "ADDRESS")]
    udp_listen: Vec<String>,

    /// Number of worker threads.
    #[arg(
        long,
        value_name = "N",
        default_value_t = 1,
        value_parser = clap::value_parser!(u16).range(1..=64),
        help = "Number of worker threads in [1..64]"
    )]
    threads: u16,

    /// Log filter, e.g. "info" or "debug,tokio=off".
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Bind listening sockets with SO_REUSEPORT so every worker accepts.
    #[arg(long, default_value_t = false)]
    reuse_port: bool,

    /// Close idle connections and collect idle UDP sessions after this
    /// many milliseconds.
    #[arg(long, value_name = "MILLIS", value_parser = parse_duration_ms)]
    idle_timeout: Option<Duration>,

    /// Load and bind the entry module, then exit without serving.
    #[arg(long, default_value_t = false)]
    verify: bool,
}

impl CmdArgs {
    pub(crate) fn tcp_listens(&self) -> &[String] {
        &self.listen
    }

    pub(crate) fn udp_listens(&self) -> &[String] {
        &self.udp_listen
    }

    pub(crate) fn threads(&self) -> usize {
        usize::from(self.threads)
    }

    pub(crate) fn log_level(&self) -> &str {
        &self.log_level
    }

    pub(crate) fn reuse_port(&self) -> bool {
        self.reuse_port
    }

    pub(crate) fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub(crate) fn verify(&self) -> bool {
        self.verify
    }
}
