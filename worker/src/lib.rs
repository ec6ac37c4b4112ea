// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

#![deny(
    unsafe_code,
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

//! Worker model of the proxy core.
//!
//! Each worker is one OS thread running a single-threaded event loop; the
//! current codebase incarnation ([`Worker`]) binds listeners on it through
//! the script-side surface in [`api`]. [`WorkerManager`] fans control
//! operations (start, reload, shutdown, stats) out to every
//! [`WorkerThread`] and gathers the results, so a live reload either moves
//! every thread to the new codebase or none of them.

pub mod api;
pub mod codebase;
pub mod exec;
mod manager;
pub mod net;
mod thread;
mod worker;

pub use manager::WorkerManager;
pub use thread::{StartError, WorkerThread};
pub use worker::Worker;

// Tests touching the process-global codebase slot or the manager singleton
// take this lock to run one at a time.
#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard, PoisonError};

    static SERIAL: Mutex<()> = Mutex::new(());

    pub(crate) fn serialize() -> MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use crate::api;
    use crate::codebase::{self, ModuleError, ModuleInit, StaticCodebase};
    use crate::manager::WorkerManager;
    use crate::thread::StartError;
    use crate::worker::Worker;
    use inbound::{Listener, ListenerOptions, Protocol};
    use pipeline::PipelineLayout;
    use pipeline::sample_filters::Passthrough;
    use crate::test_support::serialize;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    type Ports = Arc<Mutex<Vec<SocketAddr>>>;

    /// Entry module that wires a TCP echo listener on an ephemeral port and
    /// reports the bound address.
    fn echo_module(ports: Ports) -> ModuleInit {
        Arc::new(move || {
            let layout = PipelineLayout::new("echo", vec![Box::new(Passthrough)]);
            api::listen(
                "127.0.0.1:0",
                Protocol::Tcp,
                ListenerOptions::default(),
                &layout,
            )?;
            if let Some(addr) =
                Listener::find(Protocol::Tcp, 0).and_then(|listener| listener.local_addr())
            {
                ports
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(addr);
            }
            Ok(())
        })
    }

    async fn echo_roundtrip(addr: SocketAddr) {
        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");
    }

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }

    fn stop_gracefully(manager: &WorkerManager) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !manager.stop(false) {
            assert!(Instant::now() < deadline, "graceful stop never finished");
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    #[test]
    fn workers_start_serve_and_stop() {
        let _guard = serialize();
        let ports: Ports = Arc::new(Mutex::new(Vec::new()));
        codebase::set_current(Arc::new(StaticCodebase::new("v1", echo_module(ports.clone()))));

        let manager = WorkerManager::global();
        manager.start(2).unwrap();

        let bound: Vec<SocketAddr> = ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        assert_eq!(bound.len(), 2);
        block_on(async {
            for addr in &bound {
                echo_roundtrip(*addr).await;
            }
        });

        let status = manager.status();
        assert_eq!(status.version, "v1");

        stop_gracefully(manager);
        assert!(!manager.started());
    }

    #[test]
    fn start_failure_tears_all_workers_down() {
        let _guard = serialize();
        let broken: ModuleInit =
            Arc::new(|| Err(ModuleError::Other("nothing to serve".to_string())));
        codebase::set_current(Arc::new(StaticCodebase::new("broken", broken)));

        let manager = WorkerManager::global();
        let result = manager.start(2);
        assert!(matches!(result, Err(StartError::Module(_))));
        assert!(!manager.started());
    }

    #[test]
    fn reload_is_atomic_across_workers() {
        let _guard = serialize();
        let ports: Ports = Arc::new(Mutex::new(Vec::new()));
        let codebase = Arc::new(StaticCodebase::new("v1", echo_module(ports.clone())));
        codebase::set_current(codebase.clone());

        let manager = WorkerManager::global();
        manager.start(4).unwrap();

        // Version 2 fails to load on worker 3: nobody may switch.
        let sabotaged = echo_module(ports.clone());
        let v2: ModuleInit = Arc::new(move || {
            let index = Worker::current().map_or(0, |worker| worker.thread_index());
            if index == 3 {
                return Err(ModuleError::Other("thread 3 refuses".to_string()));
            }
            sabotaged()
        });
        codebase.push_version("v2", v2);
        manager.reload();
        assert_eq!(manager.status().version, "v1");

        // Old workers keep serving.
        let bound: Vec<SocketAddr> = ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        block_on(echo_roundtrip(bound[0]));

        // A healthy version switches everyone.
        codebase.push_version("v3", echo_module(ports.clone()));
        manager.reload();
        assert_eq!(manager.status().version, "v3");

        manager.stop(true);
    }

    #[test]
    fn forked_contexts_are_fresh() {
        let first = api::fork(|context| context.id());
        let second = api::fork(|context| context.id());
        assert_ne!(first, second);
    }
}
