// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

//! Interface to the codebase store (an external collaborator).
//!
//! The scripting engine and the repository sync machinery live outside the
//! core; what the core needs from them is an entry module to run on every
//! worker thread, a version string, and file access with change
//! notification. [`StaticCodebase`] is the in-process implementation used
//! by the built-in demo module and by tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

/// Failure reported by an entry module while it sets up its worker.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ModuleError {
    /// A `listen` call could not bind its address.
    #[error(transparent)]
    Listen(#[from] crate::api::ListenError),
    /// Anything else the module wants to report.
    #[error("{0}")]
    Other(String),
}

/// An entry module: native code run once per worker thread to configure it
/// (the scripting engine would evaluate the script here instead).
pub type ModuleInit = Arc<dyn Fn() -> Result<(), ModuleError> + Send + Sync>;

/// What the core consumes from a codebase store.
pub trait Codebase: Send + Sync {
    /// The entry module of the current version.
    fn entry(&self) -> Option<ModuleInit>;

    /// Version tag of the current content.
    fn version(&self) -> String;

    /// Raw content of one file.
    fn get(&self, path: &str) -> Option<Vec<u8>>;

    /// Invokes `notify` once, the next time `path` changes.
    fn watch(&self, path: &str, notify: Box<dyn FnOnce() + Send>);
}

static CURRENT: OnceLock<RwLock<Option<Arc<dyn Codebase>>>> = OnceLock::new();

fn current_slot() -> &'static RwLock<Option<Arc<dyn Codebase>>> {
    CURRENT.get_or_init(|| RwLock::new(None))
}

/// Installs the process-wide codebase.
pub fn set_current(codebase: Arc<dyn Codebase>) {
    *current_slot()
        .write()
        .unwrap_or_else(PoisonError::into_inner) = Some(codebase);
}

/// The process-wide codebase, if one is installed.
#[must_use]
pub fn current() -> Option<Arc<dyn Codebase>> {
    current_slot()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

struct Version {
    tag: String,
    entry: Option<ModuleInit>,
}

struct StaticInner {
    versions: Vec<Version>,
    files: HashMap<String, Vec<u8>>,
    watchers: HashMap<String, Vec<Box<dyn FnOnce() + Send>>>,
}

/// In-memory codebase: a stack of versions, the newest being current.
pub struct StaticCodebase {
    inner: Mutex<StaticInner>,
}

impl StaticCodebase {
    /// Creates a codebase with one version.
    #[must_use]
    pub fn new(version: impl Into<String>, entry: ModuleInit) -> Self {
        Self {
            inner: Mutex::new(StaticInner {
                versions: vec![Version {
                    tag: version.into(),
                    entry: Some(entry),
                }],
                files: HashMap::new(),
                watchers: HashMap::new(),
            }),
        }
    }

    /// Publishes a new current version, as a repository sync would.
    pub fn push_version(&self, version: impl Into<String>, entry: ModuleInit) {
        let mut inner = self.lock();
        inner.versions.push(Version {
            tag: version.into(),
            entry: Some(entry),
        });
    }

    /// Stores file content, waking anyone watching the path.
    pub fn put_file(&self, path: impl Into<String>, content: Vec<u8>) {
        let path = path.into();
        let watchers = {
            let mut inner = self.lock();
            inner.files.insert(path.clone(), content);
            inner.watchers.remove(&path).unwrap_or_default()
        };
        for notify in watchers {
            notify();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StaticInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Codebase for StaticCodebase {
    fn entry(&self) -> Option<ModuleInit> {
        self.lock().versions.last().and_then(|v| v.entry.clone())
    }

    fn version(&self) -> String {
        self.lock()
            .versions
            .last()
            .map(|v| v.tag.clone())
            .unwrap_or_default()
    }

    fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    fn watch(&self, path: &str, notify: Box<dyn FnOnce() + Send>) {
        self.lock()
            .watchers
            .entry(path.to_string())
            .or_default()
            .push(notify);
    }
}
