//! Execution backends: the units that actually run a submission.

mod container;
mod subprocess;

pub use container::{ContainerBackend, ContainerConfig};
pub use subprocess::SubprocessBackend;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

use crate::{error::Error, toolchain::Toolchain, types::Language};

/// Opaque reference to a running execution, meaningful only to the backend
/// that issued it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendHandle(String);

impl BackendHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decoded, ready-to-run submission
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub submission_id: String,
    pub language: Language,
    pub source: String,
    pub stdin: Option<String>,
}

impl JobSpec {
    pub fn toolchain(&self) -> &'static Toolchain {
        Toolchain::for_language(self.language)
    }
}

/// Terminal observation of [`ExecutionBackend::wait`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Succeeded,
    /// The program ran and failed; carries a short description
    Failed(String),
    /// The deadline passed first
    TimedOut,
}

/// Runs one submission to completion.
///
/// Callers drive every handle through `create`, `wait`, `collect_output` and
/// finally `cleanup`, which must be safe to call on any handle any number of
/// times.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Allocate resources and start the execution
    async fn create(&self, spec: &JobSpec) -> Result<BackendHandle, Error>;

    /// Block until the execution ends or `deadline` passes
    async fn wait(&self, handle: &BackendHandle, deadline: Instant) -> Result<WaitOutcome, Error>;

    /// Combined stdout/stderr captured so far
    async fn collect_output(&self, handle: &BackendHandle) -> Result<String, Error>;

    /// Release everything associated with `handle`. Never fails.
    async fn cleanup(&self, handle: &BackendHandle);
}

/// Table from language to the backend that runs it
#[derive(Clone, Default)]
pub struct BackendRegistry {
    routes: HashMap<Language, Arc<dyn ExecutionBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route every known language to the same backend
    pub fn uniform(backend: Arc<dyn ExecutionBackend>) -> Self {
        let mut registry = Self::new();
        for language in Language::ALL {
            registry.register(language, backend.clone());
        }
        registry
    }

    pub fn with_backend(mut self, language: Language, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.register(language, backend);
        self
    }

    pub fn register(&mut self, language: Language, backend: Arc<dyn ExecutionBackend>) {
        self.routes.insert(language, backend);
    }

    pub fn select(&self, language: Language) -> Option<Arc<dyn ExecutionBackend>> {
        self.routes.get(&language).cloned()
    }

    pub fn languages(&self) -> Vec<Language> {
        let mut languages: Vec<_> = self.routes.keys().copied().collect();
        languages.sort_by_key(|language| language.id());
        languages
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.languages()
                    .into_iter()
                    .filter_map(|l| self.routes.get(&l).map(|b| (l, b.name().to_string()))),
            )
            .finish()
    }
}
