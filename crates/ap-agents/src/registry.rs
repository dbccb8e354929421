use std::collections::BTreeMap;
use std::sync::Arc;

use ap_core::config::{Config, ExecutorConfig};
use ap_harness::command::CommandExecutor;
use ap_harness::executor::{Executor, StubExecutor};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("executor not found: `{0}`")]
    NotFound(String),
    #[error("duplicate executor name: `{0}`")]
    Duplicate(String),
    #[error("dispatch chain is empty")]
    EmptyChain,
}

pub type Result<T> = std::result::Result<T, RegistryError>;

// ---------------------------------------------------------------------------
// ExecutorRegistry
// ---------------------------------------------------------------------------

/// Named executors plus the order the dispatcher tries them in.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: BTreeMap<String, Arc<dyn Executor>>,
    chain: Vec<String>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every `[executors.<name>]` entry and adopt `[dispatch] chain`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        for (name, exec) in &config.executors {
            registry.register(build_executor(name, exec))?;
        }
        registry.set_chain(config.dispatch.chain.clone())?;
        info!(chain = ?registry.chain, "executor chain configured");
        Ok(registry)
    }

    pub fn register(&mut self, executor: Arc<dyn Executor>) -> Result<()> {
        let name = executor.name().to_string();
        if self.executors.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        debug!(executor = %name, "executor registered");
        self.executors.insert(name, executor);
        Ok(())
    }

    /// Register `executor` and append it to the chain.
    pub fn push(&mut self, executor: Arc<dyn Executor>) -> Result<()> {
        let name = executor.name().to_string();
        self.register(executor)?;
        self.chain.push(name);
        Ok(())
    }

    pub fn set_chain(&mut self, names: Vec<String>) -> Result<()> {
        if names.is_empty() {
            return Err(RegistryError::EmptyChain);
        }
        if let Some(missing) = names.iter().find(|n| !self.executors.contains_key(*n)) {
            return Err(RegistryError::NotFound(missing.clone()));
        }
        self.chain = names;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(name).cloned()
    }

    /// Executors in chain order.
    pub fn chain(&self) -> Vec<Arc<dyn Executor>> {
        self.chain
            .iter()
            .filter_map(|n| self.executors.get(n).cloned())
            .collect()
    }

    pub fn chain_names(&self) -> &[String] {
        &self.chain
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

fn build_executor(name: &str, config: &ExecutorConfig) -> Arc<dyn Executor> {
    match config {
        ExecutorConfig::Command {
            program,
            args,
            working_dir,
            rate_limited_exit_code,
            unavailable_exit_code,
        } => {
            let mut exec = CommandExecutor::new(name)
                .with_exit_codes(*rate_limited_exit_code, *unavailable_exit_code);
            if let Some(program) = program {
                exec = exec.with_program(program.clone(), args.clone());
            }
            if let Some(dir) = working_dir {
                exec = exec.with_working_dir(dir.clone());
            }
            Arc::new(exec)
        }
        ExecutorConfig::Stub { reason } => Arc::new(StubExecutor::new(name, reason.clone())),
    }
}
