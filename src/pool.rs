//! Pool of execution contexts keyed by target tool.
//!
//! With pooling disabled every run gets a fresh context that is disposed right
//! after. With pooling enabled contexts are kept per target path and reused by
//! whichever caller manages to acquire one first; there is no fairness among
//! callers racing for the same context.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::context::loader::ToolLoader;
use crate::context::{ContextError, ExecutionContext};
use crate::logging::LogSink;

/// Environment variable enabling context reuse.
pub const POOLING_ENV: &str = "EXEC_SERVER_POOLING";

const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// Configuration for the context pool.
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    /// Keep contexts alive between runs.
    pub pooling: bool,
}

impl PoolConfig {
    /// Load config from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(val) = dotenvy::var(POOLING_ENV) {
            cfg.pooling = val.eq_ignore_ascii_case("true") || val == "1";
        }
        cfg
    }
}

/// Reuse-or-create front end over [`ExecutionContext`].
pub struct ExecutionContextPool {
    pooling: bool,
    loader: Arc<dyn ToolLoader>,
    contexts: Mutex<HashMap<PathBuf, Vec<Arc<ExecutionContext>>>>,
}

impl ExecutionContextPool {
    pub fn new(config: PoolConfig, loader: Arc<dyn ToolLoader>) -> Self {
        info!(pooling = config.pooling, "Execution context pool created");
        Self {
            pooling: config.pooling,
            loader,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    pub fn pooling_enabled(&self) -> bool {
        self.pooling
    }

    /// Run `args` against `target`, reusing a pooled context when possible.
    ///
    /// Only construction failures (missing target) surface as errors; anything
    /// that goes wrong inside the tool is already folded into the status.
    pub fn run(
        &self,
        target: &Path,
        dependency_specs: &[PathBuf],
        args: &[String],
        sink: &dyn LogSink,
    ) -> Result<i32, ContextError> {
        if !self.pooling {
            let context =
                ExecutionContext::new(target, dependency_specs.to_vec(), Arc::clone(&self.loader))?;
            context.try_acquire();
            let result = context.run(args, sink);
            context.dispose();
            return result;
        }

        let context = self.acquire(target, dependency_specs)?;
        let result = context.run(args, sink);
        context.release();
        result
    }

    /// Find an acquirable context for `target` or append a new one. The
    /// returned context is held by the caller.
    fn acquire(
        &self,
        target: &Path,
        dependency_specs: &[PathBuf],
    ) -> Result<Arc<ExecutionContext>, ContextError> {
        let mut contexts = self.contexts.lock();

        if let Some(list) = contexts.get_mut(target) {
            let mut index = 0;
            while index < list.len() {
                let candidate = Arc::clone(&list[index]);
                if !candidate.try_acquire() {
                    index += 1;
                    continue;
                }
                if candidate.is_up_to_date() {
                    debug!(context = %candidate.name(), "Reusing execution context");
                    return Ok(candidate);
                }
                // Stale and now held by us: same treatment as `recycle`.
                info!(context = %candidate.name(), "Discarding stale execution context");
                candidate.dispose();
                list.remove(index);
            }
        }

        let context = match ExecutionContext::new(
            target,
            dependency_specs.to_vec(),
            Arc::clone(&self.loader),
        ) {
            Ok(context) => Arc::new(context),
            Err(e) => {
                if contexts.get(target).is_some_and(Vec::is_empty) {
                    contexts.remove(target);
                }
                return Err(e);
            }
        };
        context.try_acquire();
        let list = contexts.entry(target.to_path_buf()).or_default();
        list.push(Arc::clone(&context));
        debug!(context = %context.name(), pooled = list.len(), "Added execution context");
        Ok(context)
    }

    /// Dispose stale contexts that nobody is using.
    ///
    /// Returns the number of contexts removed. A stale context that is busy is
    /// left in place and picked up by a later call.
    pub fn recycle(&self) -> usize {
        let mut removed = 0;
        let mut contexts = self.contexts.lock();
        for list in contexts.values_mut() {
            list.retain(|context| {
                if context.is_up_to_date() || !context.try_acquire() {
                    return true;
                }
                info!(context = %context.name(), "Recycling stale execution context");
                context.dispose();
                removed += 1;
                false
            });
        }
        contexts.retain(|_, list| !list.is_empty());
        removed
    }

    /// Dispose every context, waiting for busy ones to be released.
    pub fn shutdown(&self) {
        loop {
            {
                let mut contexts = self.contexts.lock();
                for list in contexts.values_mut() {
                    list.retain(|context| {
                        if context.try_acquire() {
                            context.dispose();
                            false
                        } else {
                            true
                        }
                    });
                }
                contexts.retain(|_, list| !list.is_empty());
                if contexts.is_empty() {
                    break;
                }
                debug!(remaining = contexts.len(), "Waiting for busy execution contexts");
            }
            std::thread::sleep(SHUTDOWN_POLL);
        }
        info!("Execution context pool shut down");
    }

    /// Number of pooled contexts across all targets.
    pub fn len(&self) -> usize {
        self.contexts.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the pooled contexts for `target`, in pool order.
    pub fn contexts_for(&self, target: &Path) -> Vec<Arc<ExecutionContext>> {
        self.contexts
            .lock()
            .get(target)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InProcessLoader;
    use crate::logging::TracingSink;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("tool.so");
        fs::write(&target, b"tool").unwrap();
        (tmp, target)
    }

    fn touch(path: &Path, time: SystemTime) {
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(time).unwrap();
    }

    #[test]
    fn test_config_defaults_to_disabled() {
        assert!(!PoolConfig::default().pooling);
    }

    #[test]
    fn test_unpooled_run_disposes_context() {
        let (_tmp, target) = setup();
        let loader = InProcessLoader::new(|_, _| Ok(3));
        let pool = ExecutionContextPool::new(PoolConfig::default(), Arc::new(loader.clone()));

        assert_eq!(pool.run(&target, &[], &[], &TracingSink).unwrap(), 3);
        assert_eq!(pool.run(&target, &[], &[], &TracingSink).unwrap(), 3);

        assert_eq!(loader.load_count(), 2);
        assert_eq!(loader.live_count(), 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_pooled_run_reuses_context() {
        let (_tmp, target) = setup();
        let loader = InProcessLoader::new(|_, _| Ok(0));
        let pool = ExecutionContextPool::new(PoolConfig { pooling: true }, Arc::new(loader.clone()));

        pool.run(&target, &[], &[], &TracingSink).unwrap();
        let first = pool.contexts_for(&target);
        pool.run(&target, &[], &[], &TracingSink).unwrap();
        let second = pool.contexts_for(&target);

        assert_eq!(first.len(), 1);
        assert!(Arc::ptr_eq(&first[0], &second[0]));
        assert_eq!(loader.load_count(), 1);
        assert!(!second[0].is_locked());
    }

    #[test]
    fn test_busy_context_forces_new_one() {
        let (_tmp, target) = setup();
        let loader = InProcessLoader::new(|_, _| Ok(0));
        let pool = ExecutionContextPool::new(PoolConfig { pooling: true }, Arc::new(loader));

        pool.run(&target, &[], &[], &TracingSink).unwrap();
        let held = pool.contexts_for(&target)[0].clone();
        assert!(held.try_acquire());

        pool.run(&target, &[], &[], &TracingSink).unwrap();
        assert_eq!(pool.len(), 2);
        held.release();
    }

    #[test]
    fn test_missing_target_propagates() {
        let tmp = TempDir::new().unwrap();
        let pool = ExecutionContextPool::new(
            PoolConfig { pooling: true },
            Arc::new(InProcessLoader::new(|_, _| Ok(0))),
        );
        let err = pool
            .run(&tmp.path().join("gone.so"), &[], &[], &TracingSink)
            .unwrap_err();
        assert!(matches!(err, ContextError::TargetMissing(_)));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_failed_construction_leaves_no_entry() {
        let (tmp, target) = setup();
        let pool = ExecutionContextPool::new(
            PoolConfig { pooling: true },
            Arc::new(InProcessLoader::new(|_, _| Ok(0))),
        );
        let gone = tmp.path().join("gone.so");
        assert!(pool.run(&gone, &[], &[], &TracingSink).is_err());
        assert!(pool.contexts.lock().is_empty());

        // A target whose only context went stale and then vanished.
        pool.run(&target, &[], &[], &TracingSink).unwrap();
        fs::remove_file(&target).unwrap();
        assert!(pool.run(&target, &[], &[], &TracingSink).is_err());
        assert!(pool.contexts_for(&target).is_empty());
        assert!(pool.contexts.lock().is_empty());
    }

    #[test]
    fn test_recycle_skips_busy_stale_context() {
        let (_tmp, target) = setup();
        touch(&target, UNIX_EPOCH + std::time::Duration::from_secs(10));
        let pool = ExecutionContextPool::new(
            PoolConfig { pooling: true },
            Arc::new(InProcessLoader::new(|_, _| Ok(0))),
        );
        pool.run(&target, &[], &[], &TracingSink).unwrap();
        let context = pool.contexts_for(&target)[0].clone();

        touch(&target, UNIX_EPOCH + std::time::Duration::from_secs(20));
        assert!(context.try_acquire());
        assert_eq!(pool.recycle(), 0);
        assert!(!context.is_disposed());
        assert_eq!(pool.len(), 1);

        context.release();
        assert_eq!(pool.recycle(), 1);
        assert!(context.is_disposed());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_recycle_keeps_fresh_contexts() {
        let (_tmp, target) = setup();
        let pool = ExecutionContextPool::new(
            PoolConfig { pooling: true },
            Arc::new(InProcessLoader::new(|_, _| Ok(0))),
        );
        pool.run(&target, &[], &[], &TracingSink).unwrap();
        assert_eq!(pool.recycle(), 0);
        assert_eq!(pool.len(), 1);
        assert!(!pool.contexts_for(&target)[0].is_locked());
    }

    #[test]
    fn test_shutdown_waits_for_busy_context() {
        let (_tmp, target) = setup();
        let loader = InProcessLoader::new(|_, _| Ok(0));
        let pool = Arc::new(ExecutionContextPool::new(
            PoolConfig { pooling: true },
            Arc::new(loader.clone()),
        ));
        pool.run(&target, &[], &[], &TracingSink).unwrap();
        let context = pool.contexts_for(&target)[0].clone();
        assert!(context.try_acquire());

        let releaser = {
            let context = Arc::clone(&context);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(50));
                context.release();
            })
        };
        pool.shutdown();
        releaser.join().unwrap();

        assert!(pool.is_empty());
        assert!(context.is_disposed());
        assert_eq!(loader.live_count(), 0);
    }
}
