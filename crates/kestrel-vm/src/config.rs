//! Runtime configuration.
//!
//! Tunables are read from the process environment once, the first time
//! [`RuntimeConfig::global`] is consulted:
//!
//! | Variable                      | Default          |
//! |-------------------------------|------------------|
//! | `KESTREL_STACK_INITIAL_BYTES` | 64 KiB           |
//! | `KESTREL_STACK_MAX_BYTES`     | 64 MiB           |
//! | `KESTREL_MAX_FRAMES`          | 1024             |
//! | `KESTREL_POOL_WORKERS`        | number of CPUs   |
//! | `KESTREL_POOL_QUEUE`          | 256              |
//! | `KESTREL_POOL_POLICY`         | `block`          |

use std::str::FromStr;

use once_cell::sync::Lazy;

/// What happens when work is submitted to a full thread-pool queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    /// The submitter waits for space
    #[default]
    Block,
    /// Submission fails with a range error
    Reject,
}

impl FromStr for QueuePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown queue policy `{other}`")),
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Initial value-stack size in bytes.
    /// Default: 64 KiB
    pub initial_stack_bytes: usize,

    /// Largest the value stack may grow, in bytes.
    /// Default: 64 MiB
    pub max_stack_bytes: usize,

    /// Maximum number of simultaneous call frames per VM.
    /// Default: 1024
    pub max_frames: usize,

    /// Worker threads in the async thread pool.
    /// Default: number of logical CPUs
    pub pool_workers: usize,

    /// Bounded queue depth of the async thread pool.
    /// Default: 256
    pub pool_queue_depth: usize,

    /// Behavior when the pool queue is full.
    /// Default: block
    pub queue_policy: QueuePolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            initial_stack_bytes: 64 * 1024,
            max_stack_bytes: 64 * 1024 * 1024,
            max_frames: 1024,
            pool_workers: num_cpus::get().max(1),
            pool_queue_depth: 256,
            queue_policy: QueuePolicy::Block,
        }
    }
}

static GLOBAL: Lazy<RuntimeConfig> = Lazy::new(RuntimeConfig::from_env);

impl RuntimeConfig {
    /// Create a config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide config, read from the environment on first use
    pub fn global() -> &'static RuntimeConfig {
        &GLOBAL
    }

    /// Read the tunables from the process environment
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Overlay variables from `lookup` on the defaults
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        read_var(&lookup, "KESTREL_STACK_INITIAL_BYTES", &mut config.initial_stack_bytes);
        read_var(&lookup, "KESTREL_STACK_MAX_BYTES", &mut config.max_stack_bytes);
        read_var(&lookup, "KESTREL_MAX_FRAMES", &mut config.max_frames);
        read_var(&lookup, "KESTREL_POOL_WORKERS", &mut config.pool_workers);
        read_var(&lookup, "KESTREL_POOL_QUEUE", &mut config.pool_queue_depth);
        read_var(&lookup, "KESTREL_POOL_POLICY", &mut config.queue_policy);
        config.pool_workers = config.pool_workers.max(1);
        config.pool_queue_depth = config.pool_queue_depth.max(1);
        config
    }

    /// Set the initial stack size
    pub fn initial_stack_bytes(mut self, bytes: usize) -> Self {
        self.initial_stack_bytes = bytes;
        self
    }

    /// Set the maximum stack size
    pub fn max_stack_bytes(mut self, bytes: usize) -> Self {
        self.max_stack_bytes = bytes;
        self
    }

    /// Set the maximum call depth
    pub fn max_frames(mut self, frames: usize) -> Self {
        self.max_frames = frames;
        self
    }

    /// Set the pool size
    pub fn pool_workers(mut self, workers: usize) -> Self {
        self.pool_workers = workers.max(1);
        self
    }

    /// Set the pool queue depth
    pub fn pool_queue_depth(mut self, depth: usize) -> Self {
        self.pool_queue_depth = depth.max(1);
        self
    }

    /// Set the full-queue policy
    pub fn queue_policy(mut self, policy: QueuePolicy) -> Self {
        self.queue_policy = policy;
        self
    }
}

fn read_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut T)
where
    T: FromStr,
{
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(variable = name, value = %raw, "ignoring unparseable setting"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.initial_stack_bytes, 64 * 1024);
        assert_eq!(config.max_frames, 1024);
        assert_eq!(config.queue_policy, QueuePolicy::Block);
        assert!(config.pool_workers >= 1);
    }

    #[test]
    fn test_from_vars() {
        let config = RuntimeConfig::from_vars(|name| match name {
            "KESTREL_STACK_INITIAL_BYTES" => Some("1024".into()),
            "KESTREL_POOL_WORKERS" => Some(" 3 ".into()),
            "KESTREL_POOL_POLICY" => Some("Reject".into()),
            "KESTREL_MAX_FRAMES" => Some("lots".into()),
            _ => None,
        });
        assert_eq!(config.initial_stack_bytes, 1024);
        assert_eq!(config.pool_workers, 3);
        assert_eq!(config.queue_policy, QueuePolicy::Reject);
        assert_eq!(config.max_frames, 1024);
    }

    #[test]
    fn test_zero_workers_clamped() {
        let config = RuntimeConfig::from_vars(|name| {
            (name == "KESTREL_POOL_WORKERS").then(|| "0".to_string())
        });
        assert_eq!(config.pool_workers, 1);
    }
}
