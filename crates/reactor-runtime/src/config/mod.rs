//! Reactor configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Environment variables (runtime)
//! 2. User's rct_config.rs (compile-time, via `RCT_CONFIG_RS`)
//! 3. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use reactor_runtime::config::ReactorConfig;
//!
//! let config = ReactorConfig::from_env()
//!     .smp(4)
//!     .task_quota(Duration::from_micros(500));
//! config.validate()?;
//! ```

pub mod defaults {
    include!(concat!(env!("OUT_DIR"), "/rct_merged_config.rs"));
}

use reactor_core::env::{env_get, env_get_bool, env_get_ms, env_get_opt, env_get_us};
use std::str::FromStr;
use std::time::Duration;

pub use reactor_core::error::ConfigError;

/// Disk I/O submission backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoBackendKind {
    /// io_uring when the kernel allows it, threaded otherwise
    Auto,
    Uring,
    /// pread/pwrite on the syscall thread
    Threaded,
}

impl FromStr for IoBackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(IoBackendKind::Auto),
            "uring" | "io_uring" | "io-uring" => Ok(IoBackendKind::Uring),
            "threaded" | "thread" | "pool" => Ok(IoBackendKind::Threaded),
            _ => Err(ConfigError::InvalidValue("io_backend must be auto, uring or threaded")),
        }
    }
}

/// Reactor configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Number of shards; 0 means one per allowed CPU
    pub smp: usize,
    /// CPUs shards may be pinned to (None = all online CPUs)
    pub cpuset: Option<Vec<usize>>,
    /// Pin shard threads to CPUs
    pub thread_affinity: bool,
    /// Preemption tick; a task queue runs at most this long per pass
    pub task_quota: Duration,
    /// Stall length that triggers the first report
    pub blocked_reactor_notify: Duration,
    /// Stall reports allowed per minute
    pub blocked_reactor_reports_per_minute: u32,
    /// Tasks allowed to queue before preemption stops cutting passes short
    pub max_task_backlog: usize,
    /// How long to keep polling an idle shard before sleeping
    pub idle_poll_time: Duration,
    /// Never sleep; spin on the pollers
    pub poll_mode: bool,
    /// In-flight disk requests per machine; 0 = 128 per io queue
    pub max_io_requests: usize,
    /// Number of io coordinators; 0 = one per shard
    pub num_io_queues: usize,
    /// Fall back to buffered I/O when O_DIRECT is refused
    pub relaxed_dma: bool,
    /// Disk submission backend
    pub io_backend: IoBackendKind,
    /// io_uring submission depth per shard
    pub max_aio: usize,
    /// Ring capacity of each cross-shard queue
    pub smp_queue_length: usize,
    /// Items accumulated before a cross-shard batch is pushed
    pub smp_batch_size: usize,
    /// Outstanding blocking syscalls per shard
    pub syscall_queue_length: usize,
    /// Size multiplier for speculative truncate-ahead on append-challenged files
    pub sloppy_growth_factor: u64,
    /// Skip fdatasync (tests and throwaway data only)
    pub bypass_fsync: bool,
    /// SIGINT/SIGTERM stop the application
    pub handle_sigint: bool,
    /// Tick of the low resolution clock
    pub lowres_granularity: Duration,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ReactorConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `RCT_SMP` - Number of shards
    /// - `RCT_CPUSET` - Allowed CPUs, e.g. `0-3,8`
    /// - `RCT_THREAD_AFFINITY` - Pin shards (0/1)
    /// - `RCT_TASK_QUOTA_US` - Preemption quota in microseconds
    /// - `RCT_BLOCKED_REACTOR_NOTIFY_MS` - Stall report threshold
    /// - `RCT_BLOCKED_REACTOR_REPORTS_PER_MINUTE` - Stall report rate limit
    /// - `RCT_MAX_TASK_BACKLOG` - Backlog before preemption is ignored
    /// - `RCT_IDLE_POLL_TIME_US` - Idle polling before sleeping
    /// - `RCT_POLL_MODE` - Never sleep (0/1)
    /// - `RCT_MAX_IO_REQUESTS` - Machine-wide in-flight disk requests
    /// - `RCT_NUM_IO_QUEUES` - Number of io coordinators
    /// - `RCT_RELAXED_DMA` - Allow buffered fallback (0/1)
    /// - `RCT_IO_BACKEND` - auto / uring / threaded
    /// - `RCT_MAX_AIO` - io_uring depth per shard
    /// - `RCT_SMP_QUEUE_LENGTH`, `RCT_SMP_BATCH_SIZE` - Cross-shard queue shape
    /// - `RCT_SYSCALL_QUEUE_LENGTH` - Blocking syscall queue length
    /// - `RCT_SLOPPY_GROWTH_FACTOR` - Truncate-ahead multiplier
    /// - `RCT_UNSAFE_BYPASS_FSYNC` - Skip fdatasync (0/1)
    /// - `RCT_HANDLE_SIGINT` - Stop on SIGINT/SIGTERM (0/1)
    pub fn from_env() -> Self {
        let idle_default = if crate::platform_linux::is_virtualized() {
            defaults::VIRTUALIZED_IDLE_POLL_TIME_US
        } else {
            defaults::IDLE_POLL_TIME_US
        };
        let cpuset = std::env::var("RCT_CPUSET")
            .ok()
            .and_then(|s| match parse_cpuset(&s) {
                Ok(set) => Some(set),
                Err(e) => {
                    reactor_core::kwarn!("ignoring RCT_CPUSET={}: {}", s, e);
                    None
                }
            });
        let io_backend = env_get_opt::<String>("RCT_IO_BACKEND")
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| defaults::IO_BACKEND.parse().unwrap_or(IoBackendKind::Auto));

        Self {
            smp: env_get("RCT_SMP", defaults::SMP),
            cpuset,
            thread_affinity: env_get_bool("RCT_THREAD_AFFINITY", defaults::THREAD_AFFINITY),
            task_quota: env_get_us(
                "RCT_TASK_QUOTA_US",
                Duration::from_micros(defaults::TASK_QUOTA_US),
            ),
            blocked_reactor_notify: env_get_ms(
                "RCT_BLOCKED_REACTOR_NOTIFY_MS",
                Duration::from_millis(defaults::BLOCKED_REACTOR_NOTIFY_MS),
            ),
            blocked_reactor_reports_per_minute: env_get(
                "RCT_BLOCKED_REACTOR_REPORTS_PER_MINUTE",
                defaults::BLOCKED_REACTOR_REPORTS_PER_MINUTE,
            ),
            max_task_backlog: env_get("RCT_MAX_TASK_BACKLOG", defaults::MAX_TASK_BACKLOG),
            idle_poll_time: env_get_us("RCT_IDLE_POLL_TIME_US", Duration::from_micros(idle_default)),
            poll_mode: env_get_bool("RCT_POLL_MODE", defaults::POLL_MODE),
            max_io_requests: env_get("RCT_MAX_IO_REQUESTS", defaults::MAX_IO_REQUESTS),
            num_io_queues: env_get("RCT_NUM_IO_QUEUES", defaults::NUM_IO_QUEUES),
            relaxed_dma: env_get_bool("RCT_RELAXED_DMA", defaults::RELAXED_DMA),
            io_backend,
            max_aio: env_get("RCT_MAX_AIO", defaults::MAX_AIO),
            smp_queue_length: env_get("RCT_SMP_QUEUE_LENGTH", defaults::SMP_QUEUE_LENGTH),
            smp_batch_size: env_get("RCT_SMP_BATCH_SIZE", defaults::SMP_BATCH_SIZE),
            syscall_queue_length: env_get(
                "RCT_SYSCALL_QUEUE_LENGTH",
                defaults::SYSCALL_QUEUE_LENGTH,
            ),
            sloppy_growth_factor: env_get(
                "RCT_SLOPPY_GROWTH_FACTOR",
                defaults::SLOPPY_GROWTH_FACTOR,
            ),
            bypass_fsync: env_get_bool("RCT_UNSAFE_BYPASS_FSYNC", defaults::BYPASS_FSYNC),
            handle_sigint: env_get_bool("RCT_HANDLE_SIGINT", defaults::HANDLE_SIGINT),
            lowres_granularity: Duration::from_millis(defaults::LOWRES_GRANULARITY_MS),
        }
    }

    /// Create config with compile-time defaults only (no env override).
    pub fn new() -> Self {
        Self {
            smp: defaults::SMP,
            cpuset: None,
            thread_affinity: defaults::THREAD_AFFINITY,
            task_quota: Duration::from_micros(defaults::TASK_QUOTA_US),
            blocked_reactor_notify: Duration::from_millis(defaults::BLOCKED_REACTOR_NOTIFY_MS),
            blocked_reactor_reports_per_minute: defaults::BLOCKED_REACTOR_REPORTS_PER_MINUTE,
            max_task_backlog: defaults::MAX_TASK_BACKLOG,
            idle_poll_time: Duration::from_micros(defaults::IDLE_POLL_TIME_US),
            poll_mode: defaults::POLL_MODE,
            max_io_requests: defaults::MAX_IO_REQUESTS,
            num_io_queues: defaults::NUM_IO_QUEUES,
            relaxed_dma: defaults::RELAXED_DMA,
            io_backend: defaults::IO_BACKEND.parse().unwrap_or(IoBackendKind::Auto),
            max_aio: defaults::MAX_AIO,
            smp_queue_length: defaults::SMP_QUEUE_LENGTH,
            smp_batch_size: defaults::SMP_BATCH_SIZE,
            syscall_queue_length: defaults::SYSCALL_QUEUE_LENGTH,
            sloppy_growth_factor: defaults::SLOPPY_GROWTH_FACTOR,
            bypass_fsync: defaults::BYPASS_FSYNC,
            handle_sigint: defaults::HANDLE_SIGINT,
            lowres_granularity: Duration::from_millis(defaults::LOWRES_GRANULARITY_MS),
        }
    }

    /// Small deterministic setup for unit tests: no pinning, threaded
    /// disk I/O, no signal handling.
    pub fn for_tests(smp: usize) -> Self {
        Self::new()
            .smp(smp)
            .thread_affinity(false)
            .io_backend(IoBackendKind::Threaded)
            .handle_sigint(false)
            .relaxed_dma(true)
            .bypass_fsync(true)
    }

    // Builder methods

    pub fn smp(mut self, n: usize) -> Self {
        self.smp = n;
        self
    }

    pub fn cpuset(mut self, cpus: Vec<usize>) -> Self {
        self.cpuset = Some(cpus);
        self
    }

    pub fn thread_affinity(mut self, enable: bool) -> Self {
        self.thread_affinity = enable;
        self
    }

    pub fn task_quota(mut self, d: Duration) -> Self {
        self.task_quota = d;
        self
    }

    pub fn blocked_reactor_notify(mut self, d: Duration) -> Self {
        self.blocked_reactor_notify = d;
        self
    }

    pub fn blocked_reactor_reports_per_minute(mut self, n: u32) -> Self {
        self.blocked_reactor_reports_per_minute = n;
        self
    }

    pub fn max_task_backlog(mut self, n: usize) -> Self {
        self.max_task_backlog = n;
        self
    }

    pub fn idle_poll_time(mut self, d: Duration) -> Self {
        self.idle_poll_time = d;
        self
    }

    pub fn poll_mode(mut self, enable: bool) -> Self {
        self.poll_mode = enable;
        self
    }

    pub fn max_io_requests(mut self, n: usize) -> Self {
        self.max_io_requests = n;
        self
    }

    pub fn num_io_queues(mut self, n: usize) -> Self {
        self.num_io_queues = n;
        self
    }

    pub fn relaxed_dma(mut self, enable: bool) -> Self {
        self.relaxed_dma = enable;
        self
    }

    pub fn io_backend(mut self, kind: IoBackendKind) -> Self {
        self.io_backend = kind;
        self
    }

    pub fn max_aio(mut self, n: usize) -> Self {
        self.max_aio = n;
        self
    }

    pub fn smp_queue_length(mut self, n: usize) -> Self {
        self.smp_queue_length = n;
        self
    }

    pub fn smp_batch_size(mut self, n: usize) -> Self {
        self.smp_batch_size = n;
        self
    }

    pub fn syscall_queue_length(mut self, n: usize) -> Self {
        self.syscall_queue_length = n;
        self
    }

    pub fn sloppy_growth_factor(mut self, factor: u64) -> Self {
        self.sloppy_growth_factor = factor;
        self
    }

    pub fn bypass_fsync(mut self, enable: bool) -> Self {
        self.bypass_fsync = enable;
        self
    }

    pub fn handle_sigint(mut self, enable: bool) -> Self {
        self.handle_sigint = enable;
        self
    }

    // Resolved values

    /// CPUs available to shards, in pinning order.
    pub fn allowed_cpus(&self) -> Vec<usize> {
        match &self.cpuset {
            Some(set) => set.clone(),
            None => crate::platform_linux::online_cpus(),
        }
    }

    /// Shard count after resolving `smp = 0`.
    pub fn shard_count(&self) -> usize {
        if self.smp == 0 {
            self.allowed_cpus().len().max(1)
        } else {
            self.smp
        }
    }

    /// Number of io coordinators.
    pub fn io_queue_count(&self) -> usize {
        if self.num_io_queues == 0 {
            self.shard_count()
        } else {
            self.num_io_queues
        }
    }

    /// Machine-wide in-flight disk request budget.
    pub fn io_request_budget(&self) -> usize {
        if self.max_io_requests == 0 {
            128 * self.io_queue_count()
        } else {
            self.max_io_requests
        }
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let shards = self.shard_count();
        if shards == 0 || shards > 256 {
            return Err(ConfigError::InvalidValue("smp must be between 1 and 256"));
        }
        if let Some(set) = &self.cpuset {
            if set.is_empty() {
                return Err(ConfigError::InvalidValue("cpuset must not be empty"));
            }
        }
        if self.task_quota.is_zero() {
            return Err(ConfigError::InvalidValue("task_quota must be > 0"));
        }
        if self.blocked_reactor_reports_per_minute == 0 {
            return Err(ConfigError::InvalidValue(
                "blocked_reactor_reports_per_minute must be >= 1",
            ));
        }
        let queues = self.io_queue_count();
        if queues == 0 || queues > shards {
            return Err(ConfigError::InvalidValue("num_io_queues must be between 1 and smp"));
        }
        if self.io_request_budget() < queues {
            return Err(ConfigError::InvalidValue("max_io_requests must be >= num_io_queues"));
        }
        if self.max_aio == 0 {
            return Err(ConfigError::InvalidValue("max_aio must be > 0"));
        }
        if self.smp_queue_length == 0 {
            return Err(ConfigError::InvalidValue("smp_queue_length must be > 0"));
        }
        if self.smp_batch_size == 0 || self.smp_batch_size > self.smp_queue_length {
            return Err(ConfigError::InvalidValue(
                "smp_batch_size must be between 1 and smp_queue_length",
            ));
        }
        if self.syscall_queue_length == 0 {
            return Err(ConfigError::InvalidValue("syscall_queue_length must be > 0"));
        }
        if self.sloppy_growth_factor < 1 {
            return Err(ConfigError::InvalidValue("sloppy_growth_factor must be >= 1"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("Reactor Configuration:");
        eprintln!("  smp:                     {}", self.shard_count());
        eprintln!("  cpuset:                  {:?}", self.cpuset);
        eprintln!("  thread_affinity:         {}", self.thread_affinity);
        eprintln!("  task_quota:              {:?}", self.task_quota);
        eprintln!("  blocked_reactor_notify:  {:?}", self.blocked_reactor_notify);
        eprintln!("  reports_per_minute:      {}", self.blocked_reactor_reports_per_minute);
        eprintln!("  max_task_backlog:        {}", self.max_task_backlog);
        eprintln!("  idle_poll_time:          {:?}", self.idle_poll_time);
        eprintln!("  poll_mode:               {}", self.poll_mode);
        eprintln!("  max_io_requests:         {}", self.io_request_budget());
        eprintln!("  num_io_queues:           {}", self.io_queue_count());
        eprintln!("  relaxed_dma:             {}", self.relaxed_dma);
        eprintln!("  io_backend:              {:?}", self.io_backend);
        eprintln!("  max_aio:                 {}", self.max_aio);
        eprintln!("  smp_queue_length:        {}", self.smp_queue_length);
        eprintln!("  smp_batch_size:          {}", self.smp_batch_size);
        eprintln!("  syscall_queue_length:    {}", self.syscall_queue_length);
        eprintln!("  sloppy_growth_factor:    {}", self.sloppy_growth_factor);
        eprintln!("  bypass_fsync:            {}", self.bypass_fsync);
        eprintln!("  handle_sigint:           {}", self.handle_sigint);
    }
}

/// Parse a cpuset(7) list such as `0-3,8,10-11`.
pub fn parse_cpuset(s: &str) -> Result<Vec<usize>, ConfigError> {
    const BAD: ConfigError = ConfigError::InvalidValue("malformed cpuset list");
    let mut cpus = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().map_err(|_| BAD)?;
                let hi: usize = hi.trim().parse().map_err(|_| BAD)?;
                if hi < lo {
                    return Err(BAD);
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.parse().map_err(|_| BAD)?),
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    if cpus.is_empty() {
        return Err(BAD);
    }
    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ReactorConfig::new().smp(2);
        assert_eq!(config.task_quota, Duration::from_micros(2000));
        assert_eq!(config.io_queue_count(), 2);
        assert_eq!(config.io_request_budget(), 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ReactorConfig::new()
            .smp(8)
            .num_io_queues(2)
            .task_quota(Duration::from_micros(500))
            .poll_mode(true);

        assert_eq!(config.shard_count(), 8);
        assert_eq!(config.io_queue_count(), 2);
        assert_eq!(config.task_quota, Duration::from_micros(500));
        assert!(config.poll_mode);
    }

    #[test]
    fn test_validation() {
        assert!(ReactorConfig::new().smp(1000).validate().is_err());
        assert!(ReactorConfig::new().smp(2).num_io_queues(3).validate().is_err());
        assert!(ReactorConfig::new().smp(1).smp_batch_size(0).validate().is_err());
        assert!(ReactorConfig::new()
            .smp(1)
            .smp_queue_length(8)
            .smp_batch_size(16)
            .validate()
            .is_err());
        assert!(ReactorConfig::new().smp(1).task_quota(Duration::ZERO).validate().is_err());
        assert!(ReactorConfig::new()
            .smp(1)
            .blocked_reactor_reports_per_minute(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_parse_cpuset() {
        assert_eq!(parse_cpuset("0-3,8").unwrap(), vec![0, 1, 2, 3, 8]);
        assert_eq!(parse_cpuset(" 5 , 2-2 ,5").unwrap(), vec![2, 5]);
        assert!(parse_cpuset("3-1").is_err());
        assert!(parse_cpuset("x").is_err());
        assert!(parse_cpuset("").is_err());
    }

    #[test]
    fn test_io_backend_parse() {
        assert_eq!("URING".parse::<IoBackendKind>().unwrap(), IoBackendKind::Uring);
        assert_eq!("threaded".parse::<IoBackendKind>().unwrap(), IoBackendKind::Threaded);
        assert!("spdk".parse::<IoBackendKind>().is_err());
    }
}
