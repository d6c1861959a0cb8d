//! System-wide configuration values and tuning defaults.

// Queue settings defaults (overridable per queue and via environment)

/// Default cap on simultaneous dispatches per queue.
pub const DEFAULT_MAX_CONCURRENCY: usize = 3;

/// Default upper bound on retry attempts per task.
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Default base backoff between retry attempts, in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;

/// Default hard deadline for one dispatch, in milliseconds (5 minutes).
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 300_000;

// Scheduler loop

/// Poll granularity of the scheduler loop while idle or paused.
/// 100ms keeps pause/resume/stop latency below human perception without
/// measurable CPU cost.
pub const SCHEDULER_TICK_INTERVAL_MS: u64 = 100;

/// Poll granularity between dispatch rounds while the queue is active.
pub const DISPATCH_POLL_INTERVAL_MS: u64 = 20;

/// Ceiling on exponential retry backoff (5 minutes). `retryDelay * 2^(n-1)`
/// is unbounded for large `maxRetries`; the cap keeps worst-case requeue
/// latency finite.
pub const RETRY_BACKOFF_CAP_MS: u64 = 300_000;

// Agent invocation

/// Per-frame read deadline on the agent response stream, in seconds.
/// A proxy that buffers or a hung agent produces no frames; 30s is long
/// enough for slow model output and short enough to fail fast.
pub const STREAM_READ_TIMEOUT_SECS: u64 = 30;

/// Path of the chat endpoint on every worker agent.
pub const AGENT_CHAT_PATH: &str = "/api/chat";

// Event fan-out

/// Per-queue broadcast channel capacity. Delivery is best-effort; a slow
/// subscriber that falls more than this many events behind observes a gap.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Buffer between a running scheduler and its event consumer.
pub const SCHEDULER_EVENT_BUFFER: usize = 64;

// Store key layout

pub const KEY_QUEUE_PREFIX: &str = "queue:";
pub const KEY_QUEUE_TASKS_PREFIX: &str = "queue:tasks:";
pub const KEY_QUEUE_PENDING_PREFIX: &str = "queue:pending:";
pub const KEY_TASK_PREFIX: &str = "task:";
pub const KEY_QUEUE_INDEX: &str = "queues";
pub const KEY_BUSY_AGENTS: &str = "busy_agents";
pub const CHANNEL_QUEUE_EVENTS_PREFIX: &str = "queue:events:";
