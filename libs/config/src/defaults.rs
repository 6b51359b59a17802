//! Default values shared by fibers and the location service
//!
//! These back the `Default` impls in [`crate::settings`] so that an empty
//! configuration file yields a working single-process deployment.

/// Process identity defaults
pub mod process {
    /// Process id used when none is configured
    pub const ID: u32 = 1;

    /// Lowest process id an operator may assign
    pub const MIN_ID: u32 = 1;

    /// Highest process id an operator may assign (16-bit address field)
    pub const MAX_ID: u32 = 65_535;
}

/// RPC correlation defaults
pub mod rpc {
    /// Deadline stamped on every pending call (milliseconds)
    pub const TIMEOUT_MS: u64 = 40_000;

    /// Interval between sweeps of expired calls (milliseconds)
    pub const SWEEP_INTERVAL_MS: u64 = 1_000;
}

/// CoroutineLock defaults
pub mod lock {
    /// Upper bound on waiting for a keyed lock (milliseconds)
    pub const WAIT_TIMEOUT_MS: u64 = 60_000;

    /// Queue depth at which hand-offs start logging warnings
    pub const LEVEL_WARN_THRESHOLD: u32 = 100;

    /// Deferred hand-offs processed per tick
    pub const DRAIN_CAP_PER_TICK: usize = 1_000;

    /// Tick interval for deferred hand-offs (milliseconds)
    pub const TICK_INTERVAL_MS: u64 = 10;
}

/// Location directory defaults
pub mod location {
    /// Lease granted to a migration lock when the caller gives none (milliseconds)
    pub const LEASE_MS: u64 = 60_000;

    /// Interval between directory stats log lines in the service binary (seconds)
    pub const STATS_INTERVAL_SECS: u64 = 30;
}
