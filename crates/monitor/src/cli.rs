use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use watchtower_engine::EngineConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "watchtower", version, about = "Watchtower monitoring daemon")]
pub struct Cli {
    /// Path to the JSON endpoints file.
    #[arg(long, env = "WATCHTOWER_ENDPOINTS", default_value = "endpoints.json")]
    pub endpoints: PathBuf,

    /// Number of probe workers to run in parallel.
    #[arg(
        short = 'w',
        long,
        env = "WATCHTOWER_WORKERS",
        default_value_t = EngineConfig::DEFAULT_WORKER_COUNT as u16,
        value_parser = clap::value_parser!(u16).range(1..=512)
    )]
    pub workers: u16,

    /// Consecutive failures before an incident auto-opens.
    #[arg(
        long,
        env = "WATCHTOWER_FAIL_THRESHOLD",
        default_value_t = EngineConfig::DEFAULT_FAIL_THRESHOLD
    )]
    pub fail_threshold: u32,

    /// Consecutive successes before an auto-incident resolves.
    #[arg(
        long,
        env = "WATCHTOWER_RECOVERY_THRESHOLD",
        default_value_t = EngineConfig::DEFAULT_RECOVERY_THRESHOLD
    )]
    pub recovery_threshold: u32,

    /// Floor on endpoint check intervals, in seconds.
    #[arg(long, env = "WATCHTOWER_MIN_INTERVAL", default_value_t = 60)]
    pub min_interval_secs: u64,

    /// Write the live event stream to stdout as SSE frames.
    #[arg(long, env = "WATCHTOWER_STREAM", default_value_t = false)]
    pub stream: bool,
}

impl Cli {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            worker_count: self.workers as usize,
            fail_threshold: self.fail_threshold,
            recovery_threshold: self.recovery_threshold,
            min_interval: Duration::from_secs(self.min_interval_secs),
            ..EngineConfig::default()
        }
    }
}
