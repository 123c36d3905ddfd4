use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use std::path::PathBuf;

/// Runtime configuration for the `token-renewer` controller.
///
/// All values are parsed from CLI arguments or environment variables, and a
/// `.env` file in the working directory is loaded first.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "token-renewer",
    version,
    about = "Keeps credentials renewed through gRPC provider plugins"
)]
pub struct CliArgs {
    /// Address plugins dial to open their multiplexed stream.
    ///
    /// Either `unix://PATH` or `tcp://HOST:PORT`.
    ///
    /// Environment variable: `PLUGIN_ADDR`
    #[arg(long, env = "PLUGIN_ADDR", default_value_t = String::from("unix:///tmp/token-renewer.sock"))]
    pub plugin_addr: String,

    /// Directory scanned for `*.sock` files served by unary plugins.
    ///
    /// Environment variable: `PLUGINS_DIR`
    #[arg(long, env = "PLUGINS_DIR")]
    pub plugins_dir: Option<PathBuf>,

    /// JSON file seeding the policies and credential store entries.
    ///
    /// Environment variable: `STATE_FILE`
    #[arg(long, env = "STATE_FILE")]
    pub state_file: PathBuf,

    /// Upper bound for a single provider call, in seconds.
    ///
    /// Environment variable: `CALL_TIMEOUT_SECS`
    #[arg(long, env = "CALL_TIMEOUT_SECS", default_value_t = 30)]
    pub call_timeout_secs: u64,

    /// Time a connecting plugin has to send its registration, in seconds.
    ///
    /// Environment variable: `HANDSHAKE_TIMEOUT_SECS`
    #[arg(long, env = "HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    /// Upper bound for one whole evaluation, in seconds.
    ///
    /// Environment variable: `EVALUATION_TIMEOUT_SECS`
    #[arg(long, env = "EVALUATION_TIMEOUT_SECS", default_value_t = 120)]
    pub evaluation_timeout_secs: u64,

    /// Longest sleep between two evaluations of the same policy, in seconds.
    ///
    /// Environment variable: `RESYNC_SECS`
    #[arg(long, env = "RESYNC_SECS", default_value_t = 3600)]
    pub resync_secs: u64,

    /// Delay before retrying a failed evaluation, in milliseconds, for the
    /// first `max_fast_retries` consecutive failures.
    ///
    /// Environment variable: `FAST_RETRY_MS`
    #[arg(long, env = "FAST_RETRY_MS", default_value_t = 100)]
    pub fast_retry_ms: u64,

    /// Delay before retrying once fast retries are exhausted, in seconds.
    ///
    /// Environment variable: `SLOW_RETRY_SECS`
    #[arg(long, env = "SLOW_RETRY_SECS", default_value_t = 300)]
    pub slow_retry_secs: u64,

    /// Number of consecutive failures retried with the fast delay.
    ///
    /// Environment variable: `MAX_FAST_RETRIES`
    #[arg(long, env = "MAX_FAST_RETRIES", default_value_t = 3)]
    pub max_fast_retries: u32,

    /// Capacity of each plugin session's outbound frame queue.
    ///
    /// Environment variable: `OUTBOUND_BUFFER`
    #[arg(long, env = "OUTBOUND_BUFFER", default_value_t = 64)]
    pub outbound_buffer: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Unix(PathBuf),
    Tcp(String),
}

impl core::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// Splits a `unix://PATH` or `tcp://HOST:PORT` address.
pub fn parse_addr(addr: &str) -> anyhow::Result<ListenAddr> {
    if let Some(path) = addr.strip_prefix("unix://") {
        if path.is_empty() {
            bail!("missing socket path in {addr:?}");
        }
        return Ok(ListenAddr::Unix(PathBuf::from(path)));
    }
    if let Some(host) = addr.strip_prefix("tcp://") {
        if host.is_empty() {
            bail!("missing host in {addr:?}");
        }
        return Ok(ListenAddr::Tcp(host.to_string()));
    }
    bail!("unsupported address scheme in {addr:?}, expected unix:// or tcp://")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub fast: Duration,
    pub slow: Duration,
    pub max_fast_retries: u32,
}

impl Backoff {
    /// Delay before the next attempt after `failures` consecutive failures.
    pub const fn delay(&self, failures: u32) -> Duration {
        if failures <= self.max_fast_retries {
            self.fast
        } else {
            self.slow
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: ListenAddr,
    pub plugins_dir: Option<PathBuf>,
    pub state_file: PathBuf,
    pub call_timeout: Duration,
    pub handshake_timeout: Duration,
    pub evaluation_timeout: Duration,
    pub resync: Duration,
    pub backoff: Backoff,
    pub outbound_buffer: usize,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let listen = parse_addr(&args.plugin_addr).context("invalid PLUGIN_ADDR")?;

        if args.call_timeout_secs == 0 {
            bail!("CALL_TIMEOUT_SECS must be greater than 0");
        }
        if args.handshake_timeout_secs == 0 {
            bail!("HANDSHAKE_TIMEOUT_SECS must be greater than 0");
        }
        if args.evaluation_timeout_secs == 0 {
            bail!("EVALUATION_TIMEOUT_SECS must be greater than 0");
        }
        if args.resync_secs == 0 {
            bail!("RESYNC_SECS must be greater than 0");
        }
        if args.outbound_buffer == 0 {
            bail!("OUTBOUND_BUFFER must be greater than 0");
        }
        if args.slow_retry_secs.saturating_mul(1000) < args.fast_retry_ms {
            bail!(
                "SLOW_RETRY_SECS ({}s) must not be shorter than FAST_RETRY_MS ({}ms)",
                args.slow_retry_secs,
                args.fast_retry_ms
            );
        }

        Ok(Self {
            listen,
            plugins_dir: args.plugins_dir,
            state_file: args.state_file,
            call_timeout: Duration::from_secs(args.call_timeout_secs),
            handshake_timeout: Duration::from_secs(args.handshake_timeout_secs),
            evaluation_timeout: Duration::from_secs(args.evaluation_timeout_secs),
            resync: Duration::from_secs(args.resync_secs),
            backoff: Backoff {
                fast: Duration::from_millis(args.fast_retry_ms),
                slow: Duration::from_secs(args.slow_retry_secs),
                max_fast_retries: args.max_fast_retries,
            },
            outbound_buffer: args.outbound_buffer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> anyhow::Result<ServerConfig> {
        let mut argv = vec!["token-renewer", "--state-file", "state.json"];
        argv.extend_from_slice(extra);
        ServerConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn addresses() {
        assert_eq!(
            parse_addr("unix:///run/renewer.sock").unwrap(),
            ListenAddr::Unix(PathBuf::from("/run/renewer.sock"))
        );
        assert_eq!(
            parse_addr("tcp://0.0.0.0:50051").unwrap(),
            ListenAddr::Tcp("0.0.0.0:50051".into())
        );
        assert!(parse_addr("unix://").is_err());
        assert!(parse_addr("http://localhost:80").is_err());
        assert!(parse_addr("short").is_err());
    }

    #[test]
    fn defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(
            config.listen,
            ListenAddr::Unix(PathBuf::from("/tmp/token-renewer.sock"))
        );
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.resync, Duration::from_secs(3600));
        assert_eq!(config.backoff.fast, Duration::from_millis(100));
        assert_eq!(config.backoff.slow, Duration::from_secs(300));
        assert_eq!(config.outbound_buffer, 64);
        assert!(config.plugins_dir.is_none());
    }

    #[test]
    fn rejects_zero_timeouts() {
        assert!(parse(&["--call-timeout-secs", "0"]).is_err());
        assert!(parse(&["--outbound-buffer", "0"]).is_err());
    }

    #[test]
    fn backoff_switches_to_slow() {
        let backoff = Backoff {
            fast: Duration::from_millis(100),
            slow: Duration::from_secs(300),
            max_fast_retries: 3,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(3), Duration::from_millis(100));
        assert_eq!(backoff.delay(4), Duration::from_secs(300));
    }
}
