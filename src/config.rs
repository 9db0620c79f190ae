use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::dispatcher::FwMark;
use crate::error::ConfigError;
use crate::payload::PayloadSource;
use crate::rawsend::TtlPolicy;
use crate::srcinfo::DEFAULT_CAPACITY;

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{s}': {e}"))
}

#[derive(Parser, Debug, Clone)]
#[command(name = "nfq_decoy")]
#[command(about = "Inject TTL-limited decoy UDP packets ahead of new flows")]
pub struct Args {
    /// Decoy payload, repeatable, used in order: sip:<uri>, file:<path> or hex:<bytes>
    #[arg(short = 'p', long = "payload", value_name = "SOURCE", required = true)]
    pub payloads: Vec<PayloadSource>,

    /// Interface to intercept on, repeatable
    #[arg(short = 'i', long = "interface", value_name = "IFACE")]
    pub interfaces: Vec<String>,

    /// Intercept on all interfaces
    #[arg(short = 'a', long, conflicts_with = "interfaces")]
    pub all_interfaces: bool,

    /// IPv4 only
    #[arg(short = '4', long, conflicts_with = "ipv6_only")]
    pub ipv4_only: bool,

    /// IPv6 only
    #[arg(short = '6', long)]
    pub ipv6_only: bool,

    /// First NFQUEUE number
    #[arg(short = 'n', long, default_value_t = 512)]
    pub queue_num: u16,

    /// Worker threads, each bound to its own queue starting at --queue-num
    #[arg(short = 'j', long, default_value_t = 1)]
    pub threads: u16,

    /// Kernel queue length per worker
    #[arg(long, default_value_t = 4096)]
    pub queue_len: u32,

    /// Mark put on handled packets and decoys
    #[arg(short = 'm', long, default_value = "0x8000", value_parser = parse_u32)]
    pub fwmark: u32,

    /// Mask for --fwmark
    #[arg(long, default_value = "0x8000", value_parser = parse_u32)]
    pub fwmask: u32,

    /// Hops believed necessary to get past the inspection point
    #[arg(long, default_value_t = 5)]
    pub reach_hops: u8,

    /// How far below --reach-hops decoys expire
    #[arg(long, default_value_t = 2)]
    pub ttl_margin: u8,

    /// Scale decoy TTL to this percentage of the peer's estimated distance
    #[arg(long, value_name = "PCT")]
    pub dynamic_pct: Option<u8>,

    /// Decoys per intercepted packet
    #[arg(short = 'r', long, default_value_t = 2)]
    pub repeat: u8,

    /// Flow cache entries
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    pub cache_capacity: usize,

    /// Raw socket send timeout in milliseconds
    #[arg(long, default_value_t = 10)]
    pub send_timeout_ms: u64,

    /// Do not touch iptables; rules are managed elsewhere
    #[arg(short = 'f', long)]
    pub skip_firewall: bool,

    /// Statistics report interval in seconds, 0 disables
    #[arg(long, default_value_t = 60)]
    pub stats_interval: u64,

    /// Only log warnings and errors
    #[arg(short = 's', long)]
    pub silent: bool,

    /// More logging, repeat for trace
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Append logs to this file instead of stderr
    #[arg(short = 'w', long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Families {
    Both,
    V4,
    V6,
}

impl Families {
    pub fn ipv4(self) -> bool {
        matches!(self, Families::Both | Families::V4)
    }

    pub fn ipv6(self) -> bool {
        matches!(self, Families::Both | Families::V6)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interfaces {
    All,
    Named(Vec<String>),
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub payloads: Vec<PayloadSource>,
    pub interfaces: Interfaces,
    pub families: Families,
    pub queue_num: u16,
    pub threads: u16,
    pub queue_len: u32,
    pub mark: FwMark,
    pub ttl: TtlPolicy,
    pub repeat: usize,
    pub cache_capacity: usize,
    pub send_timeout: Duration,
    pub skip_firewall: bool,
    pub stats_interval: Duration,
}

impl Config {
    pub fn queue_range(&self) -> (u16, u16) {
        (self.queue_num, self.queue_num + (self.threads - 1))
    }
}

impl TryFrom<&Args> for Config {
    type Error = ConfigError;

    fn try_from(args: &Args) -> Result<Self, Self::Error> {
        if args.payloads.is_empty() {
            return Err(ConfigError::EmptyPayloadRotation);
        }

        let interfaces = match (args.all_interfaces, args.interfaces.is_empty()) {
            (true, _) => Interfaces::All,
            (false, false) => {
                if let Some(bad) = args
                    .interfaces
                    .iter()
                    .find(|i| i.is_empty() || i.len() >= libc::IF_NAMESIZE)
                {
                    return Err(ConfigError::Invalid(format!("invalid interface name '{bad}'")));
                }
                Interfaces::Named(args.interfaces.clone())
            }
            (false, true) => {
                return Err(ConfigError::Invalid(
                    "no interface given, use --interface or --all-interfaces".into(),
                ));
            }
        };

        let families = match (args.ipv4_only, args.ipv6_only) {
            (true, _) => Families::V4,
            (_, true) => Families::V6,
            _ => Families::Both,
        };

        if args.threads == 0 {
            return Err(ConfigError::Invalid("at least one worker thread is required".into()));
        }
        let end = args.queue_num as u32 + args.threads as u32 - 1;
        if end > u16::MAX as u32 {
            return Err(ConfigError::BadQueueRange {
                start: args.queue_num as u32,
                end,
            });
        }

        if args.fwmask == 0 || args.fwmark & !args.fwmask != 0 || args.fwmark == 0 {
            return Err(ConfigError::BadMark {
                mark: args.fwmark,
                mask: args.fwmask,
            });
        }

        if args.repeat == 0 {
            return Err(ConfigError::Invalid("--repeat must be at least 1".into()));
        }
        if args.cache_capacity == 0 {
            return Err(ConfigError::Invalid("--cache-capacity must be at least 1".into()));
        }
        if args.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid("--send-timeout-ms must be at least 1".into()));
        }

        Ok(Config {
            payloads: args.payloads.clone(),
            interfaces,
            families,
            queue_num: args.queue_num,
            threads: args.threads,
            queue_len: args.queue_len,
            mark: FwMark {
                mark: args.fwmark,
                mask: args.fwmask,
            },
            ttl: TtlPolicy::new(args.reach_hops, args.ttl_margin, args.dynamic_pct)?,
            repeat: args.repeat as usize,
            cache_capacity: args.cache_capacity,
            send_timeout: Duration::from_millis(args.send_timeout_ms),
            skip_firewall: args.skip_firewall,
            stats_interval: Duration::from_secs(args.stats_interval),
        })
    }
}
