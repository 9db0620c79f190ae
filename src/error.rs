use std::path::PathBuf;

use thiserror::Error;

/// Input errors: the queued packet is not something we can mirror.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid IPv4 header length {0}")]
    BadHeaderLength(usize),

    #[error("not a UDP packet (protocol {0})")]
    NotUdp(u8),

    #[error("fragmented packet")]
    Fragmented,

    #[error("UDP length {udp_len} inconsistent with IP payload {ip_payload}")]
    BadUdpLength { udp_len: usize, ip_payload: usize },
}

/// Resource errors while emitting a decoy. Never fatal.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("no link-layer destination for ifindex {0}")]
    NoLinkAddress(u32),

    #[error("short write: {sent} of {len} bytes")]
    ShortWrite { sent: usize, len: usize },

    #[error("raw send failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Startup configuration errors. The process must not start intercepting.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("payload rotation is empty")]
    EmptyPayloadRotation,

    #[error("payload #{index} is empty")]
    EmptyPayload { index: usize },

    #[error("payload #{index} is {len} bytes, maximum is {max}")]
    PayloadTooLarge { index: usize, len: usize, max: usize },

    #[error("invalid payload source '{0}', expected sip:<uri>, file:<path> or hex:<bytes>")]
    BadPayloadSource(String),

    #[error("cannot read payload file {path}: {source}")]
    PayloadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fwmark {mark:#x} is not covered by fwmask {mask:#x}")]
    BadMark { mark: u32, mask: u32 },

    #[error("queue range {start}..{end} exceeds 65535")]
    BadQueueRange { start: u32, end: u32 },

    #[error("invalid TTL policy: {0}")]
    BadTtlPolicy(String),

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// Fatal runtime errors for a dispatcher worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("cannot open interception queue {queue}: {source}")]
    Open {
        queue: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("queue {queue}: {failures} consecutive verdict failures, last: {source}")]
    Verdict {
        queue: u16,
        failures: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("queue {queue}: receive failed: {source}")]
    Recv {
        queue: u16,
        #[source]
        source: std::io::Error,
    },
}
