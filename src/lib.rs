pub mod config;
pub mod dispatcher;
pub mod error;
pub mod firewall;
pub mod logging;
pub mod nfq_message;
pub mod packet;
pub mod packet_context;
pub mod payload;
pub mod process;
pub mod rawsend;
pub mod srcinfo;
pub mod stats;
pub mod worker;
