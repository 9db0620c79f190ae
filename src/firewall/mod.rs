use log::info;

use crate::config::{Config, Interfaces};
use crate::error::FirewallError;
use crate::packet::IpFamily;

mod iptables;

pub use iptables::Iptables;

/// Steers traffic into the interception queues.
pub trait FirewallRules {
    fn install(&self) -> Result<(), FirewallError>;

    /// Best effort; failures are logged, never returned.
    fn teardown(&self);
}

/// Rules for every enabled address family.
pub struct Firewall {
    tables: Vec<Iptables>,
}

impl Firewall {
    pub fn new(tables: Vec<Iptables>) -> Self {
        Self { tables }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let mut tables = Vec::new();
        for (enabled, family) in [
            (cfg.families.ipv4(), IpFamily::V4),
            (cfg.families.ipv6(), IpFamily::V6),
        ] {
            if enabled {
                tables.push(Iptables::new(
                    family,
                    cfg.mark,
                    cfg.queue_range(),
                    cfg.interfaces.clone(),
                ));
            }
        }
        Self::new(tables)
    }

    pub fn tables(&self) -> &[Iptables] {
        &self.tables
    }
}

impl FirewallRules for Firewall {
    fn install(&self) -> Result<(), FirewallError> {
        for (i, table) in self.tables.iter().enumerate() {
            if let Err(e) = table.install() {
                // 回滚已经装好的
                for done in &self.tables[..=i] {
                    done.teardown();
                }
                return Err(e);
            }
        }
        let hooks = match self.tables.first().map(Iptables::interfaces) {
            Some(Interfaces::Named(names)) => names.join(","),
            _ => "all interfaces".to_string(),
        };
        info!("firewall rules installed on {hooks}");
        Ok(())
    }

    fn teardown(&self) {
        for table in self.tables.iter().rev() {
            table.teardown();
        }
        info!("firewall rules removed");
    }
}
