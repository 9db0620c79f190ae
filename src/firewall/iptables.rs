use crate::config::Interfaces;
use crate::dispatcher::FwMark;
use crate::error::FirewallError;
use crate::packet::IpFamily;
use crate::process::run_command;

use super::FirewallRules;

const CHAIN_SRC: &str = "FAKESIP_S";
const CHAIN_DST: &str = "FAKESIP_D";
const CHAIN_RULES: &str = "FAKESIP_R";

const RESERVED_V4: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "224.0.0.0/3",
];

const RESERVED_V6: &[&str] = &[
    "::/127",
    "::ffff:0:0/96",
    "64:ff9b::/96",
    "64:ff9b:1::/48",
    "2002::/16",
    "fc00::/7",
    "fe80::/10",
];

// ==========================================
// mangle 表规则：
//   PREROUTING  -> FAKESIP_S -> FAKESIP_R
//   POSTROUTING -> FAKESIP_D -> FAKESIP_R
//   FAKESIP_R: 跳过已标记的包，UDP 前 5 个包进 NFQUEUE
// ==========================================
#[derive(Debug, Clone)]
pub struct Iptables {
    family: IpFamily,
    mark: FwMark,
    queues: (u16, u16),
    interfaces: Interfaces,
}

impl Iptables {
    pub fn new(family: IpFamily, mark: FwMark, queues: (u16, u16), interfaces: Interfaces) -> Self {
        Self {
            family,
            mark,
            queues,
            interfaces,
        }
    }

    pub fn program(&self) -> &'static str {
        match self.family {
            IpFamily::V4 => "iptables",
            IpFamily::V6 => "ip6tables",
        }
    }

    pub fn interfaces(&self) -> &Interfaces {
        &self.interfaces
    }

    fn cmd(&self, rule: &[&str]) -> Vec<String> {
        [self.program(), "-w", "-t", "mangle"]
            .iter()
            .chain(rule)
            .map(|s| s.to_string())
            .collect()
    }

    pub fn install_commands(&self) -> Vec<Vec<String>> {
        let mut cmds = vec![
            self.cmd(&["-N", CHAIN_SRC]),
            self.cmd(&["-N", CHAIN_DST]),
            self.cmd(&["-I", "PREROUTING", "-j", CHAIN_SRC]),
            self.cmd(&["-I", "POSTROUTING", "-j", CHAIN_DST]),
            self.cmd(&["-N", CHAIN_RULES]),
        ];

        // 丢弃诱饵过期产生的 time-exceeded
        cmds.push(match self.family {
            IpFamily::V4 => self.cmd(&["-A", CHAIN_SRC, "-p", "icmp", "--icmp-type", "11", "-j", "DROP"]),
            IpFamily::V6 => self.cmd(&[
                "-A",
                CHAIN_SRC,
                "-p",
                "icmpv6",
                "--icmpv6-type",
                "time-exceeded",
                "-j",
                "DROP",
            ]),
        });

        let reserved = match self.family {
            IpFamily::V4 => RESERVED_V4,
            IpFamily::V6 => RESERVED_V6,
        };
        for (chain, flag) in [(CHAIN_SRC, "-s"), (CHAIN_DST, "-d")] {
            for &net in reserved {
                cmds.push(self.cmd(&["-A", chain, flag, net, "-j", "RETURN"]));
            }
        }

        let xmark = format!("{}/{}", self.mark.mark, self.mark.mask);
        cmds.push(self.cmd(&["-A", CHAIN_RULES, "-m", "mark", "--mark", xmark.as_str(), "-j", "RETURN"]));

        let (first, last) = self.queues;
        let balance;
        let queue_args: [&str; 2] = if first == last {
            balance = first.to_string();
            ["--queue-num", balance.as_str()]
        } else {
            balance = format!("{first}:{last}");
            ["--queue-balance", balance.as_str()]
        };
        let mut nfqueue = vec![
            "-A",
            CHAIN_RULES,
            "-p",
            "udp",
            "-m",
            "connbytes",
            "--connbytes",
            "1:5",
            "--connbytes-dir",
            "both",
            "--connbytes-mode",
            "packets",
            "-j",
            "NFQUEUE",
            "--queue-bypass",
        ];
        nfqueue.extend_from_slice(&queue_args);
        cmds.push(self.cmd(&nfqueue));

        match &self.interfaces {
            Interfaces::All => {
                cmds.push(self.cmd(&["-A", CHAIN_SRC, "-j", CHAIN_RULES]));
                cmds.push(self.cmd(&["-A", CHAIN_DST, "-j", CHAIN_RULES]));
            }
            Interfaces::Named(names) => {
                for name in names {
                    cmds.push(self.cmd(&["-A", CHAIN_SRC, "-i", name.as_str(), "-j", CHAIN_RULES]));
                    cmds.push(self.cmd(&["-A", CHAIN_DST, "-o", name.as_str(), "-j", CHAIN_RULES]));
                }
            }
        }
        cmds
    }

    pub fn teardown_commands(&self) -> Vec<Vec<String>> {
        vec![
            self.cmd(&["-F", CHAIN_RULES]),
            self.cmd(&["-F", CHAIN_SRC]),
            self.cmd(&["-F", CHAIN_DST]),
            self.cmd(&["-D", "PREROUTING", "-j", CHAIN_SRC]),
            self.cmd(&["-D", "POSTROUTING", "-j", CHAIN_DST]),
            self.cmd(&["-X", CHAIN_RULES]),
            self.cmd(&["-X", CHAIN_SRC]),
            self.cmd(&["-X", CHAIN_DST]),
        ]
    }
}

impl FirewallRules for Iptables {
    fn install(&self) -> Result<(), FirewallError> {
        // 先清掉上次异常退出留下的链
        self.teardown();
        for cmd in self.install_commands() {
            if let Err(e) = run_command(&cmd, false) {
                self.teardown();
                return Err(e);
            }
        }
        Ok(())
    }

    fn teardown(&self) {
        for cmd in self.teardown_commands() {
            let _ = run_command(&cmd, true);
        }
    }
}
