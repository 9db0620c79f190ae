use crate::error::ConfigError;

/// Decides the TTL/hop limit of decoys.
///
/// `reach_hops` is the smallest hop count believed to get a packet past the
/// inspection point to the real peer. Decoys go out with `reach_hops - margin`,
/// lowered further when the peer's observed TTL says it is closer than that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    reach_hops: u8,
    margin: u8,
    dynamic_pct: Option<u8>,
}

impl TtlPolicy {
    pub fn new(reach_hops: u8, margin: u8, dynamic_pct: Option<u8>) -> Result<Self, ConfigError> {
        if reach_hops < 2 {
            return Err(ConfigError::BadTtlPolicy(format!(
                "reach hops must be at least 2, got {reach_hops}"
            )));
        }
        if margin == 0 || margin >= reach_hops {
            return Err(ConfigError::BadTtlPolicy(format!(
                "margin must be in 1..{reach_hops}, got {margin}"
            )));
        }
        if let Some(pct) = dynamic_pct {
            if pct == 0 || pct > 100 {
                return Err(ConfigError::BadTtlPolicy(format!(
                    "dynamic percentage must be in 1..=100, got {pct}"
                )));
            }
        }
        Ok(Self {
            reach_hops,
            margin,
            dynamic_pct,
        })
    }

    pub fn reach_hops(&self) -> u8 {
        self.reach_hops
    }

    /// TTL for a decoy. `observed` is the TTL last seen on packets from the
    /// peer, `genuine` the TTL of the packet being shadowed.
    pub fn decoy_ttl(&self, observed: Option<u8>, genuine: u8) -> u8 {
        let mut ttl = self.reach_hops - self.margin;

        if let (Some(pct), Some(hops)) = (self.dynamic_pct, observed.and_then(estimate_hops)) {
            let scaled = (hops as u32 * pct as u32 / 100) as u8;
            ttl = ttl.min(scaled);
        }

        if genuine > 1 {
            ttl = ttl.min(genuine - 1);
        }
        ttl.max(1)
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            reach_hops: 5,
            margin: 2,
            dynamic_pct: None,
        }
    }
}

/// 常见初始 TTL 是 64/128/255，取不小于观测值的最近一个
pub fn estimate_hops(observed: u8) -> Option<u8> {
    let initial: u8 = match observed {
        0 => return None,
        1..=64 => 64,
        65..=128 => 128,
        _ => 255,
    };
    Some(initial - observed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        assert!(TtlPolicy::new(1, 1, None).is_err());
        assert!(TtlPolicy::new(5, 0, None).is_err());
        assert!(TtlPolicy::new(5, 5, None).is_err());
        assert!(TtlPolicy::new(5, 2, Some(0)).is_err());
        assert!(TtlPolicy::new(5, 2, Some(101)).is_err());
        assert!(TtlPolicy::new(2, 1, Some(100)).is_ok());
    }

    #[test]
    fn static_bound() {
        let p = TtlPolicy::new(8, 3, None).unwrap();
        assert_eq!(p.decoy_ttl(None, 64), 5);
        assert_eq!(p.decoy_ttl(Some(50), 64), 5);
    }

    #[test]
    fn below_genuine_ttl() {
        let p = TtlPolicy::new(8, 1, None).unwrap();
        assert_eq!(p.decoy_ttl(None, 4), 3);
        assert_eq!(p.decoy_ttl(None, 1), 1);
        assert_eq!(p.decoy_ttl(None, 0), 1);
    }

    #[test]
    fn dynamic_lowers_for_close_peers() {
        let p = TtlPolicy::new(10, 2, Some(50)).unwrap();
        // 64 - 58 = 6 hops, 50% -> 3
        assert_eq!(p.decoy_ttl(Some(58), 64), 3);
        // 远端很远时仍受静态上限约束
        assert_eq!(p.decoy_ttl(Some(100), 64), 8);
        // 估出 0 跳时也不会低于 1
        assert_eq!(p.decoy_ttl(Some(64), 64), 1);
    }

    #[test]
    fn always_within_bounds() {
        for reach in 2..=40u8 {
            for margin in 1..reach {
                let p = TtlPolicy::new(reach, margin, Some(60)).unwrap();
                for observed in [None, Some(1), Some(30), Some(64), Some(100), Some(200), Some(255)] {
                    for genuine in [0u8, 1, 2, 3, 64, 255] {
                        let ttl = p.decoy_ttl(observed, genuine);
                        assert!(ttl >= 1);
                        assert!(ttl < reach);
                    }
                }
            }
        }
    }

    #[test]
    fn hop_estimation() {
        assert_eq!(estimate_hops(0), None);
        assert_eq!(estimate_hops(57), Some(7));
        assert_eq!(estimate_hops(117), Some(11));
        assert_eq!(estimate_hops(250), Some(5));
    }
}
