use crate::error::AppError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Identity of one forwarding session: (target instance, remote port).
///
/// Across process boundaries it travels as `"{target}:{remote_port}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelKey {
    target: String,
    remote_port: u16,
}

impl TunnelKey {
    pub fn new(target: impl Into<String>, remote_port: u16) -> Self {
        Self {
            target: target.into(),
            remote_port,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.target, self.remote_port)
    }
}

impl FromStr for TunnelKey {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (target, port) = s
            .split_once(':')
            .ok_or_else(|| AppError::InvalidTunnelKey(format!("'{}' is not target:port", s)))?;

        if target.is_empty() {
            return Err(AppError::InvalidTunnelKey(format!("'{}' has an empty target", s)));
        }

        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AppError::InvalidTunnelKey(format!("'{}' has a non-numeric port", s)));
        }

        let remote_port = port
            .parse::<u16>()
            .map_err(|_| AppError::InvalidTunnelKey(format!("'{}' has an out-of-range port", s)))?;

        Ok(Self::new(target, remote_port))
    }
}

impl Serialize for TunnelKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TunnelKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_wire_form() {
        assert_eq!(TunnelKey::new("vm-a", 3389).to_string(), "vm-a:3389");
    }

    #[test]
    fn test_parse() {
        let key: TunnelKey = "vm-a:22".parse().unwrap();
        assert_eq!(key.target(), "vm-a");
        assert_eq!(key.remote_port(), 22);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["vm-a", "vm-a:", ":22", "vm-a:22:1", "vm-a:ssh", "vm-a:+22", "vm-a:70000", "vm-a: 22"] {
            assert!(bad.parse::<TunnelKey>().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_serde_uses_string_form() {
        let key = TunnelKey::new("vm-b", 22);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"vm-b:22\"");
        let back: TunnelKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
