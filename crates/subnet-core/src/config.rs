//! Network configuration
//!
//! The pool definition every node allocates from. It lives in the
//! registry as JSON, so field names follow the layout existing stores
//! already hold.

use crate::{Error, Result};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Backend used when the config names none
pub const DEFAULT_BACKEND_TYPE: &str = "udp";

fn default_enable_ipv4() -> bool {
    true
}

/// Subnet pool definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "EnableIPv4", default = "default_enable_ipv4")]
    pub enable_ipv4: bool,

    #[serde(rename = "EnableIPv6", default)]
    pub enable_ipv6: bool,

    #[serde(rename = "Network", default)]
    pub network: Option<Ipv4Net>,

    /// Additional pool networks (multi-network clusters)
    #[serde(rename = "Networks", default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<Ipv4Net>,

    #[serde(rename = "IPv6Network", default)]
    pub ipv6_network: Option<Ipv6Net>,

    #[serde(rename = "IPv6Networks", default, skip_serializing_if = "Vec::is_empty")]
    pub ipv6_networks: Vec<Ipv6Net>,

    #[serde(rename = "SubnetMin", default)]
    pub subnet_min: Option<Ipv4Addr>,

    #[serde(rename = "SubnetMax", default)]
    pub subnet_max: Option<Ipv4Addr>,

    #[serde(rename = "IPv6SubnetMin", default)]
    pub ipv6_subnet_min: Option<Ipv6Addr>,

    #[serde(rename = "IPv6SubnetMax", default)]
    pub ipv6_subnet_max: Option<Ipv6Addr>,

    /// Prefix length of each leased IPv4 subnet; 0 means "derive from Network"
    #[serde(rename = "SubnetLen", default)]
    pub subnet_len: u8,

    /// Prefix length of each leased IPv6 subnet; 0 means "derive from IPv6Network"
    #[serde(rename = "IPv6SubnetLen", default)]
    pub ipv6_subnet_len: u8,

    /// Opaque backend section, interpreted by the backend itself
    #[serde(rename = "Backend", default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<serde_json::Value>,

    /// `Backend.Type`, resolved by [`Config::parse`]
    #[serde(skip)]
    pub backend_type: String,
}

/// Inclusive allocation bounds for one address family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetRange<A> {
    pub min: A,
    pub max: A,
    pub len: u8,
}

impl Config {
    /// Parse the JSON stored in the registry
    ///
    /// Resolves the backend type but does not validate the pool; call
    /// [`Config::check`] for that.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut config: Config = serde_json::from_str(raw)
            .map_err(|e| Error::config(format!("failed to parse network config: {e}")))?;

        config.backend_type = match &config.backend {
            None => DEFAULT_BACKEND_TYPE.to_string(),
            Some(backend) => match backend.get("Type") {
                None => DEFAULT_BACKEND_TYPE.to_string(),
                Some(serde_json::Value::String(t)) => t.clone(),
                Some(other) => {
                    return Err(Error::config(format!(
                        "Backend.Type must be a string, got {other}"
                    )));
                }
            },
        };

        Ok(config)
    }

    /// Validate the pool definition and fill in derived defaults
    pub fn check(&mut self) -> Result<()> {
        if !self.enable_ipv4 && !self.enable_ipv6 {
            return Err(Error::config(
                "at least one of EnableIPv4 and EnableIPv6 must be set",
            ));
        }
        if self.enable_ipv4 {
            self.check_ipv4()?;
        }
        if self.enable_ipv6 {
            self.check_ipv6()?;
        }
        Ok(())
    }

    fn check_ipv4(&mut self) -> Result<()> {
        let network = self
            .network
            .ok_or_else(|| Error::config("please define a correct Network parameter in the network config"))?
            .trunc();
        self.network = Some(network);
        let prefix = network.prefix_len();

        if self.subnet_len > 0 {
            if self.subnet_len > 30 {
                return Err(Error::config("SubnetLen must be less than /31"));
            }
            if self.subnet_len < prefix + 2 {
                return Err(Error::config("Network must be able to accommodate at least four subnets"));
            }
        } else if prefix > 28 {
            return Err(Error::config("Network is too small. Minimum useful network prefix is /28"));
        } else if prefix <= 22 {
            self.subnet_len = 24;
        } else {
            self.subnet_len = prefix + 2;
        }

        let size = 1u32 << (32 - u32::from(self.subnet_len));
        let mask = !(size - 1);
        let first = u32::from(network.network());
        let last = u32::from(network.broadcast());

        let min = match self.subnet_min {
            None => first + size,
            Some(min) if !network.contains(&min) => {
                return Err(Error::config("SubnetMin is not in the range of the Network"));
            }
            Some(min) => u32::from(min),
        };
        let max = match self.subnet_max {
            None => last - size + 1,
            Some(max) if !network.contains(&max) => {
                return Err(Error::config("SubnetMax is not in the range of the Network"));
            }
            Some(max) => u32::from(max),
        };

        if min & mask != min {
            return Err(Error::config(format!(
                "SubnetMin is not on a SubnetLen boundary: {}",
                Ipv4Addr::from(min)
            )));
        }
        if max & mask != max {
            return Err(Error::config(format!(
                "SubnetMax is not on a SubnetLen boundary: {}",
                Ipv4Addr::from(max)
            )));
        }

        self.subnet_min = Some(Ipv4Addr::from(min));
        self.subnet_max = Some(Ipv4Addr::from(max));
        Ok(())
    }

    fn check_ipv6(&mut self) -> Result<()> {
        let network = self
            .ipv6_network
            .ok_or_else(|| Error::config("please define a correct IPv6Network parameter in the network config"))?
            .trunc();
        self.ipv6_network = Some(network);
        let prefix = network.prefix_len();

        if self.ipv6_subnet_len > 0 {
            if self.ipv6_subnet_len > 126 {
                return Err(Error::config("IPv6SubnetLen must be less than /127"));
            }
            if self.ipv6_subnet_len < prefix + 2 {
                return Err(Error::config("IPv6Network must be able to accommodate at least four subnets"));
            }
        } else if prefix > 124 {
            return Err(Error::config("IPv6Network is too small. Minimum useful network prefix is /124"));
        } else if prefix <= 62 {
            self.ipv6_subnet_len = 64;
        } else {
            self.ipv6_subnet_len = prefix + 2;
        }

        let size = 1u128 << (128 - u32::from(self.ipv6_subnet_len));
        let mask = !(size - 1);
        let first = u128::from(network.network());
        let last = u128::from(network.broadcast());

        let min = match self.ipv6_subnet_min {
            None => first + size,
            Some(min) if !network.contains(&min) => {
                return Err(Error::config("IPv6SubnetMin is not in the range of the IPv6Network"));
            }
            Some(min) => u128::from(min),
        };
        let max = match self.ipv6_subnet_max {
            None => last - size + 1,
            Some(max) if !network.contains(&max) => {
                return Err(Error::config("IPv6SubnetMax is not in the range of the IPv6Network"));
            }
            Some(max) => u128::from(max),
        };

        if min & mask != min {
            return Err(Error::config(format!(
                "IPv6SubnetMin is not on a IPv6SubnetLen boundary: {}",
                Ipv6Addr::from(min)
            )));
        }
        if max & mask != max {
            return Err(Error::config(format!(
                "IPv6SubnetMax is not on a IPv6SubnetLen boundary: {}",
                Ipv6Addr::from(max)
            )));
        }

        self.ipv6_subnet_min = Some(Ipv6Addr::from(min));
        self.ipv6_subnet_max = Some(Ipv6Addr::from(max));
        Ok(())
    }

    /// IPv4 allocation bounds; `None` until the config has been checked
    pub fn ipv4_range(&self) -> Option<SubnetRange<Ipv4Addr>> {
        if !self.enable_ipv4 || self.subnet_len == 0 {
            return None;
        }
        Some(SubnetRange {
            min: self.subnet_min?,
            max: self.subnet_max?,
            len: self.subnet_len,
        })
    }

    /// IPv6 allocation bounds; `None` until checked or when IPv6 is off
    pub fn ipv6_range(&self) -> Option<SubnetRange<Ipv6Addr>> {
        if !self.enable_ipv6 || self.ipv6_subnet_len == 0 {
            return None;
        }
        Some(SubnetRange {
            min: self.ipv6_subnet_min?,
            max: self.ipv6_subnet_max?,
            len: self.ipv6_subnet_len,
        })
    }

    /// All configured IPv4 pool networks
    pub fn ipv4_networks(&self) -> Vec<Ipv4Net> {
        if self.networks.is_empty() {
            self.network.into_iter().collect()
        } else {
            self.networks.clone()
        }
    }

    /// All configured IPv6 pool networks
    pub fn ipv6_networks(&self) -> Vec<Ipv6Net> {
        if self.ipv6_networks.is_empty() {
            self.ipv6_network.into_iter().collect()
        } else {
            self.ipv6_networks.clone()
        }
    }

    /// The pool network containing `subnet`
    pub fn network_for(&self, subnet: Ipv4Net) -> Result<Ipv4Net> {
        self.ipv4_networks()
            .into_iter()
            .find(|net| net.contains(&subnet))
            .ok_or_else(|| Error::config(format!("subnet {subnet} is not part of any configured network")))
    }

    /// The IPv6 pool network containing `subnet`
    pub fn ipv6_network_for(&self, subnet: Ipv6Net) -> Result<Ipv6Net> {
        self.ipv6_networks()
            .into_iter()
            .find(|net| net.contains(&subnet))
            .ok_or_else(|| Error::config(format!("subnet {subnet} is not part of any configured IPv6 network")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checked(raw: &str) -> Result<Config> {
        let mut config = Config::parse(raw)?;
        config.check()?;
        Ok(config)
    }

    #[test]
    fn defaults_for_slash_16() {
        let config = checked(r#"{ "Network": "10.3.0.0/16" }"#).unwrap();

        assert!(config.enable_ipv4);
        assert!(!config.enable_ipv6);
        assert_eq!(config.subnet_len, 24);
        assert_eq!(config.subnet_min, Some(Ipv4Addr::new(10, 3, 1, 0)));
        assert_eq!(config.subnet_max, Some(Ipv4Addr::new(10, 3, 255, 0)));
        assert_eq!(config.backend_type, "udp");
    }

    #[test]
    fn small_network_gets_prefix_plus_two() {
        let config = checked(r#"{ "Network": "10.3.0.0/24" }"#).unwrap();

        assert_eq!(config.subnet_len, 26);
        assert_eq!(config.subnet_min, Some(Ipv4Addr::new(10, 3, 0, 64)));
        assert_eq!(config.subnet_max, Some(Ipv4Addr::new(10, 3, 0, 192)));
    }

    #[test]
    fn explicit_bounds_are_kept() {
        let config = checked(
            r#"{ "Network": "10.3.0.0/16", "SubnetMin": "10.3.1.0", "SubnetMax": "10.3.25.0", "Backend": { "Type": "vxlan", "VNI": 1 } }"#,
        )
        .unwrap();

        let range = config.ipv4_range().unwrap();
        assert_eq!(range.min, Ipv4Addr::new(10, 3, 1, 0));
        assert_eq!(range.max, Ipv4Addr::new(10, 3, 25, 0));
        assert_eq!(range.len, 24);
        assert_eq!(config.backend_type, "vxlan");
    }

    #[test]
    fn rejects_misaligned_or_foreign_bounds() {
        assert!(checked(r#"{ "Network": "10.3.0.0/16", "SubnetMin": "10.3.1.7" }"#).is_err());
        assert!(checked(r#"{ "Network": "10.3.0.0/16", "SubnetMax": "10.4.0.0" }"#).is_err());
    }

    #[test]
    fn rejects_bad_subnet_len() {
        assert!(checked(r#"{ "Network": "10.3.0.0/16", "SubnetLen": 31 }"#).is_err());
        assert!(checked(r#"{ "Network": "10.3.0.0/16", "SubnetLen": 17 }"#).is_err());
        assert!(checked(r#"{ "Network": "10.3.0.0/29" }"#).is_err());
    }

    #[test]
    fn missing_network_is_a_config_error() {
        let err = checked(r#"{ "SubnetLen": 24 }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn ipv6_defaults() {
        let config = checked(
            r#"{ "Network": "10.3.0.0/16", "EnableIPv6": true, "IPv6Network": "fc00::/48" }"#,
        )
        .unwrap();

        let range = config.ipv6_range().unwrap();
        assert_eq!(range.len, 64);
        assert_eq!(range.min, "fc00:0:0:1::".parse::<Ipv6Addr>().unwrap());
        assert_eq!(range.max, "fc00:0:0:ffff::".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn ipv6_only_config_is_valid() {
        let config = checked(r#"{ "EnableIPv4": false, "EnableIPv6": true, "IPv6Network": "fd00::/56" }"#).unwrap();

        assert!(config.ipv4_range().is_none());
        assert_eq!(config.ipv6_range().unwrap().len, 64);
    }

    #[test]
    fn network_for_is_multi_network_aware() {
        let config = checked(
            r#"{ "Network": "10.3.0.0/16", "Networks": ["10.3.0.0/16", "10.5.0.0/16"] }"#,
        )
        .unwrap();

        let sn: Ipv4Net = "10.5.7.0/24".parse().unwrap();
        assert_eq!(config.network_for(sn).unwrap(), "10.5.0.0/16".parse().unwrap());
        assert!(config.network_for("10.9.0.0/24".parse().unwrap()).is_err());
    }
}
