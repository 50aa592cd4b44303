// # Subnet File
//
// The small `KEY=VALUE` file backends and CNI plugins read to learn the
// node's network parameters.
//
// ## File Format
//
// ```text
// FLANNEL_NETWORK=10.3.0.0/16
// FLANNEL_SUBNET=10.3.6.1/24
// FLANNEL_IPV6_NETWORK=fc00::/48
// FLANNEL_IPV6_SUBNET=fc00:0:0:6::1/64
// FLANNEL_MTU=1450
// FLANNEL_IPMASQ=true
// ```
//
// ## Crash Behavior
//
// - Atomic writes: content goes to a hidden sibling file that is then
//   renamed over the target, so readers never observe a partial file
// - The file is also read back at startup to recover the subnet the
//   node held before it restarted

use std::fmt::Write as _;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use ipnet::{Ipv4Net, Ipv6Net};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::Config;
use crate::{Error, Result};

fn io_context<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> Error + 'a {
    move |e| Error::Io(io::Error::new(e.kind(), format!("{action} {}: {e}", path.display())))
}

fn join<T: ToString>(nets: &[T]) -> String {
    nets.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

/// First usable address of `sn`, keeping its prefix length
fn first_usable_ipv4(sn: Ipv4Net) -> Result<Ipv4Net> {
    let addr = Ipv4Addr::from(u32::from(sn.addr()).wrapping_add(1));
    Ipv4Net::new(addr, sn.prefix_len()).map_err(|e| Error::invalid_input(e.to_string()))
}

fn first_usable_ipv6(sn: Ipv6Net) -> Result<Ipv6Net> {
    let addr = Ipv6Addr::from(u128::from(sn.addr()).wrapping_add(1));
    Ipv6Net::new(addr, sn.prefix_len()).map_err(|e| Error::invalid_input(e.to_string()))
}

/// Render the subnet file contents
pub fn render_subnet_file(
    config: &Config,
    ip_masq: bool,
    sn: Option<Ipv4Net>,
    sn6: Option<Ipv6Net>,
    mtu: u32,
) -> Result<String> {
    let mut out = String::new();

    if config.enable_ipv4 {
        let sn = sn.ok_or_else(|| Error::invalid_input("IPv4 is enabled but the lease has no IPv4 subnet"))?;
        let _ = writeln!(out, "FLANNEL_NETWORK={}", join(&config.ipv4_networks()));
        let _ = writeln!(out, "FLANNEL_SUBNET={}", first_usable_ipv4(sn)?);
    }

    if config.enable_ipv6 {
        let sn6 = sn6.ok_or_else(|| Error::invalid_input("IPv6 is enabled but the lease has no IPv6 subnet"))?;
        let _ = writeln!(out, "FLANNEL_IPV6_NETWORK={}", join(&config.ipv6_networks()));
        let _ = writeln!(out, "FLANNEL_IPV6_SUBNET={}", first_usable_ipv6(sn6)?);
    }

    let _ = writeln!(out, "FLANNEL_MTU={mtu}");
    let _ = writeln!(out, "FLANNEL_IPMASQ={ip_masq}");
    Ok(out)
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}"))
}

/// Write the subnet file atomically
pub async fn write_subnet_file(
    path: &Path,
    config: &Config,
    ip_masq: bool,
    sn: Option<Ipv4Net>,
    sn6: Option<Ipv6Net>,
    mtu: u32,
) -> Result<()> {
    let contents = render_subnet_file(config, ip_masq, sn, sn6, mtu)?;

    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir)
            .await
            .map_err(io_context("failed to create directory", dir))?;
    }

    let temp = temp_path(path);
    {
        let mut file = fs::File::create(&temp)
            .await
            .map_err(io_context("failed to create", &temp))?;
        file.write_all(contents.as_bytes())
            .await
            .map_err(io_context("failed to write", &temp))?;
        file.flush()
            .await
            .map_err(io_context("failed to flush", &temp))?;
    }

    fs::rename(&temp, path)
        .await
        .map_err(io_context("failed to rename into", path))?;

    debug!(path = %path.display(), "subnet file written");
    Ok(())
}

/// Subnets recorded in an existing subnet file, truncated to their network
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreviousSubnets {
    pub subnet: Option<Ipv4Net>,
    pub ipv6_subnet: Option<Ipv6Net>,
}

/// Read back the subnets a node held before it restarted
///
/// A missing file means there is no previous subnet. Malformed values
/// are logged and ignored.
pub async fn read_subnet_file(path: &Path) -> Result<PreviousSubnets> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(PreviousSubnets::default()),
        Err(e) => return Err(io_context("failed to read", path)(e)),
    };

    let mut previous = PreviousSubnets::default();
    for line in contents.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        match key {
            "FLANNEL_SUBNET" => match value.parse::<Ipv4Net>() {
                Ok(sn) => previous.subnet = Some(sn.trunc()),
                Err(e) => warn!(path = %path.display(), value, "ignoring malformed FLANNEL_SUBNET: {}", e),
            },
            "FLANNEL_IPV6_SUBNET" => match value.parse::<Ipv6Net>() {
                Ok(sn6) => previous.ipv6_subnet = Some(sn6.trunc()),
                Err(e) => warn!(path = %path.display(), value, "ignoring malformed FLANNEL_IPV6_SUBNET: {}", e),
            },
            _ => {}
        }
    }

    Ok(previous)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(raw: &str) -> Config {
        let mut config = Config::parse(raw).unwrap();
        config.check().unwrap();
        config
    }

    #[test]
    fn renders_first_usable_address() {
        let config = config(r#"{ "Network": "10.3.0.0/16" }"#);
        let out = render_subnet_file(&config, true, Some("10.3.6.0/24".parse().unwrap()), None, 1450).unwrap();

        assert_eq!(
            out,
            "FLANNEL_NETWORK=10.3.0.0/16\nFLANNEL_SUBNET=10.3.6.1/24\nFLANNEL_MTU=1450\nFLANNEL_IPMASQ=true\n"
        );
    }

    #[test]
    fn renders_dual_stack() {
        let config = config(r#"{ "Network": "10.3.0.0/16", "EnableIPv6": true, "IPv6Network": "fc00::/48" }"#);
        let out = render_subnet_file(
            &config,
            false,
            Some("10.3.6.0/24".parse().unwrap()),
            Some("fc00:0:0:6::/64".parse().unwrap()),
            1400,
        )
        .unwrap();

        assert!(out.contains("FLANNEL_IPV6_NETWORK=fc00::/48\n"));
        assert!(out.contains("FLANNEL_IPV6_SUBNET=fc00:0:0:6::1/64\n"));
        assert!(out.contains("FLANNEL_IPMASQ=false\n"));
    }

    #[test]
    fn missing_ipv4_subnet_is_rejected() {
        let config = config(r#"{ "Network": "10.3.0.0/16" }"#);
        assert!(render_subnet_file(&config, false, None, None, 1450).is_err());
    }

    #[tokio::test]
    async fn write_then_read_recovers_previous_subnet() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run/flannel/subnet.env");
        let config = config(r#"{ "Network": "10.3.0.0/16" }"#);

        write_subnet_file(&path, &config, false, Some("10.3.6.0/24".parse().unwrap()), None, 1450)
            .await
            .expect("write succeeds");

        assert!(!temp_path(&path).exists());
        let previous = read_subnet_file(&path).await.unwrap();
        assert_eq!(previous.subnet, Some("10.3.6.0/24".parse().unwrap()));
        assert_eq!(previous.ipv6_subnet, None);
    }

    #[tokio::test]
    async fn missing_file_has_no_previous_subnet() {
        let dir = TempDir::new().unwrap();
        let previous = read_subnet_file(&dir.path().join("absent.env")).await.unwrap();
        assert_eq!(previous, PreviousSubnets::default());
    }
}
