// Kernel tests. They need root and run with `cargo test -- --ignored`.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

use brcni::bridge;
use brcni::config::{CniConf, NetConf, SubnetConf};
use brcni::error::CniError;
use brcni::plugin::BridgePlugin;
use brcni::types::CmdArgs;
use tempfile::TempDir;

const TEST_BRIDGE: &str = "brcnitest0";
const TEST_SUBNET: &str = "10.250.7.0/24";

fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

fn ip(args: &[&str]) -> Result<(), Box<dyn std::error::Error>> {
    let output = Command::new("ip").args(args).output()?;
    if !output.status.success() {
        return Err(format!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )
        .into());
    }
    Ok(())
}

// Function to create a test netns
fn create_test_netns(name: &str) -> Result<String, Box<dyn std::error::Error>> {
    let _ = ip(&["netns", "delete", name]);
    ip(&["netns", "add", name])?;
    Ok(format!("/var/run/netns/{}", name))
}

fn delete_bridge(name: &str) {
    let _ = ip(&["link", "delete", name]);
}

fn conf(data_dir: &Path) -> CniConf {
    CniConf {
        net: NetConf {
            cni_version: "0.4.0".to_string(),
            name: "podnet-test".to_string(),
            plugin_type: "brcni".to_string(),
            data_dir: Some(data_dir.to_path_buf()),
            subnet_file: None,
            bridge: None,
            mtu: Some(1400),
        },
        subnet: SubnetConf { subnet: TEST_SUBNET.to_string(), bridge: TEST_BRIDGE.to_string() },
    }
}

fn args(netns: &str) -> CmdArgs {
    CmdArgs {
        container_id: "integration-container".to_string(),
        netns: netns.to_string(),
        ifname: "eth0".to_string(),
        args: HashMap::new(),
        stdin_data: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // This test requires root privileges to run
    #[test]
    #[ignore]
    fn test_create_bridge_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
        if !is_root() {
            println!("Skipping test_create_bridge_is_idempotent: not running as root");
            return Ok(());
        }
        delete_bridge(TEST_BRIDGE);

        let gateway: ipnetwork::Ipv4Network = "10.250.7.1/24".parse()?;
        let first = bridge::create_bridge(TEST_BRIDGE, 1400, gateway)?;
        let second = bridge::create_bridge(TEST_BRIDGE, 1400, gateway)?;

        assert_eq!(first.index, second.index);
        assert_eq!(first.mtu, Some(1400));
        let addrs = bridge::ipv4_addrs(TEST_BRIDGE)?;
        assert_eq!(addrs, vec![gateway.ip()]);

        delete_bridge(TEST_BRIDGE);
        Ok(())
    }

    // This test requires root privileges to run
    #[test]
    #[ignore]
    fn test_add_check_del_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        if !is_root() {
            println!("Skipping test_add_check_del_round_trip: not running as root");
            return Ok(());
        }
        delete_bridge(TEST_BRIDGE);
        let dir = TempDir::new()?;
        let netns_name = "brcni_test_netns";
        let netns_path = create_test_netns(netns_name)?;

        let plugin = BridgePlugin::new(conf(dir.path()), args(&netns_path));
        let result = plugin.add_network()?;
        println!("CNI result: {:?}", result);

        assert_eq!(result.cni_version, "1.0.0");
        let ips = result.ips.clone().unwrap_or_default();
        assert_eq!(ips.len(), 1);
        assert_eq!(ips[0].address, "10.250.7.2/24");
        assert_eq!(ips[0].gateway.as_deref(), Some("10.250.7.1"));
        assert_eq!(ips[0].interface, Some(1));

        let interfaces = result.interfaces.clone().unwrap_or_default();
        let host = bridge::link_by_name(&interfaces[0].name)?.ok_or("host veth missing")?;
        let br = bridge::link_by_name(TEST_BRIDGE)?.ok_or("bridge missing")?;
        assert_eq!(host.master.as_deref(), Some(TEST_BRIDGE));
        assert_eq!(host.mtu, Some(1400));
        assert_eq!(br.mtu, Some(1400));

        plugin.check_network()?;
        plugin.del_network()?;
        assert!(bridge::link_by_name(&interfaces[0].name)?.is_none());
        assert!(matches!(plugin.check_network(), Err(CniError::NotFound { .. })));
        plugin.del_network()?;

        ip(&["netns", "delete", netns_name])?;
        delete_bridge(TEST_BRIDGE);
        Ok(())
    }
}
