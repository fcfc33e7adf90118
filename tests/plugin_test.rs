use std::collections::HashMap;
use std::path::Path;

use brcni::config::{CniConf, NetConf, SubnetConf};
use brcni::error::CniError;
use brcni::ipam::IpAllocator;
use brcni::plugin::BridgePlugin;
use brcni::store::AllocationStore;
use brcni::types::CmdArgs;
use tempfile::TempDir;

fn conf(data_dir: &Path) -> CniConf {
    CniConf {
        net: NetConf {
            cni_version: "1.0.0".to_string(),
            name: "podnet".to_string(),
            plugin_type: "brcni".to_string(),
            data_dir: Some(data_dir.to_path_buf()),
            subnet_file: None,
            bridge: None,
            mtu: None,
        },
        subnet: SubnetConf { subnet: "10.244.1.0/24".to_string(), bridge: "cni0".to_string() },
    }
}

fn args(container_id: &str, netns: &str) -> CmdArgs {
    CmdArgs {
        container_id: container_id.to_string(),
        netns: netns.to_string(),
        ifname: "eth0".to_string(),
        args: HashMap::new(),
        stdin_data: Vec::new(),
    }
}

fn allocator(data_dir: &Path) -> IpAllocator {
    let store = AllocationStore::open(data_dir, "podnet").expect("open store");
    IpAllocator::from_cidr("10.244.1.0/24", store).expect("allocator")
}

#[test]
fn test_add_without_netns_allocates_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let plugin = BridgePlugin::new(conf(dir.path()), args("c1", ""));

    assert!(matches!(plugin.add_network(), Err(CniError::Env { .. })));
    assert!(matches!(allocator(dir.path()).check_ip("c1"), Err(CniError::NotFound { .. })));

    Ok(())
}

#[test]
fn test_add_with_missing_netns_allocates_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let netns = dir.path().join("no-such-ns");
    let plugin = BridgePlugin::new(conf(dir.path()), args("c1", &netns.to_string_lossy()));

    assert!(matches!(plugin.add_network(), Err(CniError::NotFound { .. })));
    assert!(matches!(allocator(dir.path()).check_ip("c1"), Err(CniError::NotFound { .. })));

    Ok(())
}

#[test]
fn test_del_releases_address_when_netns_is_gone() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let ip = allocator(dir.path()).allocate_ip("c1", "eth0")?;
    let netns = dir.path().join("gone");

    BridgePlugin::new(conf(dir.path()), args("c1", &netns.to_string_lossy())).del_network()?;

    assert!(matches!(allocator(dir.path()).check_ip("c1"), Err(CniError::NotFound { .. })));
    let next = allocator(dir.path()).allocate_ip("c2", "eth0")?;
    assert_eq!(u32::from(next), u32::from(ip) + 1, "scan resumes after the last allocation");

    Ok(())
}

#[test]
fn test_del_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let plugin = BridgePlugin::new(conf(dir.path()), args("c1", ""));

    plugin.del_network()?;
    plugin.del_network()?;

    Ok(())
}

#[test]
fn test_check_unknown_container_is_not_found() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let plugin = BridgePlugin::new(conf(dir.path()), args("c1", "/var/run/netns/c1"));

    assert!(matches!(plugin.check_network(), Err(CniError::NotFound { .. })));

    Ok(())
}
