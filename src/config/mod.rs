use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use ipnetwork::Ipv4Network;

use crate::error::{CniError, Result};
use crate::store::{self, DEFAULT_DATA_DIR};
use crate::types::SUPPORTED_VERSIONS;

/// Where the daemon publishes the node's subnet for the plugin.
pub const DEFAULT_SUBNET_FILE: &str = "/run/brcni/subnet.json";
/// Bridge name used when nothing else is configured.
pub const DEFAULT_BRIDGE_NAME: &str = "cni0";
/// MTU for the bridge and veth pairs.
pub const DEFAULT_MTU: u32 = 1500;

/// Node-wide addressing written by the daemon and read by every plugin call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetConf {
    /// Pod subnet of this node (CIDR)
    pub subnet: String,
    /// Bridge carrying the subnet's gateway
    pub bridge: String,
}

impl SubnetConf {
    /// Read the subnet file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read(path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                CniError::config(format!(
                    "subnet file {} is missing, is brcnid running?",
                    path.display()
                ))
            } else {
                CniError::io(path, e)
            }
        })?;

        let conf: SubnetConf = serde_json::from_slice(&raw)
            .map_err(|source| CniError::Json { path: path.to_path_buf(), source })?;
        conf.network()?;
        Ok(conf)
    }

    /// Write the subnet file, creating its directory.
    pub fn store(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| CniError::io(dir, e))?;
        }
        let raw = serde_json::to_vec(self)
            .map_err(|source| CniError::Json { path: path.to_path_buf(), source })?;
        store::write_atomic(path, &raw)
    }

    /// The subnet as a network.
    pub fn network(&self) -> Result<Ipv4Network> {
        self.subnet
            .parse()
            .map_err(|e| CniError::config(format!("invalid subnet {:?}: {}", self.subnet, e)))
    }
}

/// Network configuration passed on stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConf {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Name of the network
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Root of the allocation store
    #[serde(rename = "dataDir", default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Location of the subnet file
    #[serde(rename = "subnetFile", default, skip_serializing_if = "Option::is_none")]
    pub subnet_file: Option<PathBuf>,
    /// Bridge override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    /// Interface MTU
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

impl NetConf {
    /// Parse NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let conf: NetConf = serde_json::from_slice(bytes).map_err(|e| {
            CniError::config(format!("failed to parse network configuration: {}", e))
        })?;

        if conf.name.is_empty() {
            return Err(CniError::config("network name is required"));
        }

        if !SUPPORTED_VERSIONS.contains(&conf.cni_version.as_str()) {
            return Err(CniError::config(format!(
                "unsupported cniVersion {:?} (supported: {})",
                conf.cni_version,
                SUPPORTED_VERSIONS.join(", ")
            )));
        }

        if let Some(mtu) = conf.mtu {
            if !(68..=65535).contains(&mtu) {
                return Err(CniError::config(format!(
                    "invalid MTU {} (must be between 68 and 65535)",
                    mtu
                )));
            }
        }

        if matches!(&conf.bridge, Some(b) if b.is_empty() || b.len() > 15) {
            return Err(CniError::config("bridge name must be 1 to 15 characters"));
        }

        Ok(conf)
    }

    pub fn subnet_file(&self) -> &Path {
        self.subnet_file.as_deref().unwrap_or(Path::new(DEFAULT_SUBNET_FILE))
    }

    pub fn data_dir(&self) -> &Path {
        self.data_dir.as_deref().unwrap_or(Path::new(DEFAULT_DATA_DIR))
    }
}

/// Everything one plugin invocation needs: stdin config plus the node subnet.
#[derive(Debug, Clone)]
pub struct CniConf {
    pub net: NetConf,
    pub subnet: SubnetConf,
}

impl CniConf {
    /// Parse stdin and read the subnet file it points at.
    pub fn load(stdin: &[u8]) -> Result<Self> {
        let net = NetConf::parse(stdin)?;
        let subnet = SubnetConf::load(net.subnet_file())?;
        Ok(Self { net, subnet })
    }

    pub fn bridge(&self) -> &str {
        self.net.bridge.as_deref().unwrap_or(&self.subnet.bridge)
    }

    pub fn mtu(&self) -> u32 {
        self.net.mtu.unwrap_or(DEFAULT_MTU)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_and_plugin_fields() {
        let conf = NetConf::parse(
            br#"{
                "cniVersion": "1.0.0",
                "name": "k8s-pod-network",
                "type": "brcni",
                "dataDir": "/tmp/brcni",
                "mtu": 1450,
                "runtimeConfig": {"portMappings": []},
                "args": {"cni": {"ips": []}}
            }"#,
        )
        .unwrap();

        assert_eq!(conf.name, "k8s-pod-network");
        assert_eq!(conf.data_dir(), Path::new("/tmp/brcni"));
        assert_eq!(conf.subnet_file(), Path::new(DEFAULT_SUBNET_FILE));
        assert_eq!(conf.mtu, Some(1450));
    }

    #[test]
    fn rejects_bad_mtu_and_missing_name() {
        let bad_mtu = br#"{"cniVersion":"1.0.0","name":"n","type":"brcni","mtu":20}"#;
        assert!(matches!(NetConf::parse(bad_mtu), Err(CniError::Config { .. })));

        let no_name = br#"{"cniVersion":"1.0.0","name":"","type":"brcni"}"#;
        assert!(matches!(NetConf::parse(no_name), Err(CniError::Config { .. })));
    }

    #[test]
    fn checks_cni_version() {
        let old = br#"{"cniVersion":"0.4.0","name":"n","type":"brcni"}"#;
        assert_eq!(NetConf::parse(old).unwrap().cni_version, "0.4.0");

        for version in ["0.2.0", "2.0.0", ""] {
            let raw = format!(r#"{{"cniVersion":"{}","name":"n","type":"brcni"}}"#, version);
            assert!(
                matches!(NetConf::parse(raw.as_bytes()), Err(CniError::Config { .. })),
                "{:?} accepted",
                version
            );
        }
    }

    #[test]
    fn subnet_conf_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("subnet.json");
        let conf = SubnetConf { subnet: "10.244.1.0/24".into(), bridge: "cni0".into() };

        conf.store(&path).unwrap();
        assert_eq!(SubnetConf::load(&path).unwrap(), conf);
        assert_eq!(conf.network().unwrap().prefix(), 24);
    }

    #[test]
    fn missing_or_invalid_subnet_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subnet.json");
        assert!(matches!(SubnetConf::load(&path), Err(CniError::Config { .. })));

        fs::write(&path, br#"{"subnet":"10.244.1.0/33","bridge":"cni0"}"#).unwrap();
        assert!(matches!(SubnetConf::load(&path), Err(CniError::Config { .. })));
    }

    #[test]
    fn bridge_override_wins_over_subnet_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subnet.json");
        SubnetConf { subnet: "10.244.1.0/24".into(), bridge: "cni0".into() }
            .store(&path)
            .unwrap();

        let stdin = serde_json::json!({
            "cniVersion": "1.0.0",
            "name": "n",
            "type": "brcni",
            "subnetFile": path,
            "bridge": "br-pods"
        });
        let conf = CniConf::load(&serde_json::to_vec(&stdin).unwrap()).unwrap();

        assert_eq!(conf.bridge(), "br-pods");
        assert_eq!(conf.mtu(), DEFAULT_MTU);
        assert_eq!(conf.subnet.subnet, "10.244.1.0/24");
    }
}
