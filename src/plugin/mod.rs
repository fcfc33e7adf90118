use tracing::info;

use crate::bridge;
use crate::config::CniConf;
use crate::error::{CniError, Result};
use crate::ipam::IpAllocator;
use crate::netns::NetNs;
use crate::store::AllocationStore;
use crate::types::{
    CmdArgs, IPConfig, Interface, Result as CniResult, Route as CniRoute, CNI_VERSION,
};

/// Bridge plugin implementation
pub struct BridgePlugin {
    /// Network configuration
    config: CniConf,
    /// Command arguments
    args: CmdArgs,
}

impl BridgePlugin {
    /// Create a new bridge plugin
    pub fn new(config: CniConf, args: CmdArgs) -> Self {
        Self { config, args }
    }

    /// Attach the container to the node bridge.
    ///
    /// The address stays allocated if plumbing fails; the runtime follows a
    /// failed ADD with DEL, which releases it.
    pub fn add_network(&self) -> Result<CniResult> {
        let netns = self.open_netns()?;
        let mut ipam = self.allocator()?;
        let gateway = ipam.gateway();
        let mtu = self.config.mtu();

        let ip = ipam.allocate_ip(&self.args.container_id, &self.args.ifname)?;
        info!(
            pod = self.args.pod_name().as_deref().unwrap_or("-"),
            "container {} gets {}",
            self.args.container_id,
            ip
        );

        let br = bridge::create_bridge(self.config.bridge(), mtu, ipam.ip_net(gateway))?;
        let veth =
            bridge::setup_veth(&netns, &br, mtu, &self.args.ifname, ipam.ip_net(ip), gateway)?;

        // The body always has the 1.0 layout, so it carries that version
        let mut result = CniResult::new(CNI_VERSION);
        result.add_interface(Interface { name: veth.host.name, mac: veth.host.mac, sandbox: None });
        let container = result.add_interface(Interface {
            name: self.args.ifname.clone(),
            mac: veth.container.mac,
            sandbox: Some(self.args.netns.clone()),
        });
        result.add_ip(IPConfig {
            interface: Some(container),
            address: ipam.ip_net(ip).to_string(),
            gateway: Some(gateway.to_string()),
        });
        result.add_route(CniRoute { dst: "0.0.0.0/0".to_string(), gw: Some(gateway.to_string()) });

        Ok(result)
    }

    /// Release the address and remove the container interface.
    ///
    /// A namespace that is already gone is not an error.
    pub fn del_network(&self) -> Result<()> {
        self.allocator()?.release_ip(&self.args.container_id)?;

        if self.args.netns.is_empty() {
            return Ok(());
        }
        match NetNs::open(&self.args.netns) {
            Ok(netns) => bridge::del_veth(&netns, &self.args.ifname),
            Err(CniError::NotFound { .. }) => {
                info!("namespace {} already removed", self.args.netns);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Verify the container still has its address on its interface.
    pub fn check_network(&self) -> Result<()> {
        let ip = self.allocator()?.check_ip(&self.args.container_id)?;
        let netns = self.open_netns()?;
        bridge::check_veth(&netns, &self.args.ifname, ip)
    }

    fn allocator(&self) -> Result<IpAllocator> {
        let store = AllocationStore::open(self.config.net.data_dir(), &self.config.net.name)?;
        IpAllocator::new(self.config.subnet.network()?, store)
    }

    fn open_netns(&self) -> Result<NetNs> {
        if self.args.netns.is_empty() {
            return Err(CniError::Env { name: "CNI_NETNS".to_string() });
        }
        NetNs::open(&self.args.netns)
    }
}
