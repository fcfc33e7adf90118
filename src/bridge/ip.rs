//! Thin wrapper around the iproute2 `ip` binary.

use std::net::Ipv4Addr;
use std::process::{Command, Output};

use serde::Deserialize;
use tracing::debug;

use crate::error::{CniError, Result};

/// Messages the kernel returns when the object is already in place.
const EXISTS: &[&str] = &["File exists"];

/// Messages `ip` prints for a device that is not there.
const NO_DEVICE: &[&str] = &["does not exist", "Cannot find device"];

/// A link as reported by `ip -j link show`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Link {
    #[serde(rename = "ifindex")]
    pub index: u32,
    #[serde(rename = "ifname")]
    pub name: String,
    #[serde(default)]
    pub mtu: Option<u32>,
    #[serde(rename = "address", default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub master: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddrLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    mtu: Option<u32>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    #[serde(default)]
    family: String,
    #[serde(default)]
    local: Option<String>,
}

/// Run `ip <args>` and return stdout, or a `KernelOp` error carrying stderr.
pub(crate) fn run(args: &[&str]) -> Result<String> {
    let output = exec(args)?;
    if !output.status.success() {
        return Err(failure(args, &output));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Like [`run`], but an "already exists" answer counts as success.
pub(crate) fn run_idempotent(args: &[&str]) -> Result<()> {
    let output = exec(args)?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if EXISTS.iter().any(|msg| stderr.contains(msg)) {
        debug!("ip {}: already exists", args.join(" "));
        return Ok(());
    }
    Err(failure(args, &output))
}

/// Look a link up by name in the current namespace.
pub fn link_by_name(name: &str) -> Result<Option<Link>> {
    let output = exec(&["-j", "link", "show", "dev", name])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if NO_DEVICE.iter().any(|msg| stderr.contains(msg)) {
            return Ok(None);
        }
        return Err(failure(&["link", "show", "dev", name], &output));
    }
    let links = parse_links(&String::from_utf8_lossy(&output.stdout))?;
    Ok(links.into_iter().next())
}

/// IPv4 addresses configured on `name`.
pub fn ipv4_addrs(name: &str) -> Result<Vec<Ipv4Addr>> {
    let stdout = run(&["-j", "-4", "addr", "show", "dev", name])?;
    Ok(parse_addrs(&stdout)?.into_iter().flat_map(|(_, addrs)| addrs).collect())
}

/// The link carrying `addr`, if any.
pub fn link_by_addr(addr: Ipv4Addr) -> Result<Option<Link>> {
    let stdout = run(&["-j", "-4", "addr", "show"])?;
    Ok(parse_addrs(&stdout)?
        .into_iter()
        .find(|(_, addrs)| addrs.contains(&addr))
        .map(|(link, _)| link))
}

pub(crate) fn parse_links(json: &str) -> Result<Vec<Link>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(json)
        .map_err(|e| CniError::kernel("parse ip link output", e.to_string()))
}

pub(crate) fn parse_addrs(json: &str) -> Result<Vec<(Link, Vec<Ipv4Addr>)>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let links: Vec<AddrLink> = serde_json::from_str(json)
        .map_err(|e| CniError::kernel("parse ip addr output", e.to_string()))?;

    Ok(links
        .into_iter()
        .map(|l| {
            let addrs = l
                .addr_info
                .iter()
                .filter(|a| a.family == "inet")
                .filter_map(|a| a.local.as_deref()?.parse().ok())
                .collect();
            let link = Link {
                index: l.ifindex,
                name: l.ifname,
                mtu: l.mtu,
                mac: l.address,
                master: None,
            };
            (link, addrs)
        })
        .collect())
}

fn exec(args: &[&str]) -> Result<Output> {
    debug!("ip {}", args.join(" "));
    Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| CniError::kernel(format!("ip {}", args.join(" ")), e.to_string()))
}

fn failure(args: &[&str], output: &Output) -> CniError {
    CniError::kernel(
        format!("ip {}", args.join(" ")),
        String::from_utf8_lossy(&output.stderr).trim().to_string(),
    )
}
