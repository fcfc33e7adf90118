use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::io::{self, Read};

use crate::config::CniConf;
use crate::error::CniError;
use crate::plugin::BridgePlugin;
use crate::types::{CmdArgs, ErrorResult, VersionResult, CNI_VERSION};

/// Error code for failures that carry no [`CniError`].
const GENERIC_ERROR_CODE: u32 = 999;

/// Parse command arguments from environment
pub fn parse_args() -> Result<CmdArgs> {
    let container_id = required_env("CNI_CONTAINERID")?;
    let ifname = required_env("CNI_IFNAME")?;

    // DEL may arrive after the namespace is gone, with CNI_NETNS empty
    let netns = env::var("CNI_NETNS").unwrap_or_default();

    let args_str = env::var("CNI_ARGS").unwrap_or_default();
    let args = parse_cni_args(&args_str);

    let mut stdin_data = Vec::new();
    io::stdin().read_to_end(&mut stdin_data).context("Failed to read from stdin")?;

    Ok(CmdArgs { container_id, netns, ifname, args, stdin_data })
}

fn required_env(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(CniError::Env { name: name.to_string() }.into()),
    }
}

/// Parse CNI_ARGS string into key-value pairs
fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    args_str
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn plugin(args: CmdArgs) -> Result<BridgePlugin> {
    let conf = CniConf::load(&args.stdin_data)?;
    Ok(BridgePlugin::new(conf, args))
}

/// Execute the add command
pub fn cmd_add(args: CmdArgs) -> Result<()> {
    let result = plugin(args)?.add_network()?;
    result.print()
}

/// Execute the delete command
pub fn cmd_del(args: CmdArgs) -> Result<()> {
    plugin(args)?.del_network()?;
    Ok(())
}

/// Execute the check command
pub fn cmd_check(args: CmdArgs) -> Result<()> {
    plugin(args)?.check_network()?;
    Ok(())
}

/// Main entry point for the CNI plugin
pub fn run_cni() -> Result<()> {
    let cmd = required_env("CNI_COMMAND")?;

    match cmd.as_str() {
        "ADD" => cmd_add(parse_args()?),
        "DEL" => cmd_del(parse_args()?),
        "CHECK" => cmd_check(parse_args()?),
        "VERSION" => VersionResult::current().print(),
        _ => Err(CniError::Env { name: format!("CNI_COMMAND (unknown command {:?})", cmd) }.into()),
    }
}

/// Turn a failure into the payload the runtime expects on stdout.
pub fn error_result(err: &anyhow::Error) -> ErrorResult {
    let code = err.downcast_ref::<CniError>().map_or(GENERIC_ERROR_CODE, CniError::code);
    let details = err.chain().skip(1).map(ToString::to_string).collect::<Vec<_>>().join(": ");

    ErrorResult { cni_version: CNI_VERSION.to_string(), code, msg: err.to_string(), details }
}
