//! Human-readable device names.
//!
//! Sensors are identified by address everywhere in the pipeline; an alias
//! only changes how a device is labelled in logs, storage rows and the
//! shutdown summary.

use crate::mac_address::MacAddress;
use std::collections::BTreeMap;

/// Device names keyed by address.
pub type AliasMap = BTreeMap<MacAddress, String>;

/// A parsed alias mapping a MAC address to a human-readable name.
#[derive(Debug, Clone, PartialEq)]
pub struct Alias {
    pub address: MacAddress,
    pub name: String,
}

/// Parse an alias from a string in the format "MAC=NAME".
///
/// # Example
/// ```
/// use tp358_listener::alias::parse_alias;
///
/// let alias = parse_alias("FB:B9:30:BB:5E:55=Kitchen").unwrap();
/// assert_eq!(alias.address.to_string(), "FB:B9:30:BB:5E:55");
/// assert_eq!(alias.name, "Kitchen");
/// ```
pub fn parse_alias(src: &str) -> Result<Alias, String> {
    let (address, name) = src
        .split_once('=')
        .ok_or_else(|| "invalid alias: expected format MAC=NAME".to_string())?;
    let address = address
        .parse()
        .map_err(|e| format!("invalid alias '{src}': {e}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("invalid alias '{src}': name is empty"));
    }
    Ok(Alias {
        address,
        name: name.to_string(),
    })
}

/// Convert a slice of Alias values into an AliasMap. Later entries win.
pub fn to_map(aliases: &[Alias]) -> AliasMap {
    aliases
        .iter()
        .map(|a| (a.address, a.name.clone()))
        .collect()
}

/// Alias of `device`, or its canonical address when it has none.
pub fn display_name(aliases: &AliasMap, device: &MacAddress) -> String {
    aliases
        .get(device)
        .cloned()
        .unwrap_or_else(|| device.to_string())
}
