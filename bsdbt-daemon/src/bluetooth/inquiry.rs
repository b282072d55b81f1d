/*!
 * hccontrol Inquiry Output Parsing
 */

use std::collections::HashSet;

use super::{BdAddr, Device};

/// Extracts discovered devices from `hccontrol inquiry` output.
///
/// A line counts as a device line when one of its whitespace-separated
/// tokens is a complete six-octet address. Everything else (headers,
/// `Class:` values, garbage) is skipped. Repeated sightings keep the first
/// position.
pub fn parse_inquiry(output: &str) -> Vec<Device> {
    let mut seen = HashSet::new();
    let mut devices = Vec::new();

    for line in output.lines() {
        let Some(address) = line.split_whitespace().find_map(address_token) else {
            continue;
        };
        if seen.insert(address) {
            devices.push(Device::discovered(address));
        }
    }

    devices
}

fn address_token(token: &str) -> Option<BdAddr> {
    token.trim_end_matches([',', ';']).parse().ok()
}
