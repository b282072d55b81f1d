/*!
 * Privilege Guard
 * hccontrol and hcsecd.conf both require root
 */

use nix::unistd::{geteuid, Uid};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("The daemon must be run as root (effective uid {euid})")]
pub struct PrivilegeError {
    euid: u32,
}

/// Checks the effective uid of this process.
pub fn verify() -> Result<(), PrivilegeError> {
    check(geteuid())
}

fn check(euid: Uid) -> Result<(), PrivilegeError> {
    if euid.is_root() {
        Ok(())
    } else {
        Err(PrivilegeError {
            euid: euid.as_raw(),
        })
    }
}
