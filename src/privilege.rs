//! Drops every capability not needed for steady-state operation and applies
//! the in-process-expressible hardening toggles.
//!
//! Address-family restriction, `ProtectSystem`/`ProtectHome`, and
//! `MemoryDenyWriteExecute` are unit-manager (systemd) sandboxing
//! directives, not something a process applies to itself; unit-manager
//! integration is out of scope here, so this module documents the required
//! unit directives instead of re-implementing them (see DESIGN.md).

use caps::{CapSet, Capability};
use tracing::{info, warn};

use crate::error::PrivilegeError;

/// The minimum ambient capability set needed in steady state: trace (for
/// `/proc/<pid>/exe` and `/proc/<pid>/stat` of other users' and root's
/// processes), kill (STOP/CONT/TERM signalling), and dac_read_search
/// (bypassing file permission checks when hashing another user's
/// executable).
const RETAINED_CAPABILITIES: &[Capability] = &[
    Capability::CAP_SYS_PTRACE,
    Capability::CAP_KILL,
    Capability::CAP_DAC_READ_SEARCH,
];

/// Required directives for the unit file that launches this daemon,
/// documented here rather than applied in-process.
pub const REQUIRED_UNIT_DIRECTIVES: &[&str] = &[
    "NoNewPrivileges=yes", // also self-applied below, belt and suspenders
    "RestrictAddressFamilies=AF_UNIX AF_NETLINK",
    "ProtectSystem=strict",
    "ProtectHome=yes",
    "MemoryDenyWriteExecute=yes",
    "AmbientCapabilities=CAP_SYS_PTRACE CAP_KILL CAP_DAC_READ_SEARCH",
];

/// Applies no-new-privs and drops every capability outside
/// `RETAINED_CAPABILITIES`, after the kernel channel and arbitration socket
/// are already open. The ambient capabilities retained after setup are the
/// minimum subset needed for steady-state operation.
pub fn harden_after_setup() -> Result<(), PrivilegeError> {
    prctl::set_no_new_privs()
        .map_err(|errno| PrivilegeError::NoNewPrivs(std::io::Error::from_raw_os_error(errno)))?;

    for set in [CapSet::Effective, CapSet::Permitted, CapSet::Inheritable] {
        let mut to_keep = caps::CapsHashSet::new();
        to_keep.extend(RETAINED_CAPABILITIES.iter().copied());
        if let Err(e) = caps::set(None, set, &to_keep) {
            warn!(?set, error = %e, "failed to narrow capability set");
            return Err(PrivilegeError::Caps(e));
        }
    }

    info!("privileges dropped to the minimum steady-state set");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retained_set_is_exactly_the_documented_minimum() {
        assert_eq!(RETAINED_CAPABILITIES.len(), 3);
        assert!(RETAINED_CAPABILITIES.contains(&Capability::CAP_SYS_PTRACE));
        assert!(RETAINED_CAPABILITIES.contains(&Capability::CAP_KILL));
        assert!(RETAINED_CAPABILITIES.contains(&Capability::CAP_DAC_READ_SEARCH));
    }
}
