//! Switching the process to the build user before touching images.

use std::io;
use tracing::debug;

// SAFETY: getuid and getgid cannot fail and touch no memory.
#[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
fn current_ids() -> (u32, u32) {
    unsafe { (libc::getuid(), libc::getgid()) }
}

fn set_ids(uid: u32, gid: u32, current: (u32, u32)) -> io::Result<()> {
    // The group must change first; after setuid the process may lose the
    // privilege to do so.
    if gid != current.1 {
        // SAFETY: setgid takes a plain integer and reports failure via errno.
        #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
        let ret = unsafe { libc::setgid(gid) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    if uid != current.0 {
        // SAFETY: setuid takes a plain integer and reports failure via errno.
        #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
        let ret = unsafe { libc::setuid(uid) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Run the rest of the process as `uid`/`gid`. Unset ids keep the current one.
pub fn run_as(uid: Option<u32>, gid: Option<u32>) -> Result<(), String> {
    let current = current_ids();
    let uid = uid.unwrap_or(current.0);
    let gid = gid.unwrap_or(current.1);
    if (uid, gid) == current {
        return Ok(());
    }
    debug!("switching to uid {uid}, gid {gid}");
    set_ids(uid, gid, current).map_err(|e| format!("failed to run as {uid}:{gid}: {e}"))
}
