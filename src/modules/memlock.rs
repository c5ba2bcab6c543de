//! Pins process memory so cached secrets never reach swap.

use log::warn;
use nix::errno::Errno;
use nix::sys::mman::{mlockall, MlockAllFlags};

use super::error::{Error, Result};

/// Outcome of a memory lock attempt that did not abort startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Locked,
    Unsupported,
    InsufficientMemory,
}

/// Locks all current and future pages.
///
/// Missing platform support and resource exhaustion are logged and
/// tolerated. Any other failure is returned and must stop the process.
pub fn lock_memory() -> Result<LockOutcome> {
    classify(mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE))
}

fn classify(result: nix::Result<()>) -> Result<LockOutcome> {
    match result {
        Ok(()) => Ok(LockOutcome::Locked),
        Err(Errno::ENOSYS) => {
            warn!("mlockall() not implemented on this system");
            Ok(LockOutcome::Unsupported)
        }
        Err(Errno::ENOMEM) => {
            warn!("mlockall() failed with ENOMEM");
            Ok(LockOutcome::InsufficientMemory)
        }
        Err(errno) => Err(Error::MemoryLock(errno)),
    }
}
