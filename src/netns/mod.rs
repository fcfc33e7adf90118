//! Network namespace handles.
//!
//! `setns(2)` switches only the calling thread, so [`NetNs::run`] must be
//! called from the thread that does the work. The CNI plugin is single
//! threaded, which keeps this simple.

use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::sched::{setns, CloneFlags};
use tracing::{debug, error};

use crate::error::{CniError, Result};

const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// An open network namespace.
#[derive(Debug)]
pub struct NetNs {
    path: PathBuf,
    file: File,
}

impl NetNs {
    /// Open the namespace at `path` (e.g. `/var/run/netns/cni-1234`).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                CniError::not_found(format!("network namespace {}", path.display()))
            } else {
                CniError::io(&path, e)
            }
        })?;
        Ok(Self { path, file })
    }

    /// The namespace the calling thread is in right now.
    pub fn current() -> Result<Self> {
        Self::open(THREAD_NETNS)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A path that names this namespace from any other namespace, for tools
    /// like `ip ... netns <path>` run while this thread is elsewhere.
    pub fn fd_path(&self) -> PathBuf {
        PathBuf::from(format!("/proc/{}/fd/{}", std::process::id(), self.file.as_raw_fd()))
    }

    /// Run `f` inside this namespace and switch back afterwards.
    ///
    /// `f` receives the namespace the thread came from. The original
    /// namespace is restored on every exit path, including errors and panics.
    pub fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&NetNs) -> Result<T>,
    {
        let origin = NetNs::current()?;
        self.set_current()?;
        debug!(netns = %self.path.display(), "entered namespace");

        let guard = RestoreGuard { origin: &origin, armed: true };
        let result = f(&origin);
        let restored = guard.restore();

        match (result, restored) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(restore_err)) => {
                error!("failed to restore network namespace after error: {}", restore_err);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    fn set_current(&self) -> Result<()> {
        setns(self.file.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|errno| {
            CniError::kernel(format!("setns {}", self.path.display()), errno.desc())
        })
    }
}

struct RestoreGuard<'a> {
    origin: &'a NetNs,
    armed: bool,
}

impl RestoreGuard<'_> {
    fn restore(mut self) -> Result<()> {
        self.armed = false;
        self.origin.set_current()
    }
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.origin.set_current() {
                error!("failed to restore network namespace: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_namespace_is_not_found() {
        let err = NetNs::open("/var/run/netns/brcni-does-not-exist").unwrap_err();
        assert!(matches!(err, CniError::NotFound { .. }));
    }

    #[test]
    fn fd_path_points_into_proc() {
        let ns = NetNs::current().unwrap();
        let path = ns.fd_path();
        assert!(path.starts_with(format!("/proc/{}/fd", std::process::id())));
        assert_eq!(
            std::fs::read_link(&path).unwrap(),
            std::fs::read_link(THREAD_NETNS).unwrap()
        );
    }

    fn current_ns_link() -> PathBuf {
        std::fs::read_link(THREAD_NETNS).unwrap()
    }

    // A fresh namespace, created on a throwaway thread so this one stays put
    fn scratch_namespace() -> NetNs {
        std::thread::spawn(|| {
            nix::sched::unshare(CloneFlags::CLONE_NEWNET).unwrap();
            NetNs::current().unwrap()
        })
        .join()
        .unwrap()
    }

    #[test]
    fn failing_closure_still_restores_namespace() {
        if !nix::unistd::geteuid().is_root() {
            println!("Skipping: setns needs CAP_SYS_ADMIN");
            return;
        }
        let before = current_ns_link();
        let target = scratch_namespace();

        let result: Result<()> = target.run(|_| {
            assert_ne!(current_ns_link(), before, "closure runs in the target namespace");
            Err(CniError::not_found("interface eth0"))
        });

        assert!(matches!(result, Err(CniError::NotFound { .. })));
        assert_eq!(current_ns_link(), before);
    }

    #[test]
    fn panicking_closure_still_restores_namespace() {
        if !nix::unistd::geteuid().is_root() {
            println!("Skipping: setns needs CAP_SYS_ADMIN");
            return;
        }
        let before = current_ns_link();
        let target = scratch_namespace();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            target.run(|_| -> Result<()> { panic!("boom") })
        }));

        assert!(outcome.is_err());
        assert_eq!(current_ns_link(), before);
    }

    #[test]
    fn running_in_own_namespace_returns_closure_value() {
        if !nix::unistd::geteuid().is_root() {
            println!("Skipping: setns needs CAP_SYS_ADMIN");
            return;
        }
        let ns = NetNs::current().unwrap();
        let value = ns.run(|origin| Ok(origin.path().to_path_buf())).unwrap();
        assert_eq!(value, PathBuf::from(THREAD_NETNS));
    }
}
