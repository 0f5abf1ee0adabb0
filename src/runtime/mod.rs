//! Runtime init & config: the entry point that binds a
//! process to a session, locks memory, pins CPU affinity, and mounts
//! the optional registry - the Rust analogue of `copperplate_init`.

pub mod config;
pub mod session;

pub use config::RuntimeConfig;
pub use session::Session;

use std::sync::Arc;

use crate::error::{CopperplateError, Result};
use crate::registry::Registry;

/// Everything `copperplate_init` hands back implicitly through its
/// global `__this_node`/`__registry_mountpt_arg` state: the bound
/// session, and the resolved registry mount point (even when the
/// registry itself is disabled, so callers can still log where it
/// *would* have mounted).
pub struct Runtime {
    pub session: Arc<Session>,
    pub registry_mountpt: String,
    pub config: RuntimeConfig,
}

/// Default registry mount point the source computes at init time
/// from the live pid (`sprintf(__registry_mountpt_arg,
/// "/mnt/xenomai/%d", getpid())`).
fn default_mountpt() -> String {
    format!("/mnt/copperplate/{}", std::process::id())
}

/// `copperplate_init(argc, argv)`: parses `args`, binds (creating if
/// needed) the named session's shared arena, locks memory unless
/// `--no-mlock`, pins CPU affinity if requested, and mounts the
/// registry unless `--no-registry`.
///
/// Differences from the source: no `getpid() == gettid()` assertion
/// (this port has no pthread-level main-thread concept to check), and
/// the registry is an in-process [`Registry`] rather than a FUSE mount
/// (the registry is an interface contract, not a filesystem driver).
pub fn init(args: impl IntoIterator<Item = impl AsRef<str>>) -> Result<Option<Runtime>> {
    let cfg = match RuntimeConfig::parse_args(args)? {
        Some(cfg) => cfg,
        None => {
            println!("{}", config::USAGE);
            return Ok(None);
        }
    };
    init_with_config(cfg).map(Some)
}

/// As [`init`], but takes an already-resolved [`RuntimeConfig`]
/// (e.g. one built from a TOML file rather than argv), matching the
/// ambient testability addition.
pub fn init_with_config(cfg: RuntimeConfig) -> Result<Runtime> {
    tracing::info!(session = %cfg.session, mem_pool_kib = cfg.mem_pool_size_kib, "copperplate runtime init");

    let mem_pool_size = (cfg.mem_pool_size_kib as usize) * 1024;
    let session = Session::bind(&cfg.session, mem_pool_size, cfg.reset_session)?;

    if !cfg.no_mlock {
        lock_memory()?;
    } else {
        tracing::debug!("--no-mlock: skipping mlockall");
    }

    if !cfg.cpu_affinity.is_empty() {
        set_cpu_affinity(&cfg.cpu_affinity)?;
    }

    let registry_mountpt = cfg
        .registry_mountpt
        .clone()
        .unwrap_or_else(default_mountpt);

    if cfg.no_registry {
        tracing::debug!("--no-registry: object registration suppressed");
    } else {
        mount_registry(session.registry(), &cfg.session, &registry_mountpt);
    }

    Ok(Runtime {
        session,
        registry_mountpt,
        config: cfg,
    })
}

/// `mlockall(MCL_CURRENT | MCL_FUTURE)`, matching the source's
/// unconditional lock unless `--no-mlock`. Reports the host's errno
/// as [`CopperplateError::Io`] rather than aborting, since a
/// non-privileged caller failing to lock memory is routine in a test
/// environment and the source itself only warns and returns an error
/// code, it doesn't abort the process.
fn lock_memory() -> Result<()> {
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        tracing::warn!(error = %err, "failed to lock memory");
        return Err(CopperplateError::Io(err.to_string()));
    }
    Ok(())
}

/// `sched_setaffinity(0, ..., &__cpu_affinity)`, matching
/// `collect_cpu_affinity`'s final apply step (the per-CPU validation
/// loop collapses here since `libc::CPU_SET` has no out-of-range
/// check of its own; `CPU_SETSIZE` is enforced up front instead).
fn set_cpu_affinity(cpus: &[usize]) -> Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &cpu in cpus {
            if cpu >= libc::CPU_SETSIZE as usize {
                return Err(CopperplateError::InvalidArgument(format!(
                    "invalid CPU number '{cpu}'"
                )));
            }
            if cpu >= num_cpus::get() {
                tracing::warn!(cpu, online = num_cpus::get(), "pinning to a CPU index past the online core count");
            }
            libc::CPU_SET(cpu, &mut set);
        }
        let ret = libc::sched_setaffinity(
            0,
            std::mem::size_of::<libc::cpu_set_t>(),
            &set as *const libc::cpu_set_t,
        );
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            tracing::warn!(error = %err, cpus = ?cpus, "failed to set CPU affinity");
            return Err(CopperplateError::Io(err.to_string()));
        }
    }
    Ok(())
}

/// Registers the top-level session directory the way
/// `registry_pkg_init` does (`registry_add_dir("/")` plus per-object
/// subdirectories added lazily by each subsystem as objects are
/// created).
fn mount_registry(registry: &Registry, session: &str, mountpt: &str) {
    tracing::info!(mountpt, session, "registry mounted");
    let _ = registry.add_dir("/threads");
    let _ = registry.add_dir("/heaps");
    let _ = registry.add_dir("/timers");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn help_flag_prints_usage_and_returns_none() {
        assert!(init(["--help"]).unwrap().is_none());
    }

    #[test]
    fn init_binds_a_session_and_mounts_the_registry() {
        let rt = init([
            "--session=runtime-init-test",
            "--reset-session",
            "--no-mlock",
            "--mem-pool-size=128",
        ])
        .unwrap()
        .unwrap();
        assert_eq!(rt.session.name(), "runtime-init-test");
        assert!(rt.session.registry().list_dir("/threads").is_ok());
    }

    #[test]
    fn no_registry_skips_mounting() {
        let rt = init([
            "--session=runtime-init-no-registry",
            "--reset-session",
            "--no-mlock",
            "--no-registry",
        ])
        .unwrap()
        .unwrap();
        assert!(rt.session.registry().list_dir("/threads").is_err());
    }
}
