//! Command-line and file configuration for runtime init, plus the
//! ambient TOML overlay.
//!
//! Ported from `src/copperplate/init.c`'s `base_options` table and
//! `copperplate_init`'s `getopt_long_only` loop. Rust's std has no
//! `getopt`, and this crate's own `main.rs` does its own manual argv
//! handling rather than pulling in a CLI-parsing crate for this one
//! concern, so this is a small hand-rolled `--flag` /
//! `--flag=value` scanner instead of `clap`.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{CopperplateError, Result};

/// Minimum arena size accepted by `--mem-pool-size`.
pub const MIN_MEM_POOL_KIB: u64 = 64;

const DEFAULT_MEM_POOL_KIB: u64 = 128;

/// Parsed runtime configuration, the Rust analogue of the source's
/// scattered `__mem_pool_arg`/`__no_mlock_arg`/... globals collected
/// into one struct rather than file-scope statics.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Size of the shared arena, in KiB; matches `__mem_pool_arg`
    /// (there stored in bytes, already multiplied by 1024 at parse
    /// time).
    pub mem_pool_size_kib: u64,
    /// Matches `__no_mlock_arg`.
    pub no_mlock: bool,
    /// Matches `__registry_mountpt_arg`; `None` uses the source's
    /// `/mnt/xenomai/<pid>` default (computed at init time, since it
    /// needs the live pid).
    pub registry_mountpt: Option<String>,
    /// Matches `__no_registry_arg`.
    pub no_registry: bool,
    /// Matches `__session_label_arg`.
    pub session: String,
    /// Matches `__reset_session_arg`.
    pub reset_session: bool,
    /// Matches `__cpu_affinity`, collected as a `cpu_set_t` in the
    /// source; kept here as a plain list of CPU indices.
    pub cpu_affinity: Vec<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            mem_pool_size_kib: DEFAULT_MEM_POOL_KIB,
            no_mlock: false,
            registry_mountpt: None,
            no_registry: false,
            session: "anon".to_string(),
            reset_session: false,
            cpu_affinity: Vec::new(),
        }
    }
}

/// The `--help` usage text, matching `usage()`.
pub const USAGE: &str = "\
usage: copperplated <options>, where options may be:
--mem-pool-size=<KiB>       size of the shared arena (minimum 64 KiB)
--no-mlock                  do not lock memory at init
--registry-mountpt=<dir>    mount point of the object registry
--no-registry               suppress object registration
--session=<label>           label of the shared session (default anon)
--reset-session             remove any older session of that name
--cpu-affinity=<csv>        comma-separated CPU ids to pin threads to
--help                      print this message and exit";

enum ParsedFlag {
    Help,
    Other,
}

fn split_flag(arg: &str) -> Option<(&str, Option<&str>)> {
    let body = arg.strip_prefix("--")?;
    match body.split_once('=') {
        Some((name, value)) => Some((name, Some(value))),
        None => Some((body, None)),
    }
}

impl RuntimeConfig {
    /// Parses `args` (conventionally `std::env::args().skip(1)`),
    /// matching `copperplate_init`'s option loop. Returns
    /// [`CopperplateError::InvalidArgument`] on an unrecognized flag
    /// or a malformed value, mirroring the source's `usage(); return
    /// -EINVAL`. `--help` is reported by returning `Ok(None)` so the
    /// caller can print [`USAGE`] and exit 0, matching the source's
    /// `exit(0)` without this module reaching into process exit
    /// itself.
    pub fn parse_args<I, S>(args: I) -> Result<Option<Self>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut cfg = RuntimeConfig::default();
        for arg in args {
            let arg = arg.as_ref();
            let (name, value) = split_flag(arg).ok_or_else(|| {
                CopperplateError::InvalidArgument(format!("unrecognized argument: {arg}"))
            })?;
            match Self::apply_flag(&mut cfg, name, value)? {
                ParsedFlag::Help => return Ok(None),
                ParsedFlag::Other => {}
            }
        }
        cfg.validate()?;
        Ok(Some(cfg))
    }

    fn apply_flag(cfg: &mut RuntimeConfig, name: &str, value: Option<&str>) -> Result<ParsedFlag> {
        let need_value = |v: Option<&str>| {
            v.ok_or_else(|| {
                CopperplateError::InvalidArgument(format!("--{name} requires a value"))
            })
        };
        match name {
            "help" => return Ok(ParsedFlag::Help),
            "mem-pool-size" => {
                let v = need_value(value)?;
                cfg.mem_pool_size_kib = v.parse().map_err(|_| {
                    CopperplateError::InvalidArgument(format!("invalid --mem-pool-size: {v}"))
                })?;
            }
            "no-mlock" => cfg.no_mlock = true,
            "registry-mountpt" => cfg.registry_mountpt = Some(need_value(value)?.to_string()),
            "no-registry" => cfg.no_registry = true,
            "session" => cfg.session = need_value(value)?.to_string(),
            "reset-session" => cfg.reset_session = true,
            "cpu-affinity" => {
                let v = need_value(value)?;
                for part in v.split(',') {
                    let cpu: usize = part.trim().parse().map_err(|_| {
                        CopperplateError::InvalidArgument(format!("invalid CPU id: {part}"))
                    })?;
                    cfg.cpu_affinity.push(cpu);
                }
            }
            other => {
                return Err(CopperplateError::InvalidArgument(format!(
                    "unrecognized option: --{other}"
                )))
            }
        }
        Ok(ParsedFlag::Other)
    }

    fn validate(&self) -> Result<()> {
        if self.mem_pool_size_kib < MIN_MEM_POOL_KIB {
            return Err(CopperplateError::InvalidArgument(format!(
                "--mem-pool-size must be at least {MIN_MEM_POOL_KIB} KiB"
            )));
        }
        Ok(())
    }

    /// Overlays fields present in a TOML file on top of `self`. The
    /// original `copperplate_init` only ever takes argv, but a config
    /// file overlay makes the runtime testable without touching
    /// process argv.
    pub fn merge_toml_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let overlay: RuntimeConfigOverlay = toml::from_str(&text)
            .map_err(|e| CopperplateError::Configuration(format!("{}: {e}", path.display())))?;
        overlay.apply(&mut self);
        self.validate()?;
        Ok(self)
    }
}

/// Every field optional, so a config file only needs to mention what
/// it wants to override - the rest keeps whatever argv (or the
/// defaults) already established.
#[derive(Debug, Default, Deserialize)]
struct RuntimeConfigOverlay {
    mem_pool_size_kib: Option<u64>,
    no_mlock: Option<bool>,
    registry_mountpt: Option<String>,
    no_registry: Option<bool>,
    session: Option<String>,
    reset_session: Option<bool>,
    cpu_affinity: Option<Vec<usize>>,
}

impl RuntimeConfigOverlay {
    fn apply(self, cfg: &mut RuntimeConfig) {
        if let Some(v) = self.mem_pool_size_kib {
            cfg.mem_pool_size_kib = v;
        }
        if let Some(v) = self.no_mlock {
            cfg.no_mlock = v;
        }
        if let Some(v) = self.registry_mountpt {
            cfg.registry_mountpt = Some(v);
        }
        if let Some(v) = self.no_registry {
            cfg.no_registry = v;
        }
        if let Some(v) = self.session {
            cfg.session = v;
        }
        if let Some(v) = self.reset_session {
            cfg.reset_session = v;
        }
        if let Some(v) = self.cpu_affinity {
            cfg.cpu_affinity = v;
        }
    }
}
