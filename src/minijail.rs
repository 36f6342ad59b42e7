//! Sandbox binding for minijail.
//!
//! The sandbox is used for safety, not security: it protects the host from
//! accidental damage done by a misbehaving fuzz target, like deleting files
//! or killing processes. Minijail itself is an external statically linked
//! binary; this module only composes its command line, chroot directory and
//! config file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::util::{envutil, fileutil, runfiles};
use crate::{CifuzzError, CifuzzResult};

/// Additional bindings composed by build adapters before the runner starts.
/// Colon-separated serialized [`Binding`]s.
pub const BINDINGS_ENV_VAR: &str = "CIFUZZ_MINIJAIL_BINDINGS";

/// When set, the sandbox starts an interactive shell instead of the target,
/// with the original command line stored in `CMD`.
pub const DEBUG_SLEEP_FOREVER_ENV_VAR: &str = "CI_DEBUG_MINIJAIL_SLEEP_FOREVER";

// Mount flags as defined by the kernel; minijail accepts them numerically.
const MS_RDONLY: u32 = 0x1;
const MS_NOSUID: u32 = 0x2;
const MS_NODEV: u32 = 0x4;
const MS_STRICTATIME: u32 = 0x0100_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writable {
    ReadOnly,
    ReadWrite,
}

/// A bind-mount into the sandbox. The target defaults to the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub source: PathBuf,
    pub target: PathBuf,
    pub writable: Writable,
}

impl Binding {
    pub fn read_only(source: impl Into<PathBuf>) -> Binding {
        let source = source.into();
        Binding {
            target: source.clone(),
            source,
            writable: Writable::ReadOnly,
        }
    }

    pub fn read_write(source: impl Into<PathBuf>) -> Binding {
        let source = source.into();
        Binding {
            target: source.clone(),
            source,
            writable: Writable::ReadWrite,
        }
    }
}

impl fmt::Display for Binding {
    /// Serializes to `src[,target[,w]]`. The short forms are only used when
    /// neither path contains a comma, which minijail would interpret as a
    /// field separator.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = self.source.display();
        let target = self.target.display();
        if self.writable == Writable::ReadWrite {
            return write!(f, "{source},{target},1");
        }
        let has_comma = self.source.to_string_lossy().contains(',')
            || self.target.to_string_lossy().contains(',');
        if has_comma {
            return write!(f, "{source},{target},0");
        }
        if self.source != self.target {
            return write!(f, "{source},{target}");
        }
        write!(f, "{source}")
    }
}

impl FromStr for Binding {
    type Err = CifuzzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.splitn(3, ',').collect();
        match tokens.as_slice() {
            [source] => Ok(Binding::read_only(*source)),
            [source, target] => Ok(Binding {
                source: PathBuf::from(source),
                target: PathBuf::from(target),
                writable: Writable::ReadOnly,
            }),
            [source, target, writable] => {
                let writable: i32 = writable.parse().map_err(|_| {
                    CifuzzError::Config(format!("bad binding: {s}"))
                })?;
                Ok(Binding {
                    source: PathBuf::from(source),
                    target: PathBuf::from(target),
                    writable: if writable == 0 {
                        Writable::ReadOnly
                    } else {
                        Writable::ReadWrite
                    },
                })
            }
            _ => Err(CifuzzError::Config(format!("bad binding: {s}"))),
        }
    }
}

/// Appends a binding to the `CIFUZZ_MINIJAIL_BINDINGS` list in `env`.
pub fn add_binding_to_env(env: Vec<String>, binding: &Binding) -> CifuzzResult<Vec<String>> {
    let existing = envutil::getenv(&env, BINDINGS_ENV_VAR);
    let value = if existing.is_empty() {
        binding.to_string()
    } else {
        format!("{existing}:{binding}")
    };
    envutil::setenv(env, BINDINGS_ENV_VAR, &value)
}

fn bindings_from_env(env: &[String]) -> CifuzzResult<Vec<Binding>> {
    let mut bindings = Vec::new();
    for entry in envutil::getenv(env, BINDINGS_ENV_VAR).split(':') {
        if entry.is_empty() {
            continue;
        }
        bindings.push(entry.parse()?);
    }
    Ok(bindings)
}

#[derive(Debug, Clone, Default)]
pub struct Options {
    /// The target command line: executable followed by its arguments.
    pub args: Vec<String>,
    /// `KEY=VAL` entries the process wrapper exports inside the sandbox.
    pub env: Vec<String>,
    /// Caller-supplied bindings, e.g. the build directory.
    pub bindings: Vec<Binding>,
}

/// A configured sandbox invocation. The chroot directory is a scoped
/// resource: it is removed when the value is dropped.
pub struct Minijail {
    args: Vec<String>,
    chroot_dir: Option<tempfile::TempDir>,
}

impl Minijail {
    pub fn new(opts: &Options) -> CifuzzResult<Minijail> {
        let target = opts
            .args
            .first()
            .ok_or_else(|| CifuzzError::Internal("sandbox target is missing".to_string()))?;
        let target = fileutil::canonical_path(Path::new(target))?;

        let chroot = tempfile::Builder::new()
            .prefix("minijail-chroot-")
            .tempdir()?;
        for dir in ["proc", "tmp", "run", "var/run", "dev/shm"] {
            std::fs::create_dir_all(chroot.path().join(dir))?;
        }

        let workdir = std::env::current_dir()?;
        let process_wrapper = runfiles::process_wrapper_path()?;

        let mut bindings = Vec::new();
        // Fuzz-test project temp dirs must remain visible below the tmpfs
        // mounted on /tmp inside the sandbox.
        bindings.extend(host_tmp_subdir_bindings());
        bindings.extend(opts.bindings.iter().cloned());
        bindings.extend(bindings_from_env(&opts.env)?);
        // AFL and some fuzz targets need these; they must be mounted
        // read-write or minijail fails to bind-remount them.
        bindings.push(Binding::read_write("/dev/null"));
        bindings.push(Binding::read_write("/dev/urandom"));
        bindings.push(Binding::read_write(&workdir));
        bindings.push(Binding::read_only(&target));
        bindings.push(Binding::read_only(&process_wrapper));

        let debug_shell = std::env::var(DEBUG_SLEEP_FOREVER_ENV_VAR).is_ok();
        if debug_shell {
            bindings.push(Binding::read_only("/bin"));
        }

        // Missing sources are skipped: they may legitimately not exist on
        // every platform.
        bindings.retain(|b| b.source.exists());
        for binding in &mut bindings {
            create_mount_point(chroot.path(), binding)?;
        }

        let config_path = chroot.path().join("minijail.conf");
        std::fs::write(&config_path, render_config(&bindings))?;

        let minijail0 = runfiles::minijail0_path()?;
        let mut args: Vec<String> = vec![minijail0.display().to_string()];
        args.extend(fixed_args());
        args.push("-P".to_string());
        args.push(chroot.path().display().to_string());
        args.push("--config".to_string());
        args.push(config_path.display().to_string());

        // The process wrapper chdirs to its first argument and exports the
        // following KEY=VAL arguments, giving the target a deterministic
        // working directory regardless of host layout.
        args.push("--".to_string());
        args.push(process_wrapper.display().to_string());
        args.push(workdir.display().to_string());
        args.extend(opts.env.iter().cloned());
        if debug_shell {
            args.push(format!("CMD={}", opts.args.join(" ")));
        }

        args.push("--".to_string());
        if debug_shell {
            args.push("/bin/sh".to_string());
        } else {
            args.push(target.display().to_string());
            args.extend(opts.args.iter().skip(1).cloned());
        }

        Ok(Minijail {
            args,
            chroot_dir: Some(chroot),
        })
    }

    /// The complete command line: minijail0 with all flags, the process
    /// wrapper and the target.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Removes the chroot directory. Also happens on drop.
    pub fn cleanup(&mut self) {
        if let Some(chroot) = self.chroot_dir.take() {
            if let Err(err) = chroot.close() {
                tracing::warn!("failed to remove chroot directory: {err}");
            }
        }
    }
}

impl Drop for Minijail {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn fixed_args() -> Vec<String> {
    [
        // Map the current uid/gid to root inside a new user namespace;
        // minijail does setresuid(0, 0, 0) before chrooting, so uid 0 must
        // own the chroot directory.
        "-U", "-m", "-M",
        // Drop all capabilities and set no_new_privs.
        "-c", "0", "-n",
        // New mount, PID and IPC namespaces; run the target as init.
        "-v", "-p", "-l", "-I",
        "--logging=stderr",
        // A static minijail0 without preload hooking keeps the sandbox free
        // of runtime dependencies.
        "-T", "static", "--ambient",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn render_config(bindings: &[Binding]) -> String {
    let mut out = String::from("% minijail-config-file v0\n");
    // The root of the chroot is a read-only bind of /.
    out.push_str("bind-mount = /\n");
    out.push_str(&format!("mount = proc,/proc,proc,{MS_RDONLY}\n"));
    out.push_str("mount = tmpfs,/tmp,tmpfs\n");
    out.push_str("mount = tmpfs,/run,tmpfs\n");
    out.push_str("mount = tmpfs,/var/run,tmpfs\n");
    out.push_str(&format!(
        "mount = tmpfs,/dev/shm,tmpfs,{},mode=1777\n",
        MS_NOSUID | MS_NODEV | MS_STRICTATIME
    ));
    for binding in bindings {
        out.push_str(&format!("bind-mount = {binding}\n"));
    }
    out
}

fn host_tmp_subdir_bindings() -> Vec<Binding> {
    let Ok(entries) = std::fs::read_dir(std::env::temp_dir()) else {
        return Vec::new();
    };
    let mut bindings = Vec::new();
    for entry in entries.flatten() {
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            bindings.push(Binding::read_write(entry.path()));
        }
    }
    bindings.sort_by(|a, b| a.source.cmp(&b.source));
    bindings
}

/// Creates the mount point for a binding inside the chroot: a directory for
/// directory sources, an empty file otherwise.
fn create_mount_point(chroot: &Path, binding: &mut Binding) -> CifuzzResult<()> {
    if binding.target.as_os_str().is_empty() {
        binding.target = binding.source.clone();
    }
    let target = binding.target.strip_prefix("/").unwrap_or(&binding.target);
    let destination = chroot.join(target);
    if binding.source.is_dir() {
        std::fs::create_dir_all(&destination)?;
    } else {
        fileutil::touch(&destination)?;
    }
    Ok(())
}
