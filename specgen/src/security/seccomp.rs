//! Seccomp profile loading and compilation.
//!
//! Profiles use the JSON format shared by Docker and Podman:
//!
//! ```json
//! {
//!   "defaultAction": "SCMP_ACT_ERRNO",
//!   "archMap": [{ "architecture": "SCMP_ARCH_X86_64", "subArchitectures": ["SCMP_ARCH_X86"] }],
//!   "syscalls": [
//!     { "names": ["read"], "action": "SCMP_ACT_ALLOW" },
//!     { "names": ["mount"], "action": "SCMP_ACT_ALLOW", "includes": { "caps": ["CAP_SYS_ADMIN"] } }
//!   ]
//! }
//! ```
//!
//! A profile is compiled against the container being built: rules gated on
//! capabilities the container does not hold, or on other architectures, are
//! dropped before the profile lands in the OCI spec.
//!
//! ## Default profile
//!
//! **ALLOWED** for every container: memory management, file I/O, process
//! control, signals, timers, sockets, polling, IPC.
//!
//! **CAPABILITY-GATED**: mount/namespace syscalls need CAP_SYS_ADMIN, ptrace
//! needs CAP_SYS_PTRACE, module loading needs CAP_SYS_MODULE, and so on.
//!
//! Everything else fails with EPERM.

use oci_spec::runtime::{
    Arch, LinuxSeccomp, LinuxSeccompAction, LinuxSeccompArg, LinuxSeccompBuilder,
    LinuxSyscallBuilder,
};
use serde::Deserialize;
use specgen_shared::{SecurityError, SpecgenError, SpecgenResult};
use std::collections::BTreeSet;
use std::path::Path;

/// Syscalls every container may use.
pub const ALLOWED_SYSCALLS: &[&str] = &[
    // Memory management
    "brk",
    "mmap",
    "mmap2",
    "munmap",
    "mprotect",
    "madvise",
    "mremap",
    "mlock",
    "mlock2",
    "mlockall",
    "munlock",
    "munlockall",
    "mincore",
    "msync",
    "membarrier",
    "memfd_create",
    // File operations
    "read",
    "write",
    "pread64",
    "pwrite64",
    "readv",
    "writev",
    "preadv",
    "pwritev",
    "preadv2",
    "pwritev2",
    "open",
    "openat",
    "openat2",
    "close",
    "close_range",
    "creat",
    "stat",
    "stat64",
    "lstat",
    "lstat64",
    "fstat",
    "fstat64",
    "fstatat64",
    "newfstatat",
    "statx",
    "statfs",
    "statfs64",
    "fstatfs",
    "fstatfs64",
    "lseek",
    "_llseek",
    "fcntl",
    "fcntl64",
    "dup",
    "dup2",
    "dup3",
    "pipe",
    "pipe2",
    "access",
    "faccessat",
    "faccessat2",
    "getcwd",
    "chdir",
    "fchdir",
    "mkdir",
    "mkdirat",
    "rmdir",
    "rename",
    "renameat",
    "renameat2",
    "link",
    "linkat",
    "unlink",
    "unlinkat",
    "symlink",
    "symlinkat",
    "readlink",
    "readlinkat",
    "chmod",
    "fchmod",
    "fchmodat",
    "chown",
    "fchown",
    "fchownat",
    "lchown",
    "truncate",
    "ftruncate",
    "fallocate",
    "fsync",
    "fdatasync",
    "sync",
    "syncfs",
    "sync_file_range",
    "getdents",
    "getdents64",
    "umask",
    "utime",
    "utimes",
    "utimensat",
    "futimesat",
    "mknod",
    "mknodat",
    "flock",
    "sendfile",
    "sendfile64",
    "splice",
    "tee",
    "vmsplice",
    "copy_file_range",
    "ioctl",
    "getxattr",
    "lgetxattr",
    "fgetxattr",
    "setxattr",
    "lsetxattr",
    "fsetxattr",
    "listxattr",
    "llistxattr",
    "flistxattr",
    "removexattr",
    "lremovexattr",
    "fremovexattr",
    "inotify_init",
    "inotify_init1",
    "inotify_add_watch",
    "inotify_rm_watch",
    "fadvise64",
    "readahead",
    // Process management
    "execve",
    "execveat",
    "exit",
    "exit_group",
    "clone",
    "clone3",
    "fork",
    "vfork",
    "wait4",
    "waitid",
    "getpid",
    "getppid",
    "gettid",
    "getpgid",
    "setpgid",
    "getpgrp",
    "getsid",
    "setsid",
    "getuid",
    "geteuid",
    "getgid",
    "getegid",
    "setuid",
    "setgid",
    "setreuid",
    "setregid",
    "setresuid",
    "setresgid",
    "getresuid",
    "getresgid",
    "setfsuid",
    "setfsgid",
    "getgroups",
    "setgroups",
    "capget",
    "capset",
    "prctl",
    "arch_prctl",
    "set_tid_address",
    "set_robust_list",
    "get_robust_list",
    "rseq",
    "getrlimit",
    "setrlimit",
    "prlimit64",
    "getrusage",
    "getpriority",
    "setpriority",
    "sched_yield",
    "sched_getaffinity",
    "sched_setaffinity",
    "sched_getparam",
    "sched_setparam",
    "sched_getscheduler",
    "sched_setscheduler",
    "sched_get_priority_max",
    "sched_get_priority_min",
    "sched_rr_get_interval",
    "sched_getattr",
    "sched_setattr",
    "personality",
    "uname",
    "sysinfo",
    "times",
    "getrandom",
    "pidfd_open",
    "pidfd_send_signal",
    "pidfd_getfd",
    "ioprio_get",
    "ioprio_set",
    // Signals
    "kill",
    "tkill",
    "tgkill",
    "rt_sigaction",
    "rt_sigprocmask",
    "rt_sigreturn",
    "rt_sigpending",
    "rt_sigsuspend",
    "rt_sigtimedwait",
    "rt_sigqueueinfo",
    "rt_tgsigqueueinfo",
    "sigaltstack",
    "signalfd",
    "signalfd4",
    "pause",
    "restart_syscall",
    // Time
    "clock_gettime",
    "clock_getres",
    "clock_nanosleep",
    "gettimeofday",
    "nanosleep",
    "time",
    "alarm",
    "getitimer",
    "setitimer",
    "timer_create",
    "timer_delete",
    "timer_gettime",
    "timer_settime",
    "timer_getoverrun",
    "timerfd_create",
    "timerfd_gettime",
    "timerfd_settime",
    // Synchronization and polling
    "futex",
    "futex_waitv",
    "poll",
    "ppoll",
    "select",
    "pselect6",
    "epoll_create",
    "epoll_create1",
    "epoll_ctl",
    "epoll_wait",
    "epoll_pwait",
    "epoll_pwait2",
    "eventfd",
    "eventfd2",
    "io_setup",
    "io_destroy",
    "io_submit",
    "io_cancel",
    "io_getevents",
    "io_uring_setup",
    "io_uring_enter",
    "io_uring_register",
    // Networking
    "socket",
    "socketpair",
    "bind",
    "listen",
    "accept",
    "accept4",
    "connect",
    "shutdown",
    "getsockname",
    "getpeername",
    "getsockopt",
    "setsockopt",
    "sendto",
    "recvfrom",
    "sendmsg",
    "recvmsg",
    "sendmmsg",
    "recvmmsg",
    // IPC
    "shmget",
    "shmat",
    "shmdt",
    "shmctl",
    "semget",
    "semop",
    "semtimedop",
    "semctl",
    "msgget",
    "msgsnd",
    "msgrcv",
    "msgctl",
    "mq_open",
    "mq_unlink",
    "mq_timedsend",
    "mq_timedreceive",
    "mq_notify",
    "mq_getsetattr",
];

/// Syscalls granted only with a capability, grouped by that capability.
pub const CAPABILITY_GATED_SYSCALLS: &[(&str, &[&str])] = &[
    (
        "CAP_SYS_ADMIN",
        &[
            "mount",
            "umount",
            "umount2",
            "unshare",
            "setns",
            "pivot_root",
            "sethostname",
            "setdomainname",
            "quotactl",
            "fanotify_init",
            "name_to_handle_at",
            "open_by_handle_at",
            "lookup_dcookie",
            "perf_event_open",
            "fsopen",
            "fsconfig",
            "fsmount",
            "fspick",
            "move_mount",
            "open_tree",
            "mount_setattr",
            "bpf",
        ],
    ),
    ("CAP_SYS_BOOT", &["reboot", "kexec_load", "kexec_file_load"]),
    ("CAP_SYS_CHROOT", &["chroot"]),
    (
        "CAP_SYS_MODULE",
        &["init_module", "finit_module", "delete_module"],
    ),
    ("CAP_SYS_PACCT", &["acct"]),
    (
        "CAP_SYS_PTRACE",
        &[
            "ptrace",
            "process_vm_readv",
            "process_vm_writev",
            "kcmp",
            "process_madvise",
        ],
    ),
    ("CAP_SYS_RAWIO", &["iopl", "ioperm"]),
    (
        "CAP_SYS_TIME",
        &["settimeofday", "stime", "clock_settime", "clock_adjtime", "adjtimex"],
    ),
    ("CAP_SYS_TTY_CONFIG", &["vhangup"]),
    (
        "CAP_SYS_NICE",
        &["get_mempolicy", "mbind", "set_mempolicy", "move_pages"],
    ),
    ("CAP_SYSLOG", &["syslog"]),
];

/// EPERM, returned for syscalls the profile does not allow.
const EPERM: u32 = 1;

// ============================================================================
// Profile format
// ============================================================================

/// A seccomp profile in Docker/Podman JSON format.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeccompProfile {
    pub default_action: LinuxSeccompAction,
    #[serde(default)]
    pub default_errno_ret: Option<u32>,
    #[serde(default)]
    pub architectures: Vec<Arch>,
    #[serde(default)]
    pub arch_map: Vec<ArchMap>,
    #[serde(default)]
    pub syscalls: Vec<SyscallRule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchMap {
    pub architecture: Arch,
    #[serde(default)]
    pub sub_architectures: Vec<Arch>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyscallRule {
    #[serde(default)]
    pub names: Vec<String>,
    /// Older profiles name a single syscall.
    #[serde(default)]
    pub name: Option<String>,
    pub action: LinuxSeccompAction,
    #[serde(default)]
    pub args: Vec<LinuxSeccompArg>,
    #[serde(default)]
    pub errno_ret: Option<u32>,
    #[serde(default)]
    pub includes: RuleFilter,
    #[serde(default)]
    pub excludes: RuleFilter,
}

/// Conditions under which a rule applies (`includes`) or is skipped (`excludes`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleFilter {
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default)]
    pub arches: Vec<String>,
}

impl SeccompProfile {
    /// Parse a profile from JSON text.
    pub fn from_json(source_name: &str, json: &str) -> SpecgenResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| SecurityError::seccomp_profile(source_name, e.to_string()).into())
    }

    /// Load a profile from disk.
    pub fn load(path: &Path) -> SpecgenResult<Self> {
        let name = path.display().to_string();
        let json = std::fs::read_to_string(path)
            .map_err(|e| SpecgenError::from(SecurityError::seccomp_profile(&name, e.to_string())))?;
        Self::from_json(&name, &json)
    }

    /// The built-in default profile.
    pub fn default_profile() -> Self {
        let mut syscalls = vec![SyscallRule {
            names: ALLOWED_SYSCALLS.iter().map(|s| s.to_string()).collect(),
            name: None,
            action: LinuxSeccompAction::ScmpActAllow,
            args: Vec::new(),
            errno_ret: None,
            includes: RuleFilter::default(),
            excludes: RuleFilter::default(),
        }];
        for (cap, names) in CAPABILITY_GATED_SYSCALLS {
            syscalls.push(SyscallRule {
                names: names.iter().map(|s| s.to_string()).collect(),
                name: None,
                action: LinuxSeccompAction::ScmpActAllow,
                args: Vec::new(),
                errno_ret: None,
                includes: RuleFilter {
                    caps: vec![cap.to_string()],
                    arches: Vec::new(),
                },
                excludes: RuleFilter::default(),
            });
        }

        Self {
            default_action: LinuxSeccompAction::ScmpActErrno,
            default_errno_ret: Some(EPERM),
            architectures: Vec::new(),
            arch_map: default_arch_map(),
            syscalls,
        }
    }

    /// Compile into an OCI seccomp section for a container holding `capabilities`.
    pub fn compile(&self, capabilities: &BTreeSet<String>) -> SpecgenResult<LinuxSeccomp> {
        let arch = go_arch();

        let mut architectures = self.architectures.clone();
        for entry in &self.arch_map {
            if native_scmp_arch().is_some_and(|a| a == entry.architecture) {
                architectures.push(entry.architecture);
                architectures.extend(entry.sub_architectures.iter().copied());
            }
        }

        let mut syscalls = Vec::new();
        for rule in &self.syscalls {
            if !rule.applies(capabilities, arch) {
                continue;
            }
            let mut names = rule.names.clone();
            if let Some(name) = &rule.name {
                names.push(name.clone());
            }
            if names.is_empty() {
                continue;
            }

            let mut builder = LinuxSyscallBuilder::default()
                .names(names)
                .action(rule.action);
            if !rule.args.is_empty() {
                builder = builder.args(rule.args.clone());
            }
            if let Some(errno) = rule.errno_ret {
                builder = builder.errno_ret(errno);
            }
            syscalls.push(builder.build().map_err(|e| {
                SpecgenError::Internal(format!("Failed to build seccomp syscall rule: {}", e))
            })?);
        }

        let mut builder = LinuxSeccompBuilder::default()
            .default_action(self.default_action)
            .architectures(architectures)
            .syscalls(syscalls);
        if let Some(errno) = self.default_errno_ret {
            builder = builder.default_errno_ret(errno);
        }
        builder
            .build()
            .map_err(|e| SpecgenError::Internal(format!("Failed to build seccomp spec: {}", e)))
    }
}

impl SyscallRule {
    fn applies(&self, capabilities: &BTreeSet<String>, arch: &str) -> bool {
        let includes_caps = self.includes.caps.iter().all(|c| capabilities.contains(c));
        let includes_arch =
            self.includes.arches.is_empty() || self.includes.arches.iter().any(|a| a == arch);
        let excluded_cap = self.excludes.caps.iter().any(|c| capabilities.contains(c));
        let excluded_arch = self.excludes.arches.iter().any(|a| a == arch);
        includes_caps && includes_arch && !excluded_cap && !excluded_arch
    }
}

fn default_arch_map() -> Vec<ArchMap> {
    vec![
        ArchMap {
            architecture: Arch::ScmpArchX86_64,
            sub_architectures: vec![Arch::ScmpArchX86, Arch::ScmpArchX32],
        },
        ArchMap {
            architecture: Arch::ScmpArchAarch64,
            sub_architectures: vec![Arch::ScmpArchArm],
        },
        ArchMap {
            architecture: Arch::ScmpArchS390x,
            sub_architectures: vec![Arch::ScmpArchS390],
        },
        ArchMap {
            architecture: Arch::ScmpArchRiscv64,
            sub_architectures: Vec::new(),
        },
    ]
}

/// Architecture name as used in profile `includes.arches`.
fn go_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

fn native_scmp_arch() -> Option<Arch> {
    match std::env::consts::ARCH {
        "x86_64" => Some(Arch::ScmpArchX86_64),
        "x86" => Some(Arch::ScmpArchX86),
        "aarch64" => Some(Arch::ScmpArchAarch64),
        "arm" => Some(Arch::ScmpArchArm),
        "s390x" => Some(Arch::ScmpArchS390x),
        "riscv64" => Some(Arch::ScmpArchRiscv64),
        _ => None,
    }
}

/// Whether `syscall` is allowed for every container by the default profile.
pub fn is_allowed(syscall: &str) -> bool {
    ALLOWED_SYSCALLS.contains(&syscall)
}

/// Capability that unlocks `syscall` in the default profile, if any.
pub fn gating_capability(syscall: &str) -> Option<&'static str> {
    CAPABILITY_GATED_SYSCALLS
        .iter()
        .find(|(_, names)| names.contains(&syscall))
        .map(|(cap, _)| *cap)
}
