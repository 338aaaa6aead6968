//! Shared constants
//!
//! Annotation keys and default path lists are part of the contract with
//! runtimes and tooling that read the generated spec, so they must not drift.

/// Annotation keys written into the generated spec.
pub mod annotations {
    /// Container is removed once it exits.
    pub const AUTOREMOVE: &str = "io.podman.annotations.autoremove";

    /// Container runs privileged.
    pub const PRIVILEGED: &str = "io.podman.annotations.privileged";

    /// Container runs an init process as PID 1.
    pub const INIT: &str = "io.podman.annotations.init";

    /// Comma-separated list of containers whose volumes were copied.
    pub const VOLUMES_FROM: &str = "io.podman.annotations.volumes-from";

    /// All exposed ports are published.
    pub const PUBLISH_ALL: &str = "io.podman.annotations.publish-all";

    /// Image label naming the seccomp profile to use with policy `image`.
    pub const SECCOMP_PROFILE_LABEL: &str = "io.containers.seccomp.profile";

    pub const TRUE: &str = "TRUE";
    pub const FALSE: &str = "FALSE";
}

/// Kernel paths hidden from unprivileged containers.
pub mod paths {
    /// Masked with an empty bind (files) or a read-only tmpfs (directories).
    pub const MASKED: &[&str] = &[
        "/proc/acpi",
        "/proc/kcore",
        "/proc/keys",
        "/proc/latency_stats",
        "/proc/timer_list",
        "/proc/timer_stats",
        "/proc/sched_debug",
        "/proc/scsi",
        "/sys/firmware",
        "/sys/fs/selinux",
        "/sys/dev/block",
    ];

    /// Remounted read-only.
    pub const READONLY: &[&str] = &[
        "/proc/asound",
        "/proc/bus",
        "/proc/fs",
        "/proc/irq",
        "/proc/sys",
        "/proc/sysrq-trigger",
    ];

    /// Where the init binary is bind mounted inside the container.
    pub const INIT_MOUNT: &str = "/run/podman-init";

    /// Default host location of the init binary.
    pub const DEFAULT_INIT_BINARY: &str = "/usr/libexec/podman/catatonit";

    /// Binaries that mark a command as systemd.
    pub const SYSTEMD_INITS: &[&str] = &["/sbin/init", "/usr/sbin/init", "/usr/local/sbin/init"];
}

/// Capability defaults.
pub mod capabilities {
    /// Bounding set granted to a root container when nothing else is configured.
    pub const DEFAULT: &[&str] = &[
        "CAP_CHOWN",
        "CAP_DAC_OVERRIDE",
        "CAP_FOWNER",
        "CAP_FSETID",
        "CAP_KILL",
        "CAP_NET_BIND_SERVICE",
        "CAP_SETFCAP",
        "CAP_SETGID",
        "CAP_SETPCAP",
        "CAP_SETUID",
        "CAP_SYS_CHROOT",
    ];

    /// Keyword selecting every capability in add/drop lists.
    pub const ALL: &str = "ALL";
}

/// Resource and allocation limits.
pub mod limits {
    /// Smallest memory limit or reservation accepted (6 MiB).
    pub const MIN_MEMORY: i64 = 6 * 1024 * 1024;

    /// CFS period used when `cpus` is given.
    pub const DEFAULT_CPU_PERIOD: u64 = 100_000;

    /// Value used for RLIMIT_NOFILE / RLIMIT_NPROC when unset.
    pub const DEFAULT_RLIMIT_MAX: u64 = 1_048_576;

    /// Random host port attempts per mapping.
    pub const PORT_ALLOCATION_TRIES: usize = 15;

    /// Default /dev/shm size (64 MiB).
    pub const DEFAULT_SHM_SIZE: i64 = 64 * 1024 * 1024;

    /// Default stop timeout in seconds.
    pub const DEFAULT_STOP_TIMEOUT: u32 = 10;
}

/// Container environment defaults.
pub mod container {
    /// Value of the `container` environment variable.
    pub const ENGINE_NAME: &str = "podman";

    /// Network joined by bare `bridge` mode.
    pub const DEFAULT_NETWORK: &str = "podman";

    /// Default PATH when neither image nor engine config provides one.
    pub const DEFAULT_PATH: &str =
        "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

    /// Working directory used when neither request nor image sets one.
    pub const DEFAULT_WORKDIR: &str = "/";
}
