//! Host environment fingerprint, captured once at session start and baked
//! into the immutable [`beacon_framing::SessionSummary`] header.

use sysinfo::System;

/// The subset of [`beacon_framing::SessionSummary`] fields sourced from the
/// host rather than from the caller's identity/config.
#[derive(Debug, Clone, PartialEq)]
pub struct HostFingerprint {
    pub os: String,
    pub arch: String,
    pub cpu_count: u32,
    pub memory_bytes: u64,
    pub pid: u32,
    pub hostname: String,
}

/// Collect the fingerprint. Cheap enough to call once per session open —
/// it does not start a background refresh thread.
pub fn collect() -> HostFingerprint {
    let mut system = System::new();
    system.refresh_memory();

    HostFingerprint {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        cpu_count: std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1),
        memory_bytes: system.total_memory(),
        pid: std::process::id(),
        hostname: gethostname::gethostname()
            .into_string()
            .unwrap_or_else(|_| "unknown-host".to_string()),
    }
}
