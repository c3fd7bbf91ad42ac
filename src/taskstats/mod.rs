//! Taskstats accounting record and capture metadata.
//!
//! [`Taskstats`] mirrors the kernel's `struct taskstats` as named fields,
//! decoded from the response blob by explicit per-field offset reads. Blobs
//! from newer kernels are longer; everything past the fields we know is
//! ignored, and version-gated fields default to zero when absent.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Addressing semantics of an accounting query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Query a single process/thread id.
    Pid,
    /// Query an entire thread group.
    Tgid,
}

impl TargetKind {
    /// Returns the canonical log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pid => "pid",
            Self::Tgid => "tgid",
        }
    }
}

/// Errors decoding the accounting record blob.
#[derive(Error, Debug)]
pub enum StatsError {
    #[error("accounting record too short: {size} bytes (need {need})")]
    Truncated { size: usize, need: usize },
}

/// Command-name field width in `struct taskstats` (TS_COMM_LEN).
pub const COMM_LEN: usize = 32;

/// Size of the version-8 `struct taskstats` layout.
const V8_SIZE: usize = 328;

/// Size once the version-9 thrashing fields are present.
const V9_SIZE: usize = 344;

/// One parsed accounting snapshot plus capture metadata.
///
/// Immutable after construction. Treated as an opaque value by the queue and
/// the dispatcher; only the codec (on decode) and the sink (on render)
/// interpret the payload fields.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Process or thread id the sample describes.
    pub pid: u32,
    /// Thread-group id, zero if the kernel did not report one.
    pub tgid: u32,
    /// Wall-clock nanoseconds at receipt time, set by the worker.
    pub captured_at_ns: u64,
    /// The decoded accounting record.
    pub stats: Taskstats,
}

/// Wall-clock nanoseconds since the Unix epoch.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Decoded `struct taskstats`, versions 8 and up.
///
/// Field names follow the kernel header so the rendered output can be checked
/// against Documentation/accounting/taskstats-struct.rst directly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Taskstats {
    pub version: u16,
    pub ac_exitcode: u32,
    pub ac_flag: u8,
    pub ac_nice: u8,

    pub cpu_count: u64,
    pub cpu_delay_total: u64,
    pub blkio_count: u64,
    pub blkio_delay_total: u64,
    pub swapin_count: u64,
    pub swapin_delay_total: u64,
    pub cpu_run_real_total: u64,
    pub cpu_run_virtual_total: u64,

    pub ac_comm: String,
    pub ac_sched: u8,
    pub ac_uid: u32,
    pub ac_gid: u32,
    pub ac_pid: u32,
    pub ac_ppid: u32,
    pub ac_btime: u32,
    pub ac_etime: u64,
    pub ac_utime: u64,
    pub ac_stime: u64,
    pub ac_minflt: u64,
    pub ac_majflt: u64,

    pub coremem: u64,
    pub virtmem: u64,
    pub hiwater_rss: u64,
    pub hiwater_vm: u64,
    pub read_char: u64,
    pub write_char: u64,
    pub read_syscalls: u64,
    pub write_syscalls: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub cancelled_write_bytes: u64,

    pub nvcsw: u64,
    pub nivcsw: u64,

    pub ac_utimescaled: u64,
    pub ac_stimescaled: u64,
    pub cpu_scaled_run_real_total: u64,

    pub freepages_count: u64,
    pub freepages_delay_total: u64,

    /// Version >= 9 only; zero otherwise.
    pub thrashing_count: u64,
    /// Version >= 9 only; zero otherwise.
    pub thrashing_delay_total: u64,
}

impl Taskstats {
    /// Decode the kernel blob. Offsets follow the natural alignment of
    /// `struct taskstats` (u64 fields 8-aligned, `ac_uid` forced to 8).
    pub fn decode(data: &[u8]) -> Result<Self, StatsError> {
        if data.len() < V8_SIZE {
            return Err(StatsError::Truncated {
                size: data.len(),
                need: V8_SIZE,
            });
        }

        let version = read_u16(data, 0);

        let mut stats = Self {
            version,
            ac_exitcode: read_u32(data, 4),
            ac_flag: read_u8(data, 8),
            ac_nice: read_u8(data, 9),

            cpu_count: read_u64(data, 16),
            cpu_delay_total: read_u64(data, 24),
            blkio_count: read_u64(data, 32),
            blkio_delay_total: read_u64(data, 40),
            swapin_count: read_u64(data, 48),
            swapin_delay_total: read_u64(data, 56),
            cpu_run_real_total: read_u64(data, 64),
            cpu_run_virtual_total: read_u64(data, 72),

            ac_comm: read_comm(data, 80),
            ac_sched: read_u8(data, 112),
            ac_uid: read_u32(data, 120),
            ac_gid: read_u32(data, 124),
            ac_pid: read_u32(data, 128),
            ac_ppid: read_u32(data, 132),
            ac_btime: read_u32(data, 136),
            ac_etime: read_u64(data, 144),
            ac_utime: read_u64(data, 152),
            ac_stime: read_u64(data, 160),
            ac_minflt: read_u64(data, 168),
            ac_majflt: read_u64(data, 176),

            coremem: read_u64(data, 184),
            virtmem: read_u64(data, 192),
            hiwater_rss: read_u64(data, 200),
            hiwater_vm: read_u64(data, 208),
            read_char: read_u64(data, 216),
            write_char: read_u64(data, 224),
            read_syscalls: read_u64(data, 232),
            write_syscalls: read_u64(data, 240),
            read_bytes: read_u64(data, 248),
            write_bytes: read_u64(data, 256),
            cancelled_write_bytes: read_u64(data, 264),

            nvcsw: read_u64(data, 272),
            nivcsw: read_u64(data, 280),

            ac_utimescaled: read_u64(data, 288),
            ac_stimescaled: read_u64(data, 296),
            cpu_scaled_run_real_total: read_u64(data, 304),

            freepages_count: read_u64(data, 312),
            freepages_delay_total: read_u64(data, 320),

            thrashing_count: 0,
            thrashing_delay_total: 0,
        };

        if version >= 9 && data.len() >= V9_SIZE {
            stats.thrashing_count = read_u64(data, 328);
            stats.thrashing_delay_total = read_u64(data, 336);
        }

        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Byte-reading helpers (native endian; netlink and taskstats are host order)
// ---------------------------------------------------------------------------

#[inline]
pub(crate) fn read_u8(data: &[u8], offset: usize) -> u8 {
    data.get(offset).copied().unwrap_or(0)
}

#[inline]
pub(crate) fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_ne_bytes(read_fixed::<2>(data, offset))
}

#[inline]
pub(crate) fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(read_fixed::<4>(data, offset))
}

#[inline]
pub(crate) fn read_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(read_fixed::<8>(data, offset))
}

#[inline]
pub(crate) fn read_i32(data: &[u8], offset: usize) -> i32 {
    read_u32(data, offset) as i32
}

/// Copy `N` bytes at `offset`, zero-filling past the end of `data`. Callers
/// validate lengths up front; the fallback keeps every read total.
#[inline]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    if let Some(src) = data.get(offset..offset + N) {
        out.copy_from_slice(src);
    }
    out
}

/// Read the NUL-terminated command name at `offset`.
fn read_comm(data: &[u8], offset: usize) -> String {
    let raw = data.get(offset..offset + COMM_LEN).unwrap_or(&[]);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a version-`version` blob with recognizable per-field values.
    fn blob(version: u16, size: usize) -> Vec<u8> {
        let mut data = vec![0u8; size];
        data[0..2].copy_from_slice(&version.to_ne_bytes());
        data[4..8].copy_from_slice(&7u32.to_ne_bytes()); // ac_exitcode
        data[8] = 0x2; // ac_flag
        data[9] = 10; // ac_nice
        data[16..24].copy_from_slice(&100u64.to_ne_bytes()); // cpu_count
        data[24..32].copy_from_slice(&200u64.to_ne_bytes()); // cpu_delay_total
        data[80..83].copy_from_slice(b"cat"); // ac_comm, NUL padded
        data[112] = 1; // ac_sched
        data[120..124].copy_from_slice(&1000u32.to_ne_bytes()); // ac_uid
        data[128..132].copy_from_slice(&4242u32.to_ne_bytes()); // ac_pid
        data[136..140].copy_from_slice(&1_700_000_000u32.to_ne_bytes()); // ac_btime
        data[160..168].copy_from_slice(&5_000u64.to_ne_bytes()); // ac_stime
        data[272..280].copy_from_slice(&11u64.to_ne_bytes()); // nvcsw
        data[280..288].copy_from_slice(&13u64.to_ne_bytes()); // nivcsw
        data[320..328].copy_from_slice(&17u64.to_ne_bytes()); // freepages_delay_total
        if size >= 344 {
            data[328..336].copy_from_slice(&3u64.to_ne_bytes()); // thrashing_count
            data[336..344].copy_from_slice(&9u64.to_ne_bytes()); // thrashing_delay_total
        }
        data
    }

    #[test]
    fn test_decode_v8_fields() {
        let stats = Taskstats::decode(&blob(8, 328)).expect("valid blob");
        assert_eq!(stats.version, 8);
        assert_eq!(stats.ac_exitcode, 7);
        assert_eq!(stats.ac_flag, 0x2);
        assert_eq!(stats.ac_nice, 10);
        assert_eq!(stats.cpu_count, 100);
        assert_eq!(stats.cpu_delay_total, 200);
        assert_eq!(stats.ac_comm, "cat");
        assert_eq!(stats.ac_sched, 1);
        assert_eq!(stats.ac_uid, 1000);
        assert_eq!(stats.ac_pid, 4242);
        assert_eq!(stats.ac_btime, 1_700_000_000);
        assert_eq!(stats.ac_stime, 5_000);
        assert_eq!(stats.nvcsw, 11);
        assert_eq!(stats.nivcsw, 13);
        assert_eq!(stats.freepages_delay_total, 17);
        // Thrashing fields absent at v8.
        assert_eq!(stats.thrashing_count, 0);
        assert_eq!(stats.thrashing_delay_total, 0);
    }

    #[test]
    fn test_decode_v9_thrashing_fields() {
        let stats = Taskstats::decode(&blob(9, 344)).expect("valid blob");
        assert_eq!(stats.thrashing_count, 3);
        assert_eq!(stats.thrashing_delay_total, 9);
    }

    #[test]
    fn test_decode_v9_version_but_short_blob() {
        // A lying version field must not read past the buffer.
        let stats = Taskstats::decode(&blob(9, 328)).expect("valid blob");
        assert_eq!(stats.thrashing_count, 0);
    }

    #[test]
    fn test_decode_longer_blob_from_newer_kernel() {
        // Trailing bytes from fields we do not know are ignored.
        let mut data = blob(13, 344);
        data.extend_from_slice(&[0xab; 64]);
        let stats = Taskstats::decode(&data).expect("valid blob");
        assert_eq!(stats.ac_pid, 4242);
        assert_eq!(stats.thrashing_count, 3);
    }

    #[test]
    fn test_decode_truncated() {
        let err = Taskstats::decode(&[0u8; 100]).expect_err("too short");
        assert!(matches!(err, StatsError::Truncated { size: 100, need: 328 }));
    }

    #[test]
    fn test_comm_without_nul_uses_full_width() {
        let mut data = blob(8, 328);
        data[80..112].copy_from_slice(&[b'x'; 32]);
        let stats = Taskstats::decode(&data).expect("valid blob");
        assert_eq!(stats.ac_comm.len(), COMM_LEN);
    }
}
