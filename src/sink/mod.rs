//! Sample rendering and the queue drain loop.
//!
//! The sink is the single consumer of the pipeline queue: it pops until the
//! end-of-stream sentinel, rendering each sample either as a structured
//! display block or as one timestamp-prefixed tab-separated line. Field
//! meanings follow Documentation/accounting/taskstats-struct.rst.

use std::io::{self, Write};

use chrono::{Local, TimeZone};
use tracing::debug;

use crate::config::OutputFormat;
use crate::queue::BoundedQueue;
use crate::taskstats::Sample;

/// Drain the queue until the sentinel, rendering every sample to `out`.
///
/// Returns the number of samples delivered.
pub fn drain(
    queue: &BoundedQueue<Option<Sample>>,
    out: &mut dyn Write,
    format: OutputFormat,
) -> io::Result<u64> {
    let mut delivered = 0u64;

    loop {
        match queue.pop() {
            Some(sample) => {
                render(&sample, format, out)?;
                out.flush()?;
                delivered += 1;
            }
            None => {
                debug!(delivered, "sample stream ended");
                return Ok(delivered);
            }
        }
    }
}

/// Render one sample in the configured format.
pub fn render(sample: &Sample, format: OutputFormat, out: &mut dyn Write) -> io::Result<()> {
    match format {
        OutputFormat::Block { human_units } => render_block(sample, human_units, out),
        OutputFormat::Tsv => render_line(sample, out),
    }
}

/// Multi-line display block, one per sample.
pub fn render_block(sample: &Sample, human_units: bool, out: &mut dyn Write) -> io::Result<()> {
    let s = &sample.stats;

    writeln!(out)?;
    writeln!(out, "=========== {} ===========", ns_timestamp(sample.captured_at_ns))?;

    writeln!(out, "\nBasic task statistics")?;
    writeln!(out, "---------------------")?;
    writeln!(out, "{:<25}{}", "Stats version:", s.version)?;
    writeln!(out, "{:<25}{}", "Exit code:", s.ac_exitcode)?;
    writeln!(out, "{:<25}0x{:x}", "Flags:", s.ac_flag)?;
    writeln!(out, "{:<25}{}", "Nice value:", s.ac_nice)?;
    writeln!(out, "{:<25}{}", "Command name:", s.ac_comm)?;
    writeln!(out, "{:<25}{}", "Scheduling discipline:", s.ac_sched)?;
    writeln!(out, "{:<25}{}", "UID:", s.ac_uid)?;
    writeln!(out, "{:<25}{}", "GID:", s.ac_gid)?;
    writeln!(out, "{:<25}{}", "PID:", s.ac_pid)?;
    writeln!(out, "{:<25}{}", "PPID:", s.ac_ppid)?;
    if human_units {
        writeln!(out, "{:<25}{}", "Begin time:", begin_time(s.ac_btime))?;
    } else {
        writeln!(out, "{:<25}{} sec", "Begin time:", s.ac_btime)?;
    }
    writeln!(out, "{:<25}{} usec", "Elapsed time:", s.ac_etime)?;
    writeln!(out, "{:<25}{} usec", "User CPU time:", s.ac_utime)?;
    writeln!(out, "{:<25}{} usec", "System CPU time:", s.ac_stime)?;
    writeln!(out, "{:<25}{}", "Minor page faults:", s.ac_minflt)?;
    writeln!(out, "{:<25}{}", "Major page faults:", s.ac_majflt)?;
    writeln!(out, "{:<25}{} usec", "Scaled user time:", s.ac_utimescaled)?;
    writeln!(out, "{:<25}{} usec", "Scaled system time:", s.ac_stimescaled)?;

    writeln!(out, "\nDelay accounting")?;
    writeln!(out, "----------------")?;
    writeln!(
        out,
        "       {:>15}{:>15}{:>15}{:>15}{:>15}{:>15}",
        "Count",
        if human_units { "Delay (ms)" } else { "Delay (ns)" },
        "Average delay",
        "Real delay",
        "Scaled real",
        "Virtual delay",
    )?;
    if human_units {
        const MS_PER_NS: f64 = 1e6;
        writeln!(
            out,
            "CPU    {:>15}{:>15.3}{:>15.3}{:>15.3}{:>15.3}{:>15.3}",
            s.cpu_count,
            s.cpu_delay_total as f64 / MS_PER_NS,
            average_ms(s.cpu_delay_total, s.cpu_count),
            s.cpu_run_real_total as f64 / MS_PER_NS,
            s.cpu_scaled_run_real_total as f64 / MS_PER_NS,
            s.cpu_run_virtual_total as f64 / MS_PER_NS,
        )?;
        writeln!(
            out,
            "IO     {:>15}{:>15.3}{:>15.3}",
            s.blkio_count,
            s.blkio_delay_total as f64 / MS_PER_NS,
            average_ms(s.blkio_delay_total, s.blkio_count),
        )?;
        writeln!(
            out,
            "Swap   {:>15}{:>15.3}{:>15.3}",
            s.swapin_count,
            s.swapin_delay_total as f64 / MS_PER_NS,
            average_ms(s.swapin_delay_total, s.swapin_count),
        )?;
        writeln!(
            out,
            "Reclaim{:>15}{:>15.3}{:>15.3}",
            s.freepages_count,
            s.freepages_delay_total as f64 / MS_PER_NS,
            average_ms(s.freepages_delay_total, s.freepages_count),
        )?;
    } else {
        writeln!(
            out,
            "CPU    {:>15}{:>15}{:>15}{:>15}{:>15}{:>15}",
            s.cpu_count,
            s.cpu_delay_total,
            average_ns(s.cpu_delay_total, s.cpu_count),
            s.cpu_run_real_total,
            s.cpu_scaled_run_real_total,
            s.cpu_run_virtual_total,
        )?;
        writeln!(
            out,
            "IO     {:>15}{:>15}{:>15}",
            s.blkio_count,
            s.blkio_delay_total,
            average_ns(s.blkio_delay_total, s.blkio_count),
        )?;
        writeln!(
            out,
            "Swap   {:>15}{:>15}{:>15}",
            s.swapin_count,
            s.swapin_delay_total,
            average_ns(s.swapin_delay_total, s.swapin_count),
        )?;
        writeln!(
            out,
            "Reclaim{:>15}{:>15}{:>15}",
            s.freepages_count,
            s.freepages_delay_total,
            average_ns(s.freepages_delay_total, s.freepages_count),
        )?;
    }

    writeln!(out, "\nExtended accounting fields")?;
    writeln!(out, "--------------------------")?;
    if human_units && s.ac_stime > 0 {
        writeln!(
            out,
            "{:<25}{:.3} MB",
            "Average RSS usage:",
            s.coremem as f64 / s.ac_stime as f64,
        )?;
        writeln!(
            out,
            "{:<25}{:.3} MB",
            "Average VM usage:",
            s.virtmem as f64 / s.ac_stime as f64,
        )?;
    } else {
        writeln!(out, "{:<25}{} MB", "Accumulated RSS usage:", s.coremem)?;
        writeln!(out, "{:<25}{} MB", "Accumulated VM usage:", s.virtmem)?;
    }
    writeln!(out, "{:<25}{} KB", "RSS high water mark:", s.hiwater_rss)?;
    writeln!(out, "{:<25}{} KB", "VM high water mark:", s.hiwater_vm)?;
    writeln!(out, "{:<25}{}", "IO bytes read:", s.read_char)?;
    writeln!(out, "{:<25}{}", "IO bytes written:", s.write_char)?;
    writeln!(out, "{:<25}{}", "IO read syscalls:", s.read_syscalls)?;
    writeln!(out, "{:<25}{}", "IO write syscalls:", s.write_syscalls)?;

    writeln!(out, "\nPer-task/thread statistics")?;
    writeln!(out, "--------------------------")?;
    writeln!(out, "{:<25}{}", "Voluntary switches:", s.nvcsw)?;
    writeln!(out, "{:<25}{}", "Involuntary switches:", s.nivcsw)?;
    if s.version >= 9 {
        writeln!(out, "{:<25}{}", "Thrashing count:", s.thrashing_count)?;
        writeln!(
            out,
            "{:<25}{}",
            "Thrashing delay total:", s.thrashing_delay_total,
        )?;
    }

    Ok(())
}

/// One tab-separated line: capture timestamp, then every field in struct
/// order.
pub fn render_line(sample: &Sample, out: &mut dyn Write) -> io::Result<()> {
    let s = &sample.stats;
    writeln!(
        out,
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
        sample.captured_at_ns,
        s.version,
        s.ac_exitcode,
        s.ac_flag,
        s.ac_nice,
        s.cpu_count,
        s.cpu_delay_total,
        s.blkio_count,
        s.blkio_delay_total,
        s.swapin_count,
        s.swapin_delay_total,
        s.cpu_run_real_total,
        s.cpu_run_virtual_total,
        s.ac_comm,
        s.ac_sched,
        s.ac_uid,
        s.ac_gid,
        s.ac_pid,
        s.ac_ppid,
        s.ac_btime,
        s.ac_etime,
        s.ac_utime,
        s.ac_stime,
        s.ac_minflt,
        s.ac_majflt,
        s.coremem,
        s.virtmem,
        s.hiwater_rss,
        s.hiwater_vm,
        s.read_char,
        s.write_char,
        s.read_syscalls,
        s.write_syscalls,
        s.read_bytes,
        s.write_bytes,
        s.cancelled_write_bytes,
        s.nvcsw,
        s.nivcsw,
        s.ac_utimescaled,
        s.ac_stimescaled,
        s.cpu_scaled_run_real_total,
        s.freepages_count,
        s.freepages_delay_total,
        s.thrashing_count,
        s.thrashing_delay_total,
    )
}

fn average_ms(total: u64, count: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    total as f64 / count as f64 / 1e6
}

fn average_ns(total: u64, count: u64) -> u64 {
    if count == 0 {
        return 0;
    }
    total / count
}

/// Local-time rendering of a nanosecond wall-clock timestamp.
fn ns_timestamp(ns: u64) -> String {
    let secs = (ns / 1_000_000_000) as i64;
    let subsec = (ns % 1_000_000_000) as u32;
    match Local.timestamp_opt(secs, subsec) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        _ => format!("{ns} ns"),
    }
}

/// Local-time rendering of the process begin time (seconds since the epoch).
fn begin_time(secs: u32) -> String {
    match Local.timestamp_opt(i64::from(secs), 0) {
        chrono::LocalResult::Single(dt) => dt.format("%a %b %e %H:%M:%S %Y").to_string(),
        _ => format!("{secs} sec"),
    }
}
