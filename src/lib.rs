//! Per-process resource monitoring over the kernel taskstats interface.
//!
//! A dispatcher thread fires a pool of query workers round-robin, once per
//! sampling period. Each worker exchanges one generic-netlink request/reply
//! with the kernel, decodes the taskstats payload into a [`taskstats::Sample`]
//! and pushes it onto a bounded queue. A single sink drains the queue and
//! renders samples to the console or a file. When the monitored process
//! exits, the dispatcher pushes an end-of-stream sentinel and the pipeline
//! winds down in order.

pub mod config;
pub mod monitor;
pub mod netlink;
pub mod queue;
pub mod sink;
pub mod target;
pub mod taskstats;
