//! Sampling cadence and pipeline assembly.
//!
//! The dispatcher owns the monitoring cadence: once per period it checks the
//! target, fires the next worker round-robin, then sleeps to an absolute
//! deadline so per-iteration overhead never accumulates into drift. When the
//! target dies it pushes the end-of-stream sentinel and tears the pool down.

pub mod worker;

use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::config::Config;
use crate::netlink::{QueryCodec, Transport};
use crate::queue::BoundedQueue;
use crate::sink;
use crate::target::Liveness;

pub use worker::{SampleQueue, WorkerPool};

/// Drives the sampling loop until the target exits.
pub struct Dispatcher {
    period: Duration,
    liveness: Box<dyn Liveness>,
    pool: WorkerPool,
    queue: Arc<SampleQueue>,
}

impl Dispatcher {
    pub fn new(
        period: Duration,
        liveness: Box<dyn Liveness>,
        pool: WorkerPool,
        queue: Arc<SampleQueue>,
    ) -> Self {
        Self {
            period,
            liveness,
            pool,
            queue,
        }
    }

    /// Run until the target dies, then shut the worker pool down.
    ///
    /// The sentinel is pushed before the pool is joined, so a cycle that is
    /// still in flight may enqueue its sample after the sentinel; the sink
    /// stops at the sentinel either way.
    pub fn run(mut self) {
        info!(
            period_ms = self.period.as_millis() as u64,
            workers = self.pool.len(),
            "monitoring started"
        );

        let mut deadline = Instant::now();
        loop {
            if !self.liveness.is_alive() {
                info!("target exited, ending sample stream");
                self.queue.push(None);
                break;
            }

            self.pool.trigger_next();

            // Absolute deadlines: a late iteration shortens the next sleep
            // instead of shifting every later one.
            deadline += self.period;
            if let Some(wait) = deadline.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            } else {
                debug!("sampling iteration overran its period");
            }
        }

        self.pool.shutdown();
    }
}

/// Assemble queue, workers, sink and dispatcher, then block until the target
/// exits and every sample before the sentinel has been written.
///
/// Returns the number of samples delivered to the output.
pub fn run_pipeline(
    cfg: &Config,
    codec: QueryCodec,
    transports: Vec<Box<dyn Transport>>,
    liveness: Box<dyn Liveness>,
    mut out: Box<dyn Write + Send>,
) -> Result<u64> {
    cfg.validate()?;
    if transports.is_empty() {
        bail!("at least one worker transport is required");
    }

    let queue = Arc::new(BoundedQueue::new(cfg.queue_capacity));

    let pool = WorkerPool::spawn(
        transports,
        Arc::new(codec),
        cfg.kind,
        cfg.target_id,
        Arc::clone(&queue),
    )
    .context("spawning query workers")?;

    let format = cfg.format;
    let sink_queue = Arc::clone(&queue);
    let sink = thread::Builder::new()
        .name("sink".into())
        .spawn(move || sink::drain(&sink_queue, &mut *out, format))
        .context("spawning sink thread")?;

    Dispatcher::new(cfg.period, liveness, pool, queue).run();

    let delivered = match sink.join() {
        Ok(result) => result.context("writing samples")?,
        Err(_) => bail!("sink thread panicked"),
    };

    info!(samples = delivered, "monitoring finished");
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::target::Liveness;

    /// Reports alive for a fixed number of checks, then dead.
    #[derive(Debug)]
    struct CountdownLiveness {
        checks_left: AtomicU32,
    }

    impl Liveness for CountdownLiveness {
        fn is_alive(&self) -> bool {
            loop {
                let left = self.checks_left.load(Ordering::Acquire);
                if left == 0 {
                    return false;
                }
                if self
                    .checks_left
                    .compare_exchange(left, left - 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return true;
                }
            }
        }
    }

    #[derive(Debug)]
    struct NeverStarted;

    impl Liveness for NeverStarted {
        fn is_alive(&self) -> bool {
            false
        }
    }

    struct NoopTransport;

    impl Transport for NoopTransport {
        fn send(&self, _message: &[u8]) -> Result<(), crate::netlink::TransportError> {
            Ok(())
        }

        fn recv(&self) -> Result<Vec<u8>, crate::netlink::TransportError> {
            Err(crate::netlink::TransportError::Socket(
                std::io::Error::other("no reply scripted"),
            ))
        }
    }

    fn pool_of(n: usize, queue: &Arc<SampleQueue>) -> WorkerPool {
        let transports: Vec<Box<dyn Transport>> =
            (0..n).map(|_| Box::new(NoopTransport) as Box<dyn Transport>).collect();
        WorkerPool::spawn(
            transports,
            Arc::new(QueryCodec::new(0x19)),
            crate::taskstats::TargetKind::Pid,
            1,
            Arc::clone(queue),
        )
        .expect("spawn pool")
    }

    #[test]
    fn test_dead_target_yields_immediate_sentinel() {
        let queue = Arc::new(SampleQueue::new(8));
        let pool = pool_of(1, &queue);

        Dispatcher::new(
            Duration::from_millis(1),
            Box::new(NeverStarted),
            pool,
            Arc::clone(&queue),
        )
        .run();

        assert_eq!(queue.len(), 1);
        assert!(queue.pop().is_none(), "only the sentinel should be queued");
    }

    #[test]
    fn test_dispatcher_fires_once_per_live_check() {
        let queue = Arc::new(SampleQueue::new(8));
        let pool = pool_of(2, &queue);

        let start = Instant::now();
        Dispatcher::new(
            Duration::from_millis(10),
            Box::new(CountdownLiveness {
                checks_left: AtomicU32::new(3),
            }),
            pool,
            Arc::clone(&queue),
        )
        .run();

        // Three live iterations at 10ms apiece, then the dead check.
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(queue.pop().is_none(), "stream must end with the sentinel");
    }

    #[test]
    fn test_pipeline_rejects_empty_transport_set() {
        let cfg = Config::new(crate::taskstats::TargetKind::Pid, 1);
        let err = run_pipeline(
            &cfg,
            QueryCodec::new(0x19),
            Vec::new(),
            Box::new(NeverStarted),
            Box::new(Vec::new()),
        )
        .expect_err("no transports must be rejected");
        assert!(err.to_string().contains("transport"));
    }
}
