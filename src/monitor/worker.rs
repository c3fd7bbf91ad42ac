//! Long-lived query workers and their single-slot triggers.
//!
//! Each worker idles on a capacity-1 channel until the dispatcher fires it,
//! then performs exactly one request/response cycle: encode, send, block for
//! the reply, decode, enqueue. A trigger fired while a worker is mid-cycle
//! parks in the slot; further fires are dropped, so at most one cycle is
//! ever pending per worker.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::netlink::{QueryCodec, Transport};
use crate::queue::BoundedQueue;
use crate::taskstats::{Sample, TargetKind};

/// Queue element: a sample, or `None` as the end-of-stream sentinel.
pub type SampleQueue = BoundedQueue<Option<Sample>>;

/// Fixed pool of query workers, one OS thread per transport.
pub struct WorkerPool {
    triggers: Vec<SyncSender<()>>,
    handles: Vec<JoinHandle<()>>,
    next: usize,
}

impl WorkerPool {
    /// Spawn one worker per transport. Workers share the codec and the
    /// queue; each owns its transport outright so exchanges never
    /// interleave.
    pub fn spawn(
        transports: Vec<Box<dyn Transport>>,
        codec: Arc<QueryCodec>,
        kind: TargetKind,
        target_id: u32,
        queue: Arc<SampleQueue>,
    ) -> Result<Self> {
        let mut triggers = Vec::with_capacity(transports.len());
        let mut handles = Vec::with_capacity(transports.len());

        for (id, transport) in transports.into_iter().enumerate() {
            let (tx, rx) = sync_channel::<()>(1);
            let codec = Arc::clone(&codec);
            let queue = Arc::clone(&queue);

            let handle = thread::Builder::new()
                .name(format!("query-{id}"))
                .spawn(move || run_worker(id, rx, transport, codec, kind, target_id, queue))
                .with_context(|| format!("spawning query worker {id}"))?;

            triggers.push(tx);
            handles.push(handle);
        }

        Ok(Self {
            triggers,
            handles,
            next: 0,
        })
    }

    /// Number of workers in the pool.
    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    /// True if the pool has no workers.
    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Fire the next worker's trigger, round-robin.
    ///
    /// Returns false when the fire coalesced into an already-pending trigger
    /// (the worker owes a cycle regardless) or the worker is gone.
    pub fn trigger_next(&mut self) -> bool {
        let idx = self.next;
        self.next = (self.next + 1) % self.triggers.len();

        match self.triggers[idx].try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => {
                debug!(worker = idx, "trigger coalesced, worker still busy");
                false
            }
            Err(TrySendError::Disconnected(())) => {
                warn!(worker = idx, "worker exited, trigger dropped");
                false
            }
        }
    }

    /// Disconnect all triggers and join the worker threads. An in-flight
    /// cycle runs to completion first.
    pub fn shutdown(self) {
        drop(self.triggers);

        for handle in self.handles {
            if handle.join().is_err() {
                warn!("query worker panicked during shutdown");
            }
        }
    }
}

fn run_worker(
    id: usize,
    trigger: Receiver<()>,
    transport: Box<dyn Transport>,
    codec: Arc<QueryCodec>,
    kind: TargetKind,
    target_id: u32,
    queue: Arc<SampleQueue>,
) {
    debug!(worker = id, target = target_id, kind = kind.as_str(), "query worker started");

    // One cycle per trigger; disconnect ends the loop.
    while trigger.recv().is_ok() {
        let request = codec.encode_query(kind, target_id);

        if let Err(e) = transport.send(&request) {
            warn!(worker = id, error = %e, "failed to send accounting query");
            continue;
        }

        let reply = match transport.recv() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(worker = id, error = %e, "failed to receive accounting reply");
                continue;
            }
        };

        match codec.decode_response(&reply) {
            Ok(Some(sample)) => queue.push(Some(sample)),
            Ok(None) => debug!(worker = id, "reply carried no accounting data"),
            Err(e) => warn!(worker = id, error = %e, "discarding unusable reply"),
        }
    }

    debug!(worker = id, "query worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{channel, Sender};
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;

    use super::*;
    use crate::netlink::TransportError;

    /// Transport whose replies are fed through a channel, so tests control
    /// exactly when a worker's cycle completes.
    struct ScriptedTransport {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        replies: Mutex<Receiver<Vec<u8>>>,
    }

    impl ScriptedTransport {
        fn new() -> (Box<dyn Transport>, Sender<Vec<u8>>, Arc<Mutex<Vec<Vec<u8>>>>) {
            let (tx, rx) = channel();
            let sent = Arc::new(Mutex::new(Vec::new()));
            let transport = Box::new(Self {
                sent: Arc::clone(&sent),
                replies: Mutex::new(rx),
            });
            (transport, tx, sent)
        }
    }

    impl Transport for ScriptedTransport {
        fn send(&self, message: &[u8]) -> Result<(), TransportError> {
            self.sent.lock().push(message.to_vec());
            Ok(())
        }

        fn recv(&self) -> Result<Vec<u8>, TransportError> {
            self.replies
                .lock()
                .recv()
                .map_err(|_| TransportError::Socket(std::io::Error::other("scripted stream closed")))
        }
    }

    // Minimal kernel-shaped aggregate reply, mirroring the codec framing.
    fn attr(atype: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((4 + payload.len()) as u16).to_ne_bytes());
        buf.extend_from_slice(&atype.to_ne_bytes());
        buf.extend_from_slice(payload);
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
        buf
    }

    fn aggr_reply(pid: u32) -> Vec<u8> {
        let mut blob = vec![0u8; 328];
        blob[0..2].copy_from_slice(&8u16.to_ne_bytes());

        let mut nest = attr(1, &pid.to_ne_bytes()); // TASKSTATS_TYPE_PID
        nest.extend_from_slice(&attr(3, &blob)); // TASKSTATS_TYPE_STATS

        let mut msg = vec![0u8; 20];
        msg[16] = 2; // TASKSTATS_CMD_NEW
        msg.extend_from_slice(&attr(4, &nest)); // TASKSTATS_TYPE_AGGR_PID
        let len = msg.len() as u32;
        msg[0..4].copy_from_slice(&len.to_ne_bytes());
        msg[4..6].copy_from_slice(&0x19u16.to_ne_bytes());
        msg
    }

    fn wait_for<F: FnMut() -> bool>(what: &str, mut cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_worker_cycle_enqueues_sample() {
        let (transport, replies, sent) = ScriptedTransport::new();
        let queue = Arc::new(SampleQueue::new(16));
        let codec = Arc::new(QueryCodec::new(0x19));

        let mut pool = WorkerPool::spawn(
            vec![transport],
            codec,
            TargetKind::Pid,
            4242,
            Arc::clone(&queue),
        )
        .expect("spawn pool");

        assert!(pool.trigger_next());
        wait_for("query sent", || !sent.lock().is_empty());
        replies.send(aggr_reply(4242)).expect("worker receiving");

        let sample = queue.pop().expect("sample, not sentinel");
        assert_eq!(sample.pid, 4242);

        pool.shutdown();
    }

    #[test]
    fn test_triggers_coalesce_while_worker_busy() {
        let (transport, replies, sent) = ScriptedTransport::new();
        let queue = Arc::new(SampleQueue::new(16));
        let codec = Arc::new(QueryCodec::new(0x19));

        let mut pool = WorkerPool::spawn(
            vec![transport],
            codec,
            TargetKind::Pid,
            7,
            Arc::clone(&queue),
        )
        .expect("spawn pool");

        // First trigger: consumed, worker blocks awaiting its reply.
        assert!(pool.trigger_next());
        wait_for("first query sent", || sent.lock().len() == 1);

        // Second trigger parks in the empty slot; third must coalesce.
        assert!(pool.trigger_next());
        assert!(!pool.trigger_next(), "third fire should coalesce");

        // Release both pending cycles.
        replies.send(aggr_reply(7)).expect("worker receiving");
        wait_for("second query sent", || sent.lock().len() == 2);
        replies.send(aggr_reply(7)).expect("worker receiving");

        // Three fires, two cycles, two samples.
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_some());
        wait_for("queue drained", || queue.is_empty());

        pool.shutdown();
        assert_eq!(sent.lock().len(), 2);
    }

    #[test]
    fn test_round_robin_rotation() {
        let mut transports = Vec::new();
        let mut sents = Vec::new();
        for _ in 0..3 {
            let (transport, _replies, sent) = ScriptedTransport::new();
            // Replies sender dropped: recv fails, worker logs and idles again.
            transports.push(transport);
            sents.push(sent);
        }

        let queue = Arc::new(SampleQueue::new(16));
        let mut pool = WorkerPool::spawn(
            transports,
            Arc::new(QueryCodec::new(0x19)),
            TargetKind::Tgid,
            9,
            queue,
        )
        .expect("spawn pool");

        // Fire in whole rounds so every trigger lands on an idle worker.
        for round in 1..=2usize {
            for _ in 0..3 {
                assert!(pool.trigger_next());
            }
            for sent in &sents {
                let sent = Arc::clone(sent);
                wait_for("queries sent this round", move || sent.lock().len() == round);
            }
        }

        pool.shutdown();
        for sent in &sents {
            assert_eq!(sent.lock().len(), 2);
        }
    }

    #[test]
    fn test_malformed_reply_not_enqueued() {
        let (transport, replies, sent) = ScriptedTransport::new();
        let queue = Arc::new(SampleQueue::new(16));

        let mut pool = WorkerPool::spawn(
            vec![transport],
            Arc::new(QueryCodec::new(0x19)),
            TargetKind::Pid,
            7,
            Arc::clone(&queue),
        )
        .expect("spawn pool");

        assert!(pool.trigger_next());
        wait_for("query sent", || !sent.lock().is_empty());
        replies.send(vec![0xff; 7]).expect("worker receiving");

        // The worker must swallow the error and come back for more.
        wait_for("worker idle again", || pool.trigger_next());
        wait_for("second query sent", || sent.lock().len() >= 2);
        assert!(queue.is_empty());

        // Close the reply stream so the in-flight recv fails and the worker
        // can observe the dropped trigger and exit.
        drop(replies);
        pool.shutdown();
    }
}
