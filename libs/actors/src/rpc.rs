//! RPC Correlation Table
//!
//! Every outbound request gets an `rpc_id` and an entry in the pending table.
//! Several paths race to complete an entry:
//!
//! - the matching response arrives
//! - the caller's timeout fires
//! - the caller's cancellation token fires
//! - the periodic sweeper finds the deadline passed
//! - `fail_process` is told the target process is gone, normally by the
//!   disconnect watcher fed from the transport
//!
//! Each path completes the call only through [`RpcSender::complete`], which
//! removes the entry under the table lock. Whoever removes it sends the result;
//! everyone else finds nothing and does nothing, so each call completes
//! exactly once.

use crate::codec::{decode_payload, encode_payload};
use crate::transport::Outbound;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strand_types::{
    ActorId, ActorMessage, ActorRequest, CoreError, Envelope, ErrorCode, RawResponse, Result,
};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Deadline used when a timeout does not fit in an `Instant`, about 30 years
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the sender's default timeout
    pub timeout: Option<Duration>,
    /// Completes the call with `RpcCancelled` when triggered
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            timeout: None,
            cancel: Some(cancel),
        }
    }
}

struct PendingRpc {
    opcode: u16,
    target: ActorId,
    deadline: Instant,
    started: Instant,
    completion: oneshot::Sender<RawResponse>,
}

/// RPC counters
#[derive(Debug, Default)]
pub struct RpcMetrics {
    pub calls: AtomicU64,
    pub responses: AtomicU64,
    pub timeouts: AtomicU64,
    pub cancellations: AtomicU64,
    pub send_failures: AtomicU64,
    pub peer_failures: AtomicU64,
    pub late_responses: AtomicU64,
    pub abandoned: AtomicU64,
    pub total_latency_ns: AtomicU64,
}

impl RpcMetrics {
    pub fn avg_latency_ns(&self) -> f64 {
        let responses = self.responses.load(Ordering::Relaxed);
        if responses == 0 {
            return 0.0;
        }
        self.total_latency_ns.load(Ordering::Relaxed) as f64 / responses as f64
    }

    pub fn get_stats(&self) -> RpcStats {
        RpcStats {
            calls: self.calls.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            peer_failures: self.peer_failures.load(Ordering::Relaxed),
            late_responses: self.late_responses.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// RPC statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcStats {
    pub calls: u64,
    pub responses: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub send_failures: u64,
    pub peer_failures: u64,
    pub late_responses: u64,
    pub abandoned: u64,
}

struct RpcInner {
    next_id: AtomicI32,
    pending: Mutex<HashMap<i32, PendingRpc>>,
    default_timeout: Duration,
    outbound: Outbound,
    metrics: RpcMetrics,
}

/// Caller side of request/response traffic for one fiber
#[derive(Clone)]
pub struct RpcSender {
    inner: Arc<RpcInner>,
}

impl std::fmt::Debug for RpcSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSender")
            .field("pending", &self.pending_count())
            .field("default_timeout", &self.inner.default_timeout)
            .finish()
    }
}

/// Removes the entry if the calling future is dropped before completion
struct PendingGuard<'a> {
    sender: &'a RpcSender,
    rpc_id: i32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.sender.inner.pending.lock().remove(&self.rpc_id).is_some() {
            self.sender.inner.metrics.abandoned.fetch_add(1, Ordering::Relaxed);
            debug!(rpc_id = self.rpc_id, "Pending RPC abandoned by caller");
        }
    }
}

impl RpcSender {
    pub fn new(outbound: Outbound, default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RpcInner {
                next_id: AtomicI32::new(0),
                pending: Mutex::new(HashMap::new()),
                default_timeout,
                outbound,
                metrics: RpcMetrics::default(),
            }),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    pub fn metrics(&self) -> &RpcMetrics {
        &self.inner.metrics
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Next id from the wrapping counter, never 0
    fn next_rpc_id(&self) -> i32 {
        loop {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Typed request/response call
    pub async fn call<R: ActorRequest>(
        &self,
        target: ActorId,
        request: &R,
        options: CallOptions,
    ) -> Result<R::Response> {
        let payload = encode_payload(request)?;
        let timeout = options.timeout.unwrap_or(self.inner.default_timeout);
        let response = self.call_raw(target, R::OPCODE, payload, options).await;

        if response.is_success() {
            return decode_payload(&response.payload);
        }
        Err(match response.error_code() {
            Some(ErrorCode::RpcTimeout) => CoreError::RpcTimeout {
                rpc_id: response.rpc_id,
                timeout_ms: timeout.as_millis() as u64,
            },
            Some(ErrorCode::PeerDisconnected) => CoreError::PeerDisconnected {
                process: target.process(),
            },
            _ => CoreError::from_response(response.rpc_id, response.error, response.text),
        })
    }

    /// Untyped call; failures come back as error codes on the response
    pub async fn call_raw(
        &self,
        target: ActorId,
        opcode: u16,
        payload: Bytes,
        options: CallOptions,
    ) -> RawResponse {
        let timeout = options.timeout.unwrap_or(self.inner.default_timeout);
        let started = Instant::now();
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + FAR_FUTURE);
        let (completion, mut rx) = oneshot::channel();

        let rpc_id = {
            let mut pending = self.inner.pending.lock();
            let rpc_id = loop {
                let id = self.next_rpc_id();
                if !pending.contains_key(&id) {
                    break id;
                }
                warn!(rpc_id = id, "RPC id still pending after counter wrap, skipping");
            };
            pending.insert(
                rpc_id,
                PendingRpc {
                    opcode,
                    target,
                    deadline,
                    started,
                    completion,
                },
            );
            rpc_id
        };
        let _guard = PendingGuard {
            sender: self,
            rpc_id,
        };
        self.inner.metrics.calls.fetch_add(1, Ordering::Relaxed);

        let envelope = Envelope::request(target, opcode, rpc_id, payload);
        if let Err(e) = self.inner.outbound.send(&envelope).await {
            warn!(rpc_id = rpc_id, %target, opcode = opcode, error = %e, "RPC send failed");
            if self.complete(rpc_id, RawResponse::failure(rpc_id, ErrorCode::RpcFail, e.to_string())) {
                self.inner.metrics.send_failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        let cancel = options.cancel.unwrap_or_default();
        tokio::select! {
            biased;
            result = &mut rx => {
                return result.unwrap_or_else(|_| {
                    RawResponse::failure(rpc_id, ErrorCode::RpcFail, "completion dropped")
                });
            }
            _ = tokio::time::sleep_until(deadline) => {
                if self.complete(
                    rpc_id,
                    RawResponse::failure(rpc_id, ErrorCode::RpcTimeout, format!("timed out after {:?}", timeout)),
                ) {
                    self.inner.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                    debug!(rpc_id = rpc_id, %target, opcode = opcode, "RPC timed out");
                }
            }
            _ = cancel.cancelled() => {
                if self.complete(rpc_id, RawResponse::failure(rpc_id, ErrorCode::RpcCancelled, "cancelled")) {
                    self.inner.metrics.cancellations.fetch_add(1, Ordering::Relaxed);
                    debug!(rpc_id = rpc_id, %target, opcode = opcode, "RPC cancelled");
                }
            }
        }

        // The winning path has already sent on the completion channel
        rx.await.unwrap_or_else(|_| RawResponse::failure(rpc_id, ErrorCode::RpcFail, "completion dropped"))
    }

    /// Fire-and-forget message
    pub async fn send<M: ActorMessage>(&self, target: ActorId, message: &M) -> Result<()> {
        let payload = encode_payload(message)?;
        self.inner
            .outbound
            .send(&Envelope::message(target, M::OPCODE, payload))
            .await
    }

    /// Complete `rpc_id` if it is still pending
    ///
    /// Returns `false` when another path already completed the call.
    pub fn complete(&self, rpc_id: i32, response: RawResponse) -> bool {
        let entry = self.inner.pending.lock().remove(&rpc_id);
        match entry {
            Some(pending) => {
                let _ = pending.completion.send(response);
                true
            }
            None => false,
        }
    }

    /// Route an inbound response to its pending call
    pub fn on_response(&self, response: RawResponse) {
        let rpc_id = response.rpc_id;
        let entry = self.inner.pending.lock().remove(&rpc_id);
        match entry {
            Some(pending) => {
                let elapsed = pending.started.elapsed();
                self.inner.metrics.responses.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .metrics
                    .total_latency_ns
                    .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
                debug!(
                    rpc_id = rpc_id,
                    request_opcode = pending.opcode,
                    response_opcode = response.opcode,
                    latency_us = elapsed.as_micros() as u64,
                    "RPC response received"
                );
                let _ = pending.completion.send(response);
            }
            None => {
                self.inner.metrics.late_responses.fetch_add(1, Ordering::Relaxed);
                debug!(rpc_id = rpc_id, "Response for unknown or completed RPC dropped");
            }
        }
    }

    /// Fail every call whose deadline is at or before `now`
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<(i32, PendingRpc)> = {
            let mut pending = self.inner.pending.lock();
            let ids: Vec<i32> = pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        for (rpc_id, pending) in &expired {
            warn!(
                rpc_id = *rpc_id,
                target = %pending.target,
                opcode = pending.opcode,
                "RPC deadline passed, failing call"
            );
        }
        let count = expired.len();
        for (rpc_id, pending) in expired {
            let _ = pending.completion.send(RawResponse::failure(
                rpc_id,
                ErrorCode::RpcTimeout,
                "deadline passed",
            ));
        }
        self.inner.metrics.timeouts.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Fail every call addressed to `process`
    pub fn fail_process(&self, process: u16) -> usize {
        let failed: Vec<(i32, PendingRpc)> = {
            let mut pending = self.inner.pending.lock();
            let ids: Vec<i32> = pending
                .iter()
                .filter(|(_, p)| p.target.process() == process)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        let count = failed.len();
        for (rpc_id, pending) in failed {
            let _ = pending.completion.send(RawResponse::failure(
                rpc_id,
                ErrorCode::PeerDisconnected,
                format!("process {} disconnected", process),
            ));
        }
        if count > 0 {
            info!(process = process, failed = count, "Failed pending RPCs for disconnected process");
        }
        self.inner.metrics.peer_failures.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Fail pending calls for every process reported on `lost`
    pub fn spawn_disconnect_watcher(
        &self,
        mut lost: broadcast::Receiver<u16>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let sender = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = lost.recv() => match next {
                        Ok(process) => {
                            sender.fail_process(process);
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed = missed, "Disconnect notifications lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("RPC disconnect watcher stopped");
        })
    }

    /// Periodically sweep expired calls until `shutdown` fires
    pub fn spawn_sweeper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let sender = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        sender.sweep_expired(Instant::now());
                    }
                }
            }
            debug!("RPC sweeper stopped");
        })
    }
}
