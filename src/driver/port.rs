//! Per-Port Session Driver
//!
//! Runs one discovery session to completion: submits each request the stack
//! suspends on, awaits its completion under the request timeout, and resumes
//! the stack. The registry lock is only taken for the synchronous span of a
//! single `push`/`resume`, never across an `.await`.

use crate::discovery::context::{Advisory, Context, IoRequest, RequestKind, SessionState};
use crate::discovery::quirks::QuirkAction;
use crate::discovery::session::DiscoverySession;
use crate::discovery::stack::{Machine, MachineStack, StackStatus};
use crate::domain::ports::{Completion, IoSubmitterRef, PendingRequest, RequestOutcome, SessionReport};
use crate::error::{Error, Result};
use crate::metrics::DiscoveryMetrics;
use crate::topology::registry::TargetRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives discovery sessions for a single port
pub struct PortDiscovery {
    registry: Arc<Mutex<TargetRegistry>>,
    submitter: IoSubmitterRef,
    metrics: Arc<DiscoveryMetrics>,
}

impl PortDiscovery {
    pub fn new(registry: Arc<Mutex<TargetRegistry>>, submitter: IoSubmitterRef, metrics: Arc<DiscoveryMetrics>) -> Self {
        Self {
            registry,
            submitter,
            metrics,
        }
    }

    /// Run a session until it commits, fails, or `cancel` fires
    pub async fn run(&self, mut session: SessionState, cancel: CancellationToken) -> Result<SessionReport> {
        let port = session.port_id();
        let started = Instant::now();
        self.metrics.sessions_started.inc();

        let mut stack = MachineStack::new(session.config.max_stack_depth);
        let mut status = {
            let mut registry = self.registry.lock();
            let mut cx = Context::new(&mut registry, &mut session);
            stack.push(&mut cx, Machine::Discovery(DiscoverySession::new()))
        };

        let result = loop {
            let request = match status {
                StackStatus::Suspended(request) => request,
                StackStatus::Complete(result) => break result,
            };

            let completion = match self.execute(&mut session, request, &cancel).await {
                Ok(Some(completion)) => completion,
                Ok(None) => {
                    info!(port = %port, "discovery cancelled");
                    break Err(self.abort(&mut stack, &mut session, Error::SessionAborted { port: port.to_string() }).await);
                }
                Err(e) => {
                    warn!(port = %port, request = request.name(), error = %e, "request submission failed");
                    break Err(self.abort(&mut stack, &mut session, e).await);
                }
            };

            status = {
                let mut registry = self.registry.lock();
                let mut cx = Context::new(&mut registry, &mut session);
                stack.resume(&mut cx, completion)
            };
        };

        self.metrics.session_duration.observe(started.elapsed().as_secs_f64());
        match result {
            Ok(_) => {
                self.metrics.sessions_completed.inc();
                session
                    .report
                    .take()
                    .ok_or_else(|| Error::Internal("session committed without a report".into()))
            }
            Err(e) => {
                self.metrics.sessions_failed.inc();
                warn!(port = %port, error = %e, "discovery session failed");
                Err(e)
            }
        }
    }

    /// Tear the stack down and cancel whatever was still in flight
    async fn abort(&self, stack: &mut MachineStack, session: &mut SessionState, error: Error) -> Error {
        let in_flight = {
            let mut registry = self.registry.lock();
            let mut cx = Context::new(&mut registry, session);
            stack.abort(&mut cx)
        };
        if let Some(handle) = in_flight {
            self.submitter.cancel(handle).await;
        }
        error
    }

    async fn submit(&self, request: &IoRequest) -> Result<PendingRequest> {
        self.metrics.record_request(request.name());
        match request.kind {
            RequestKind::Management(op) => self.submitter.submit_management_request(&request.target, op).await,
            RequestKind::Protocol(command, direction) => {
                self.submitter
                    .submit_protocol_request(&request.target, command, direction)
                    .await
            }
        }
    }

    /// Submit one request and wait for its completion. Timeouts come back as
    /// an ordinary `TimedOut` completion; `None` means the session was
    /// cancelled.
    async fn execute(
        &self,
        session: &mut SessionState,
        request: IoRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<Completion>> {
        let timeout = session.config.request_timeout();
        loop {
            let PendingRequest { handle, completion } = self.submit(&request).await?;
            session.request_handle = Some(handle);

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                outcome = tokio::time::timeout(timeout, completion) => match outcome {
                    Ok(Ok(completion)) => return Ok(Some(completion)),
                    Ok(Err(_)) => {
                        debug!(request = request.name(), %handle, "completion channel dropped");
                        return Ok(Some(Completion::failed(RequestOutcome::Aborted)));
                    }
                    Err(_) => {
                        self.metrics.request_timeouts.inc();
                        self.submitter.cancel(handle).await;
                        session.request_handle = None;
                        if !self.quirk_retry(session, &request) {
                            debug!(request = request.name(), address = %request.target.address, "request timed out");
                            return Ok(Some(Completion::timed_out()));
                        }
                        self.submitter.relink(&request.target).await?;
                    }
                },
            }
        }
    }

    /// Ask the session's quirk hooks whether a timed-out request deserves
    /// another attempt
    fn quirk_retry(&self, session: &mut SessionState, request: &IoRequest) -> bool {
        if session.quirks.is_empty() || session.quirk_retries >= session.config.max_quirk_retries {
            return false;
        }
        let quirk = {
            let registry = self.registry.lock();
            let Some(target) = registry.get(request.handle) else {
                return false;
            };
            session
                .quirks
                .iter()
                .find(|q| q.on_timeout(&registry, target) == QuirkAction::RelinkAndRetry)
                .map(|q| q.name())
        };
        let Some(quirk) = quirk else {
            return false;
        };

        session.quirk_retries += 1;
        self.metrics.quirk_retries.inc();
        let advisory = Advisory::QuirkRetry {
            address: request.target.address,
            quirk: quirk.to_string(),
        };
        warn!(port = %session.port_id(), "{}", advisory);
        session.advisories.push(advisory);
        true
    }
}
