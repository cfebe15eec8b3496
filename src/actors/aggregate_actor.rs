//! Actor loop that owns one aggregate instance.
//!
//! The loop runs as a tokio task and is the only code that touches the
//! aggregate's coordinator, which makes it the single writer of the
//! aggregate's event stream. Three sources feed it:
//!
//! - the mailbox (commands, envelopes, state queries) from the registry,
//! - completions of asynchronous handlers, piped back to the loop,
//! - the idle timer, armed only while no asynchronous work is outstanding
//!   and no envelope waits in the gap queue.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{CommandError, EnvelopeError};
use crate::event_sourcing::{Aggregate, Decision};
use crate::metrics::Metrics;
use crate::replication::{
    CoordinatorSettings, EnvelopeReply, EventEnvelope, ReplicationCoordinator, ReplicationRole,
};

/// Result type sent back through the `Execute` reply channel.
pub type CommandResult<A> =
    Result<<A as Aggregate>::Reply, CommandError<<A as Aggregate>::Error>>;

/// Point-in-time view of an aggregate instance.
#[derive(Debug, Clone)]
pub struct AggregateSnapshot<A> {
    pub state: A,
    pub last_sequence: u64,
    pub role: ReplicationRole,
}

/// Messages sent from the registry to the actor loop.
pub(crate) enum AggregateMessage<A: Aggregate> {
    Execute {
        command: A::Command,
        reply: oneshot::Sender<CommandResult<A>>,
    },
    Replicate {
        envelope: EventEnvelope,
        reply: EnvelopeReply,
    },
    GetState {
        reply: oneshot::Sender<AggregateSnapshot<A>>,
    },
}

/// Everything the loop needs to start.
pub(crate) struct ActorSetup<A: Aggregate> {
    pub id: String,
    pub settings: CoordinatorSettings<A>,
    pub idle_timeout: Duration,
    /// Termination signal of the previous activation of the same identity.
    pub predecessor: Option<watch::Receiver<bool>>,
    pub terminated: watch::Sender<bool>,
    /// Called last, once the instance is fully stopped.
    pub on_terminated: Box<dyn FnOnce() + Send>,
}

struct Completion<A: Aggregate> {
    ticket: u64,
    computed: Result<Vec<A::Event>, A::Error>,
}

struct InFlight<A: Aggregate> {
    handler: usize,
    command: A::Command,
    reply: oneshot::Sender<CommandResult<A>>,
    started: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum StopReason {
    Idle,
    Failure,
    Closed,
}

impl StopReason {
    fn as_str(self) -> &'static str {
        match self {
            StopReason::Idle => "idle",
            StopReason::Failure => "failure",
            StopReason::Closed => "closed",
        }
    }
}

struct Actor<A: Aggregate> {
    coordinator: ReplicationCoordinator<A>,
    rx: mpsc::Receiver<AggregateMessage<A>>,
    done_rx: mpsc::UnboundedReceiver<Completion<A>>,
    in_flight: HashMap<u64, InFlight<A>>,
    next_ticket: u64,
    completions: mpsc::UnboundedSender<Completion<A>>,
    metrics: Arc<Metrics>,
}

pub(crate) async fn run_aggregate<A: Aggregate>(
    setup: ActorSetup<A>,
    mut rx: mpsc::Receiver<AggregateMessage<A>>,
) {
    let ActorSetup {
        id,
        settings,
        idle_timeout,
        predecessor,
        terminated,
        on_terminated,
    } = setup;
    let metrics = settings.metrics.clone();

    // A passivating predecessor may still be appending; wait it out.
    if let Some(mut previous) = predecessor {
        let _ = previous.wait_for(|done| *done).await;
    }

    metrics.activations.with_label_values(&[A::AGGREGATE_TYPE]).inc();
    metrics.active_aggregates.inc();

    let reason = match start::<A>(&id, settings).await {
        Ok(coordinator) => {
            let (completions, done_rx) = mpsc::unbounded_channel();
            let mut actor = Actor {
                coordinator,
                rx,
                done_rx,
                in_flight: HashMap::new(),
                next_ticket: 0,
                completions,
                metrics: metrics.clone(),
            };
            let reason = actor.run(idle_timeout).await;
            actor.shutdown(reason).await;
            reason
        }
        Err(message) => {
            tracing::error!(
                aggregate_type = A::AGGREGATE_TYPE,
                aggregate_id = %id,
                error = %message,
                "❌ Aggregate failed to start"
            );
            refuse_all(&mut rx, &message).await;
            StopReason::Failure
        }
    };

    metrics
        .passivations
        .with_label_values(&[A::AGGREGATE_TYPE, reason.as_str()])
        .inc();
    metrics.active_aggregates.dec();

    tracing::debug!(
        aggregate_type = A::AGGREGATE_TYPE,
        aggregate_id = %id,
        reason = reason.as_str(),
        "Aggregate instance stopped"
    );

    let _ = terminated.send(true);
    on_terminated();
}

/// Recover, then migrate legacy history before any message is processed.
/// Messages arriving meanwhile wait in the mailbox.
async fn start<A: Aggregate>(
    id: &str,
    settings: CoordinatorSettings<A>,
) -> Result<ReplicationCoordinator<A>, String> {
    let mut coordinator = ReplicationCoordinator::recover(id, settings)
        .await
        .map_err(|e| e.to_string())?;
    coordinator.migrate_legacy().await.map_err(|e| e.to_string())?;
    Ok(coordinator)
}

/// Close the mailbox and fail everything in it.
async fn refuse_all<A: Aggregate>(rx: &mut mpsc::Receiver<AggregateMessage<A>>, message: &str) {
    rx.close();
    while let Some(msg) = rx.recv().await {
        match msg {
            AggregateMessage::Execute { reply, .. } => {
                let _ = reply.send(Err(CommandError::Recovery(message.to_string())));
            }
            AggregateMessage::Replicate { reply, .. } => {
                let _ = reply.send(Err(EnvelopeError::Recovery(message.to_string())));
            }
            // The receiver sees a closed channel.
            AggregateMessage::GetState { .. } => {}
        }
    }
}

impl<A: Aggregate> Actor<A> {
    async fn run(&mut self, idle_timeout: Duration) -> StopReason {
        loop {
            let idle = self.in_flight.is_empty() && self.coordinator.queued_envelopes() == 0;
            tokio::select! {
                biased;

                Some(done) = self.done_rx.recv() => {
                    if self.on_completion(done).await.is_break() {
                        return StopReason::Failure;
                    }
                }

                msg = self.rx.recv() => match msg {
                    Some(msg) => {
                        if self.on_message(msg).await.is_break() {
                            return StopReason::Failure;
                        }
                    }
                    // Every sender is gone (registry dropped).
                    None => return StopReason::Closed,
                },

                _ = tokio::time::sleep(idle_timeout), if idle => {
                    tracing::info!(
                        aggregate_type = A::AGGREGATE_TYPE,
                        aggregate_id = %self.coordinator.id(),
                        "💤 Aggregate idle, passivating"
                    );
                    return StopReason::Idle;
                }
            }
        }
    }

    /// Stop accepting messages, then settle what is already queued.
    ///
    /// After a clean stop, queued messages and outstanding computations are
    /// still handled. After a failure they are refused.
    async fn shutdown(&mut self, reason: StopReason) {
        self.rx.close();

        let mut failed = reason == StopReason::Failure;
        if !failed {
            while let Some(msg) = self.rx.recv().await {
                if self.on_message(msg).await.is_break() {
                    failed = true;
                    break;
                }
            }
        }
        while !failed && !self.in_flight.is_empty() {
            let Some(done) = self.done_rx.recv().await else {
                break;
            };
            failed = self.on_completion(done).await.is_break();
        }
        if !failed {
            return;
        }

        while let Some(msg) = self.rx.recv().await {
            match msg {
                AggregateMessage::Execute { reply, .. } => {
                    let _ = reply.send(Err(CommandError::ActorGone));
                }
                AggregateMessage::Replicate { reply, .. } => {
                    let _ = reply.send(Err(EnvelopeError::ActorGone));
                }
                AggregateMessage::GetState { .. } => {}
            }
        }
        // Outstanding computations are abandoned; callers re-issue commands.
        for (_, in_flight) in self.in_flight.drain() {
            let _ = in_flight.reply.send(Err(CommandError::ActorGone));
        }
    }

    async fn on_message(&mut self, msg: AggregateMessage<A>) -> ControlFlow<()> {
        match msg {
            AggregateMessage::Execute { command, reply } => self.on_command(command, reply).await,
            AggregateMessage::Replicate { envelope, reply } => {
                let flow = self.coordinator.handle_envelope(envelope, reply).await;
                if flow.is_break() {
                    self.rx.close();
                }
                flow
            }
            AggregateMessage::GetState { reply } => {
                let _ = reply.send(AggregateSnapshot {
                    state: self.coordinator.state().clone(),
                    last_sequence: self.coordinator.last_sequence(),
                    role: self.coordinator.role().clone(),
                });
                ControlFlow::Continue(())
            }
        }
    }

    async fn on_command(
        &mut self,
        command: A::Command,
        reply: oneshot::Sender<CommandResult<A>>,
    ) -> ControlFlow<()> {
        let started = Instant::now();

        let decision = self
            .coordinator
            .admit(&command)
            .and_then(|handler| Ok((handler, self.coordinator.decide(handler, &command)?)));

        match decision {
            Err(err) => {
                self.finish(started, Err(err), reply);
                ControlFlow::Continue(())
            }
            Ok((_, Decision::Reply(answer))) => {
                self.finish(started, Ok(answer), reply);
                ControlFlow::Continue(())
            }
            Ok((handler, Decision::Persist(events))) => {
                self.persist_and_reply(handler, command, events, reply, started).await
            }
            Ok((handler, Decision::Deferred(pending))) => {
                let ticket = self.next_ticket;
                self.next_ticket += 1;
                self.in_flight.insert(
                    ticket,
                    InFlight {
                        handler,
                        command,
                        reply,
                        started,
                    },
                );

                let completions = self.completions.clone();
                tokio::spawn(async move {
                    let computed = pending.await;
                    // The actor may be gone; the command is then abandoned.
                    let _ = completions.send(Completion { ticket, computed });
                });

                tracing::debug!(
                    aggregate_id = %self.coordinator.id(),
                    ticket,
                    in_flight = self.in_flight.len(),
                    "Started asynchronous command"
                );
                ControlFlow::Continue(())
            }
        }
    }

    async fn on_completion(&mut self, done: Completion<A>) -> ControlFlow<()> {
        let Some(InFlight {
            handler,
            command,
            reply,
            started,
        }) = self.in_flight.remove(&done.ticket)
        else {
            return ControlFlow::Continue(());
        };

        match self.coordinator.complete(handler, &command, done.computed) {
            Err(err) => {
                self.finish(started, Err(err), reply);
                ControlFlow::Continue(())
            }
            Ok(Decision::Persist(events)) => {
                self.persist_and_reply(handler, command, events, reply, started).await
            }
            Ok(Decision::Reply(answer)) => {
                self.finish(started, Ok(answer), reply);
                ControlFlow::Continue(())
            }
            Ok(Decision::Deferred(_)) => {
                self.finish(
                    started,
                    Err(CommandError::InvariantViolation(
                        "completion produced another deferred computation".to_string(),
                    )),
                    reply,
                );
                ControlFlow::Continue(())
            }
        }
    }

    async fn persist_and_reply(
        &mut self,
        handler: usize,
        command: A::Command,
        events: Vec<A::Event>,
        reply: oneshot::Sender<CommandResult<A>>,
        started: Instant,
    ) -> ControlFlow<()> {
        match self.coordinator.persist(&events).await {
            Ok(sequence) => {
                tracing::debug!(
                    aggregate_id = %self.coordinator.id(),
                    sequence,
                    events = events.len(),
                    "✅ Events persisted"
                );
                let answer = self.coordinator.reply(handler, &command, &events);
                self.finish(started, answer, reply);
                ControlFlow::Continue(())
            }
            Err(CommandError::Persistence(err)) => {
                tracing::error!(
                    aggregate_id = %self.coordinator.id(),
                    error = %err,
                    "❌ Persisting events failed, stopping aggregate"
                );
                // Later messages go to the next activation.
                self.rx.close();
                self.finish(started, Err(CommandError::Persistence(err)), reply);
                ControlFlow::Break(())
            }
            Err(err) => {
                self.finish(started, Err(err), reply);
                ControlFlow::Continue(())
            }
        }
    }

    fn finish(
        &self,
        started: Instant,
        result: CommandResult<A>,
        reply: oneshot::Sender<CommandResult<A>>,
    ) {
        let outcome = match &result {
            Ok(_) => "ok",
            Err(CommandError::Rejected(_)) => "rejected",
            Err(CommandError::Persistence(_)) => "persistence_failed",
            Err(_) => "refused",
        };
        self.metrics
            .record_command(A::AGGREGATE_TYPE, outcome, started.elapsed().as_secs_f64());

        // The sender may have given up waiting.
        let _ = reply.send(result);
    }
}
