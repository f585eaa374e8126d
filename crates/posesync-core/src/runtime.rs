//! Async front end: a session owned by one task, driven by a command queue
//! and a fixed-rate tick.

use crate::anchor::CorrespondenceOutcome;
use crate::error::{Result, SessionError, SyncError};
use crate::monitor::{MetricsSnapshot, SessionSignal};
use crate::registry::ConnectionSpec;
use crate::session::{LocalizedDelta, Session};
use crate::types::{ObjectId, Sequence, StateDelta, TrackedObject, WorldSnapshot};
use chrono::Utc;
use posesync_config::SessionConfig;
use posesync_spatial::{FramedPose, ParticipantId, Pose};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info};

type Reply<T> = oneshot::Sender<T>;

enum Command {
    RegisterObject {
        object_id: ObjectId,
        pose: Pose,
        importance: f64,
        reply: Reply<Result<Sequence>>,
    },
    RemoveObject {
        object_id: ObjectId,
        reply: Reply<Result<TrackedObject>>,
    },
    RegisterConnection {
        spec: ConnectionSpec,
        reply: Reply<Result<()>>,
    },
    UnregisterConnections {
        object_id: ObjectId,
        reply: Reply<Vec<ConnectionSpec>>,
    },
    Join {
        participant: ParticipantId,
        reply: Reply<bool>,
    },
    Leave {
        participant: ParticipantId,
        reply: Reply<Vec<ObjectId>>,
    },
    Heartbeat {
        participant: ParticipantId,
        reply: Reply<()>,
    },
    UpdateCorrespondence {
        participant: ParticipantId,
        local_pose: Pose,
        shared_pose_hint: Pose,
        hint_confidence: f64,
        reply: Reply<Result<CorrespondenceOutcome>>,
    },
    AcquireOwnership {
        participant: ParticipantId,
        object_id: ObjectId,
        reply: Reply<Result<Sequence>>,
    },
    ReleaseOwnership {
        participant: ParticipantId,
        object_id: ObjectId,
        reply: Reply<Result<Sequence>>,
    },
    SubmitUpdate {
        participant: ParticipantId,
        object_id: ObjectId,
        pose: FramedPose,
        client_sequence: Sequence,
        reply: Reply<Result<Sequence>>,
    },
    Localize {
        participant: ParticipantId,
        delta: StateDelta,
        reply: Reply<Result<LocalizedDelta>>,
    },
    Snapshot {
        reply: Reply<WorldSnapshot>,
    },
    Metrics {
        reply: Reply<MetricsSnapshot>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

struct Envelope {
    enqueued_at: Instant,
    command: Command,
}

/// Cloneable handle to a session running in its own task.
///
/// Every call is queued and answered in order by the session task. Once the
/// task has stopped, calls fail with [`SyncError::SessionClosed`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Envelope>,
    deltas: broadcast::Sender<StateDelta>,
    signals: broadcast::Sender<SessionSignal>,
}

/// Start a session task on the current tokio runtime.
pub fn spawn_session(
    config: SessionConfig,
) -> std::result::Result<(SessionHandle, JoinHandle<()>), SessionError> {
    let session = Session::new(config)?;
    let (commands, inbox) = mpsc::channel(session.config().channels.command_capacity);
    let handle = SessionHandle {
        commands,
        deltas: session.delta_sender(),
        signals: session.signal_sender(),
    };
    let task = tokio::spawn(run(session, inbox));
    Ok((handle, task))
}

async fn run(mut session: Session, mut inbox: mpsc::Receiver<Envelope>) {
    info!(
        "Session loop started, ticking every {:?}",
        session.config().tick.period()
    );
    let mut interval = time::interval(session.config().tick.period());
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                session.tick(Utc::now());
            }
            envelope = inbox.recv() => {
                let Some(envelope) = envelope else {
                    debug!("All session handles dropped");
                    break;
                };
                let now = Utc::now();
                let waited = envelope.enqueued_at.elapsed();
                session.record_sync_latency(waited.as_secs_f64() * 1000.0, now);
                if !dispatch(&mut session, envelope.command, now) {
                    break;
                }
            }
        }
    }
    info!("Session loop stopped after {} ticks", session.ticks());
}

/// Execute one command. Returns false when the loop should stop.
///
/// A caller that stopped waiting simply misses its reply.
fn dispatch(session: &mut Session, command: Command, now: chrono::DateTime<Utc>) -> bool {
    match command {
        Command::RegisterObject {
            object_id,
            pose,
            importance,
            reply,
        } => {
            let _ = reply.send(session.register_object(&object_id, pose, importance, now));
        }
        Command::RemoveObject { object_id, reply } => {
            let _ = reply.send(session.remove_object(&object_id, now));
        }
        Command::RegisterConnection { spec, reply } => {
            let _ = reply.send(session.register_connection(spec));
        }
        Command::UnregisterConnections { object_id, reply } => {
            let _ = reply.send(session.unregister_connections(&object_id));
        }
        Command::Join { participant, reply } => {
            let _ = reply.send(session.join(&participant, now));
        }
        Command::Leave { participant, reply } => {
            let _ = reply.send(session.leave(&participant, now));
        }
        Command::Heartbeat { participant, reply } => {
            session.heartbeat(&participant, now);
            let _ = reply.send(());
        }
        Command::UpdateCorrespondence {
            participant,
            local_pose,
            shared_pose_hint,
            hint_confidence,
            reply,
        } => {
            let _ = reply.send(session.update_correspondence(
                &participant,
                &local_pose,
                &shared_pose_hint,
                hint_confidence,
                now,
            ));
        }
        Command::AcquireOwnership {
            participant,
            object_id,
            reply,
        } => {
            let _ = reply.send(session.acquire_ownership(&participant, &object_id, now));
        }
        Command::ReleaseOwnership {
            participant,
            object_id,
            reply,
        } => {
            let _ = reply.send(session.release_ownership(&participant, &object_id, now));
        }
        Command::SubmitUpdate {
            participant,
            object_id,
            pose,
            client_sequence,
            reply,
        } => {
            let _ = reply.send(session.submit_update(
                &participant,
                &object_id,
                pose,
                client_sequence,
                now,
            ));
        }
        Command::Localize {
            participant,
            delta,
            reply,
        } => {
            let _ = reply.send(session.localize(&participant, &delta));
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(session.snapshot());
        }
        Command::Metrics { reply } => {
            let _ = reply.send(session.metrics().clone());
        }
        Command::Shutdown { reply } => {
            let _ = reply.send(());
            return false;
        }
    }
    true
}

impl SessionHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        let envelope = Envelope {
            enqueued_at: Instant::now(),
            command: build(reply),
        };
        self.commands
            .send(envelope)
            .await
            .map_err(|_| SyncError::SessionClosed)?;
        response.await.map_err(|_| SyncError::SessionClosed)
    }

    /// Receive every authoritative delta published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StateDelta> {
        self.deltas.subscribe()
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<SessionSignal> {
        self.signals.subscribe()
    }

    pub async fn register_object(
        &self,
        object_id: impl Into<ObjectId>,
        pose: Pose,
        importance: f64,
    ) -> Result<Sequence> {
        let object_id = object_id.into();
        self.request(|reply| Command::RegisterObject {
            object_id,
            pose,
            importance,
            reply,
        })
        .await?
    }

    pub async fn remove_object(&self, object_id: impl Into<ObjectId>) -> Result<TrackedObject> {
        let object_id = object_id.into();
        self.request(|reply| Command::RemoveObject { object_id, reply })
            .await?
    }

    pub async fn register_connection(&self, spec: ConnectionSpec) -> Result<()> {
        self.request(|reply| Command::RegisterConnection { spec, reply })
            .await?
    }

    pub async fn unregister_connections(
        &self,
        object_id: impl Into<ObjectId>,
    ) -> Result<Vec<ConnectionSpec>> {
        let object_id = object_id.into();
        self.request(|reply| Command::UnregisterConnections { object_id, reply })
            .await
    }

    pub async fn join(&self, participant: impl Into<ParticipantId>) -> Result<bool> {
        let participant = participant.into();
        self.request(|reply| Command::Join { participant, reply })
            .await
    }

    pub async fn leave(&self, participant: impl Into<ParticipantId>) -> Result<Vec<ObjectId>> {
        let participant = participant.into();
        self.request(|reply| Command::Leave { participant, reply })
            .await
    }

    pub async fn heartbeat(&self, participant: impl Into<ParticipantId>) -> Result<()> {
        let participant = participant.into();
        self.request(|reply| Command::Heartbeat { participant, reply })
            .await
    }

    pub async fn update_correspondence(
        &self,
        participant: impl Into<ParticipantId>,
        local_pose: Pose,
        shared_pose_hint: Pose,
        hint_confidence: f64,
    ) -> Result<CorrespondenceOutcome> {
        let participant = participant.into();
        self.request(|reply| Command::UpdateCorrespondence {
            participant,
            local_pose,
            shared_pose_hint,
            hint_confidence,
            reply,
        })
        .await?
    }

    pub async fn acquire_ownership(
        &self,
        participant: impl Into<ParticipantId>,
        object_id: impl Into<ObjectId>,
    ) -> Result<Sequence> {
        let participant = participant.into();
        let object_id = object_id.into();
        self.request(|reply| Command::AcquireOwnership {
            participant,
            object_id,
            reply,
        })
        .await?
    }

    pub async fn release_ownership(
        &self,
        participant: impl Into<ParticipantId>,
        object_id: impl Into<ObjectId>,
    ) -> Result<Sequence> {
        let participant = participant.into();
        let object_id = object_id.into();
        self.request(|reply| Command::ReleaseOwnership {
            participant,
            object_id,
            reply,
        })
        .await?
    }

    pub async fn submit_update(
        &self,
        participant: impl Into<ParticipantId>,
        object_id: impl Into<ObjectId>,
        pose: FramedPose,
        client_sequence: Sequence,
    ) -> Result<Sequence> {
        let participant = participant.into();
        let object_id = object_id.into();
        self.request(|reply| Command::SubmitUpdate {
            participant,
            object_id,
            pose,
            client_sequence,
            reply,
        })
        .await?
    }

    pub async fn localize(
        &self,
        participant: impl Into<ParticipantId>,
        delta: StateDelta,
    ) -> Result<LocalizedDelta> {
        let participant = participant.into();
        self.request(|reply| Command::Localize {
            participant,
            delta,
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self) -> Result<WorldSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn metrics(&self) -> Result<MetricsSnapshot> {
        self.request(|reply| Command::Metrics { reply }).await
    }

    /// Stop the session task after everything queued before this call.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
