use meshroom_protocol::RoomId;
use tokio::sync::{mpsc, oneshot, watch};

use super::session::{RoomSession, RoomSnapshot};
use crate::error::{Result, RoomError};
use crate::network::Credentials;

const COMMAND_CAPACITY: usize = 32;

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    ConnectTransport {
        credentials: Credentials,
        reply: Reply<()>,
    },
    Join {
        room: RoomId,
        reply: Reply<()>,
    },
    Leave {
        reply: Reply<()>,
    },
    SetAudio {
        enabled: bool,
        reply: Reply<()>,
    },
    SetVideo {
        enabled: bool,
        reply: Reply<()>,
    },
    StartScreenShare {
        reply: Reply<()>,
    },
    StopScreenShare {
        reply: Reply<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front for a [`RoomSession`] running on its own task
#[derive(Clone)]
pub struct RoomHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<RoomSnapshot>,
}

impl RoomHandle {
    /// Move `session` onto a new task and return a handle to it
    pub fn spawn(session: RoomSession) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
        let snapshot = session.subscribe();
        tokio::spawn(run(session, rx));
        Self { commands, snapshot }
    }

    pub async fn connect_transport(&self, credentials: Credentials) -> Result<()> {
        self.request(|reply| Command::ConnectTransport { credentials, reply })
            .await
    }

    pub async fn join(&self, room: RoomId) -> Result<()> {
        self.request(|reply| Command::Join { room, reply }).await
    }

    pub async fn leave(&self) -> Result<()> {
        self.request(|reply| Command::Leave { reply }).await
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::SetAudio { enabled, reply })
            .await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::SetVideo { enabled, reply })
            .await
    }

    pub async fn start_screen_share(&self) -> Result<()> {
        self.request(|reply| Command::StartScreenShare { reply })
            .await
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        self.request(|reply| Command::StopScreenShare { reply })
            .await
    }

    /// Latest published state
    pub fn snapshot(&self) -> RoomSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RoomSnapshot> {
        self.snapshot.clone()
    }

    /// Leave, close the transport and stop the task. Returns once the
    /// session has been torn down.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = done.await;
        }
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| RoomError::Closed)?;
        rx.await.map_err(|_| RoomError::Closed)?
    }
}

async fn run(mut session: RoomSession, mut commands: mpsc::Receiver<Command>) {
    tracing::debug!("Room task started");
    // Join callers answered once the devices respond
    let mut joins: Vec<Reply<()>> = Vec::new();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Shutdown { reply }) => {
                    session.close().await;
                    settle_joins(&mut session, &mut joins);
                    let _ = reply.send(());
                    break;
                }
                Some(command) => execute(&mut session, command, &mut joins).await,
                None => {
                    session.close().await;
                    break;
                }
            },
            Some(input) = session.next_input() => session.dispatch(input).await,
        }
        settle_joins(&mut session, &mut joins);
    }
    tracing::debug!("Room task stopped");
}

fn settle_joins(session: &mut RoomSession, joins: &mut Vec<Reply<()>>) {
    if joins.is_empty() || session.is_acquiring_media() {
        return;
    }
    let outcome = session.take_join_outcome().unwrap_or(Ok(()));
    for reply in joins.drain(..) {
        let _ = reply.send(outcome.clone());
    }
}

async fn execute(session: &mut RoomSession, command: Command, joins: &mut Vec<Reply<()>>) {
    // A caller that stopped waiting does not stop the operation
    match command {
        Command::ConnectTransport { credentials, reply } => {
            let _ = reply.send(session.connect_transport(&credentials).await);
        }
        Command::Join { room, reply } => {
            let result = session.join(room).await;
            if result.is_ok() && session.is_acquiring_media() {
                joins.push(reply);
            } else {
                let _ = reply.send(result);
            }
        }
        Command::Leave { reply } => {
            let _ = reply.send(session.leave().await);
        }
        Command::SetAudio { enabled, reply } => {
            let _ = reply.send(session.set_audio_enabled(enabled).await);
        }
        Command::SetVideo { enabled, reply } => {
            let _ = reply.send(session.set_video_enabled(enabled).await);
        }
        Command::StartScreenShare { reply } => {
            let _ = reply.send(session.start_screen_share().await);
        }
        Command::StopScreenShare { reply } => {
            let _ = reply.send(session.stop_screen_share().await);
        }
        Command::Shutdown { reply } => {
            session.close().await;
            let _ = reply.send(());
        }
    }
}
