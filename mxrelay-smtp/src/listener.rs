use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use mxrelay_common::{
    Signal,
    error::{ListenerError, SessionError},
    handler::EnvelopeHandler,
    internal, tracing,
};
use tokio::{
    net::TcpListener,
    sync::broadcast::{self, error::RecvError},
    task::{JoinError, JoinSet},
};

use crate::session::{Session, SessionConfig};

/// How long in-flight sessions may run on after a shutdown signal.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Back off after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Listener {
    listener: TcpListener,
    handler: Arc<dyn EnvelopeHandler>,
    config: SessionConfig,
    shutdown_grace: Duration,
}

impl Listener {
    /// Binds `socket`, ready to [`serve`](Self::serve).
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::BindFailed`] if the socket cannot be bound.
    pub async fn bind(
        socket: SocketAddr,
        handler: Arc<dyn EnvelopeHandler>,
        config: SessionConfig,
    ) -> Result<Self, ListenerError> {
        let listener =
            TcpListener::bind(socket)
                .await
                .map_err(|source| ListenerError::BindFailed {
                    address: socket.to_string(),
                    source,
                })?;

        Ok(Self {
            listener,
            handler,
            config,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        })
    }

    #[must_use]
    pub const fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    /// The address actually bound, useful when binding port 0.
    ///
    /// # Errors
    ///
    /// Propagates the error from the underlying socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until a [`Signal::Shutdown`] arrives, one task per session.
    ///
    /// On shutdown no further connections are accepted. Sessions still running
    /// after the grace period are aborted.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) {
        let socket = self
            .listener
            .local_addr()
            .map_or_else(|_| String::from("<unknown>"), |addr| addr.to_string());
        internal!(level = INFO, "Serving SMTP on {socket}");

        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                sig = shutdown.recv() => match sig {
                    Ok(Signal::Shutdown) | Err(RecvError::Closed) => {
                        internal!(
                            level = INFO,
                            "SMTP Listener {socket} received shutdown signal, finishing {} session(s) ...",
                            sessions.len()
                        );
                        break;
                    }
                    Err(RecvError::Lagged(_)) => {}
                },

                connection = self.listener.accept() => match connection {
                    Ok((stream, peer)) => {
                        tracing::debug!("Connection received on {socket} from {peer}");
                        let session = Session::new(
                            stream,
                            peer,
                            Arc::clone(&self.handler),
                            self.config.clone(),
                        );
                        sessions.spawn(session.run(shutdown.resubscribe()));
                    }
                    Err(err) => {
                        internal!(level = WARN, "{}", ListenerError::AcceptFailed(err));
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },

                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    log_session_outcome(finished);
                }
            }
        }

        drop(self.listener);

        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(finished) = sessions.join_next().await {
                log_session_outcome(finished);
            }
        })
        .await;

        if drained.is_err() {
            internal!(
                level = WARN,
                "Aborting {} session(s) still running after {:?}",
                sessions.len(),
                self.shutdown_grace
            );
            sessions.shutdown().await;
        }

        internal!(level = INFO, "SMTP Listener {socket} stopped");
    }
}

fn log_session_outcome(finished: Result<Result<(), SessionError>, JoinError>) {
    match finished {
        Ok(Ok(())) => {}
        Ok(Err(err)) if err.is_shutdown() => {}
        Ok(Err(err)) if err.is_client_error() => {
            internal!(level = DEBUG, "Session ended: {err}");
        }
        Ok(Err(err)) => internal!(level = WARN, "Session failed: {err}"),
        Err(err) => internal!(level = ERROR, "Session task failed: {err}"),
    }
}
