//! Listener thread and the handle controlling a running server.

use std::{
    io,
    net::{SocketAddr, TcpListener},
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam_channel::unbounded;
use log::{debug, info};

use crate::cancel::CancellationToken;
use crate::sink::EventSink;
use crate::supervisor::spawn_supervisor;

use super::{
    RelayServerBuilder, RelayServerConfig, ServerError,
    connection::{Dispatcher, LoopLimits, Session, serve_connection},
};

/// Relay server writing every received event to a local sink.
pub struct FemtoRelayServer {
    config: RelayServerConfig,
    sink: Arc<dyn EventSink>,
}

impl FemtoRelayServer {
    pub fn builder() -> RelayServerBuilder {
        RelayServerBuilder::new()
    }

    pub fn new(config: RelayServerConfig, sink: Arc<dyn EventSink>) -> Self {
        Self { config, sink }
    }

    pub fn config(&self) -> &RelayServerConfig {
        &self.config
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Binding and TLS identity problems are returned here. Once running,
    /// failures go to the error channel and never stop the server.
    pub fn start(self) -> Result<ServerHandle, ServerError> {
        let Self { config, sink } = self;
        let acceptor = config
            .tls
            .as_ref()
            .map(|identity| identity.acceptor())
            .transpose()
            .map_err(ServerError::Tls)?;
        let bind_err = |source: io::Error| ServerError::Bind {
            address: config.address.clone(),
            source,
        };
        let listener = TcpListener::bind(&config.address).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let (errors, supervisor) = match config.error_sink.clone() {
            Some(errors) => (errors, None),
            None => {
                let (tx, rx) = unbounded();
                let handle = spawn_supervisor(format!("relay server on {local_addr}"), rx);
                (tx, Some(handle))
            }
        };
        let token = CancellationToken::new();
        let session = Arc::new(Session {
            dispatcher: Dispatcher {
                sink,
                codecs: config.codecs.clone(),
                errors,
                log_exchanges: config.log_exchanges,
                with_timer: config.with_timer,
            },
            acceptor,
            token: token.clone(),
            poll_interval: config.poll_interval,
            handshake_timeout: config.handshake_timeout,
            write_timeout: config.write_timeout,
            limits: LoopLimits {
                idle_timeout: config.idle_timeout,
                max_frame_size: config.max_frame_size,
            },
        });
        let acceptor = thread::spawn(move || accept_loop(listener, session));
        info!("relay server listening on {local_addr}");
        Ok(ServerHandle {
            local_addr,
            token,
            acceptor: Some(acceptor),
            supervisor,
        })
    }
}

/// Accept connections until shutdown, then wait for every handler.
fn accept_loop(listener: TcpListener, session: Arc<Session>) {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    while !session.token.is_cancelled() {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("relay server accepted {peer}");
                let session = Arc::clone(&session);
                connections.push(thread::spawn(move || serve_connection(stream, &session)));
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                session.token.wait_timeout(session.poll_interval);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                session.dispatcher.report(ServerError::Accept(err));
                session.token.wait_timeout(session.poll_interval);
            }
        }
        connections.retain(|handle| !handle.is_finished());
    }
    drop(listener);
    for handle in connections {
        if handle.join().is_err() {
            log::error!("relay connection handler panicked");
        }
    }
}

/// Handle to a running relay server. Dropping it shuts the server down.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    token: CancellationToken,
    acceptor: Option<JoinHandle<()>>,
    supervisor: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Stop accepting, end every open stream and wait for the handlers.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.acceptor.take() {
            if handle.join().is_err() {
                log::error!("relay server listener panicked");
            }
            info!("relay server on {} stopped", self.local_addr);
        }
        if let Some(handle) = self.supervisor.take() {
            if handle.join().is_err() {
                log::error!("relay server supervisor panicked");
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
