//! Per-connection handling: preamble, receive loop and acknowledgements.

use std::{
    io::{self, Read, Write},
    net::TcpStream,
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use log::{debug, error, info, trace, warn};
use native_tls::TlsAcceptor;

use crate::cancel::CancellationToken;
use crate::sink::EventSink;
use crate::transport::{self, RelayStream};
use crate::wire::{
    Acknowledgement, CodecChain, CodecKind, FrameError, FramePoll, FrameReader, Mode, Request,
    encode_frame,
};

use super::ServerError;

/// Decodes requests, writes events to the sink and builds acknowledgements.
///
/// Every failure here is scoped to one message.
pub(crate) struct Dispatcher {
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) codecs: CodecChain,
    pub(crate) errors: Sender<ServerError>,
    pub(crate) log_exchanges: bool,
    pub(crate) with_timer: bool,
}

impl Dispatcher {
    /// Handle one request payload, returning the reply and the codec to
    /// encode it with.
    pub(crate) fn handle(&self, payload: &[u8], peer: &str) -> (Acknowledgement, CodecKind) {
        let started = Instant::now();
        let (ack, codec) = match self.codecs.decode::<Request>(payload) {
            Ok((request, codec)) => (self.deliver(request, peer), codec),
            Err(source) => {
                let ack = Acknowledgement::failed("", source.to_string());
                self.report(ServerError::Decode {
                    peer: peer.to_owned(),
                    source,
                });
                (ack, self.codecs.primary())
            }
        };
        self.log_exchange(peer, &ack, codec, started);
        (ack, codec)
    }

    fn deliver(&self, request: Request, peer: &str) -> Acknowledgement {
        let Request { id, event } = request;
        let converted = match event.into_event() {
            Ok(converted) => converted,
            Err(err) => {
                let reason = err.to_string();
                self.report(ServerError::InvalidEvent {
                    peer: peer.to_owned(),
                    id: id.clone(),
                    reason: reason.clone(),
                });
                return Acknowledgement::failed(id, reason);
            }
        };
        match self.sink.write_event(&converted.event) {
            Ok(bytes) => {
                let ack = Acknowledgement::accepted(id, bytes);
                match converted.level_error {
                    Some(err) => {
                        warn!("event {} from {peer} recorded as info: {err}", ack.id);
                        ack.with_note(err.to_string())
                    }
                    None => ack,
                }
            }
            Err(source) => {
                let ack = Acknowledgement::failed(id.clone(), source.to_string());
                self.report(ServerError::Sink {
                    peer: peer.to_owned(),
                    id,
                    source,
                });
                ack
            }
        }
    }

    fn log_exchange(&self, peer: &str, ack: &Acknowledgement, codec: CodecKind, started: Instant) {
        if !self.log_exchanges {
            return;
        }
        if self.with_timer {
            debug!(
                "exchange peer={peer} id={} ok={} bytes={} codec={} elapsed={:?}",
                ack.id,
                ack.ok,
                ack.bytes,
                codec.as_str(),
                started.elapsed()
            );
        } else {
            trace!(
                "exchange peer={peer} id={} ok={} bytes={} codec={}",
                ack.id,
                ack.ok,
                ack.bytes,
                codec.as_str()
            );
        }
    }

    pub(crate) fn report(&self, err: ServerError) {
        if let Err(unsent) = self.errors.send(err) {
            error!("relay server error with no listener: {}", unsent.into_inner());
        }
    }
}

/// Why a receive loop stopped without an I/O failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamEnd {
    /// Peer closed the connection between frames.
    Eof,
    /// No frame arrived within the idle deadline.
    DeadlineExceeded,
    /// The server is shutting down.
    Shutdown,
    /// The client sent the zero-length "done" frame.
    ClientDone,
    /// A unary exchange finished.
    Completed,
}

impl StreamEnd {
    fn describe(self) -> &'static str {
        match self {
            StreamEnd::Eof => "peer closed the stream",
            StreamEnd::DeadlineExceeded => "idle deadline exceeded",
            StreamEnd::Shutdown => "server shutting down",
            StreamEnd::ClientDone => "client finished sending",
            StreamEnd::Completed => "unary exchange complete",
        }
    }
}

/// Knobs for one receive loop.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LoopLimits {
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) max_frame_size: usize,
}

/// Read requests and answer each with an acknowledgement until the stream
/// ends.
///
/// The stream's read timeout decides how often shutdown and the idle deadline
/// are checked.
pub(crate) fn receive_loop<S: Read + Write>(
    stream: &mut S,
    reader: &mut FrameReader,
    dispatcher: &Dispatcher,
    peer: &str,
    token: &CancellationToken,
    limits: LoopLimits,
    mode: Mode,
) -> Result<StreamEnd, FrameError> {
    let mut last_frame = Instant::now();
    loop {
        if token.is_cancelled() {
            return Ok(StreamEnd::Shutdown);
        }
        match reader.poll(stream)? {
            FramePoll::Frame(payload) => {
                last_frame = Instant::now();
                let (ack, codec) = dispatcher.handle(&payload, peer);
                write_ack(stream, &ack, codec, limits.max_frame_size)?;
                if mode == Mode::Unary {
                    return Ok(StreamEnd::Completed);
                }
            }
            FramePoll::Done => return Ok(StreamEnd::ClientDone),
            FramePoll::Eof => return Ok(StreamEnd::Eof),
            FramePoll::Pending => {
                if limits
                    .idle_timeout
                    .is_some_and(|idle| last_frame.elapsed() >= idle)
                {
                    return Ok(StreamEnd::DeadlineExceeded);
                }
            }
        }
    }
}

fn write_ack<W: Write>(
    stream: &mut W,
    ack: &Acknowledgement,
    codec: CodecKind,
    max_frame_size: usize,
) -> Result<(), FrameError> {
    let payload = codec.encode(ack).map_err(io::Error::other)?;
    let framed = encode_frame(&payload, max_frame_size)?;
    stream.write_all(&framed)?;
    stream.flush()?;
    Ok(())
}

/// State shared by every connection of one server.
pub(crate) struct Session {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) acceptor: Option<TlsAcceptor>,
    pub(crate) token: CancellationToken,
    pub(crate) poll_interval: Duration,
    pub(crate) handshake_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) limits: LoopLimits,
}

impl Session {
    fn read_timeout(&self) -> Duration {
        match self.limits.idle_timeout {
            Some(idle) => self.poll_interval.min(idle),
            None => self.poll_interval,
        }
    }

    /// Wait for the preamble, giving up at the handshake deadline or on
    /// shutdown.
    fn await_preamble(
        &self,
        stream: &mut RelayStream,
        reader: &mut FrameReader,
    ) -> Result<Option<Mode>, FrameError> {
        let deadline = Instant::now() + self.handshake_timeout;
        loop {
            if let Some(preamble) = reader.poll_preamble(stream)? {
                return Ok(Some(preamble.mode));
            }
            if self.token.is_cancelled() || Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }
}

/// Serve one accepted connection until it ends.
pub(crate) fn serve_connection(tcp: TcpStream, session: &Session) {
    let peer = tcp
        .peer_addr()
        .map_or_else(|_| "unknown peer".to_owned(), |addr| addr.to_string());
    let mut stream =
        match transport::accept(tcp, session.acceptor.as_ref(), session.handshake_timeout) {
            Ok(stream) => stream,
            Err(source) => {
                session
                    .dispatcher
                    .report(ServerError::Handshake { peer, source });
                return;
            }
        };
    if let Err(err) = stream
        .set_read_timeout(Some(session.read_timeout()))
        .and_then(|()| stream.set_write_timeout(Some(session.write_timeout)))
    {
        warn!("relay connection from {peer}: failed to set timeouts: {err}");
        return;
    }

    let mut reader = FrameReader::new(session.limits.max_frame_size);
    let outcome = match session.await_preamble(&mut stream, &mut reader) {
        Ok(Some(mode)) => {
            debug!("relay connection from {peer} opened in {mode:?} mode");
            receive_loop(
                &mut stream,
                &mut reader,
                &session.dispatcher,
                &peer,
                &session.token,
                session.limits,
                mode,
            )
        }
        Ok(None) => Ok(StreamEnd::DeadlineExceeded),
        Err(err) => Err(err),
    };
    match outcome {
        Ok(end) => info!("relay stream from {peer} ended: {}", end.describe()),
        Err(FrameError::Closed) => info!("relay stream from {peer} ended: {}", StreamEnd::Eof.describe()),
        Err(err) => warn!("relay stream from {peer} failed: {err}"),
    }
    if let Err(err) = stream.shutdown() {
        trace!("relay connection from {peer}: shutdown: {err}");
    }
}
