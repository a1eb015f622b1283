//! Tests for the relay server over real sockets.

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, unbounded};
use rstest::{fixture, rstest};

use crate::{
    event::FemtoEvent,
    level::FemtoLevel,
    sink::MemorySink,
    wire::{
        Acknowledgement, CodecKind, FramePoll, FrameReader, Mode, Preamble, Request, done_frame,
        encode_frame,
    },
};

use super::{RelayServerBuilder, ServerError, ServerHandle};

struct Running {
    handle: ServerHandle,
    sink: MemorySink,
    errors: Receiver<ServerError>,
}

#[fixture]
fn server() -> Running {
    start(RelayServerBuilder::new())
}

fn start(builder: RelayServerBuilder) -> Running {
    let sink = MemorySink::new();
    let (errors_tx, errors) = unbounded();
    let handle = builder
        .with_address("127.0.0.1:0")
        .with_poll_interval_ms(10)
        .with_error_sink(errors_tx)
        .start(Arc::new(sink.clone()))
        .expect("start server");
    Running {
        handle,
        sink,
        errors,
    }
}

fn open(addr: SocketAddr, mode: Mode) -> TcpStream {
    let mut stream = TcpStream::connect(addr).expect("connect to server");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("set read timeout");
    stream
        .write_all(&Preamble::new(mode).encode())
        .expect("write preamble");
    stream
}

fn send(stream: &mut TcpStream, payload: &[u8]) {
    let framed = encode_frame(payload, 1 << 20).expect("fits frame");
    stream.write_all(&framed).expect("write frame");
}

fn request(id: &str, message: &str, codec: CodecKind) -> Vec<u8> {
    codec
        .encode(&Request::new(id, &FemtoEvent::new(FemtoLevel::Info, message)))
        .expect("encodable request")
}

fn read_ack(stream: &mut TcpStream, codec: CodecKind) -> Acknowledgement {
    let mut reader = FrameReader::new(1 << 20);
    match reader.poll(stream).expect("read ack frame") {
        FramePoll::Frame(payload) => codec.decode(&payload).expect("decode ack"),
        other => panic!("expected an ack frame, got {other:?}"),
    }
}

fn assert_closed_by_server(stream: &mut TcpStream) {
    let mut buf = [0u8; 1];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => {}
        other => panic!("expected the server to close the stream, got {other:?}"),
    }
}

#[rstest]
fn acknowledges_each_event_in_order(server: Running) {
    let mut stream = open(server.handle.local_addr(), Mode::Stream);
    for (idx, message) in ["a", "b", "c", "d", "e"].iter().enumerate() {
        let id = idx.to_string();
        send(&mut stream, &request(&id, message, CodecKind::MessagePack));
        let ack = read_ack(&mut stream, CodecKind::MessagePack);
        assert!(ack.ok, "{ack:?}");
        assert_eq!(ack.id, id);
        assert_eq!(ack.bytes, 1);
    }
    stream.write_all(&done_frame()).expect("send done");
    assert_closed_by_server(&mut stream);
    assert_eq!(server.sink.messages(), vec!["a", "b", "c", "d", "e"]);
}

#[rstest]
fn json_requests_get_json_acks(server: Running) {
    let mut stream = open(server.handle.local_addr(), Mode::Stream);
    send(&mut stream, &request("j1", "from json", CodecKind::Json));
    let ack = read_ack(&mut stream, CodecKind::Json);
    assert!(ack.ok);
    assert_eq!(ack.id, "j1");
    assert_eq!(server.sink.messages(), vec!["from json"]);
}

#[rstest]
fn malformed_message_does_not_end_stream(server: Running) {
    let mut stream = open(server.handle.local_addr(), Mode::Stream);
    send(&mut stream, b"{not valid");
    let ack = read_ack(&mut stream, CodecKind::MessagePack);
    assert!(!ack.ok);
    assert!(ack.error.is_some_and(|err| err.contains("failed to decode")));

    send(&mut stream, &request("after", "still here", CodecKind::MessagePack));
    let ack = read_ack(&mut stream, CodecKind::MessagePack);
    assert!(ack.ok);
    assert_eq!(server.sink.messages(), vec!["still here"]);
    let err = server
        .errors
        .recv_timeout(Duration::from_secs(1))
        .expect("decode failure reported");
    assert!(matches!(err, ServerError::Decode { .. }));
}

#[rstest]
fn empty_message_is_refused(server: Running) {
    let mut stream = open(server.handle.local_addr(), Mode::Stream);
    send(&mut stream, &request("blank", "", CodecKind::MessagePack));
    let ack = read_ack(&mut stream, CodecKind::MessagePack);
    assert!(!ack.ok);
    assert_eq!(ack.id, "blank");
    assert!(server.sink.is_empty());
    let err = server
        .errors
        .recv_timeout(Duration::from_secs(1))
        .expect("invalid event reported");
    assert!(matches!(err, ServerError::InvalidEvent { id, .. } if id == "blank"));
}

#[rstest]
fn unary_connection_closes_after_one_ack(server: Running) {
    let mut stream = open(server.handle.local_addr(), Mode::Unary);
    send(&mut stream, &request("u", "single", CodecKind::MessagePack));
    let ack = read_ack(&mut stream, CodecKind::MessagePack);
    assert!(ack.ok);
    assert_closed_by_server(&mut stream);
}

#[rstest]
fn connections_are_independent(server: Running) {
    let addr = server.handle.local_addr();
    let mut first = open(addr, Mode::Stream);
    let mut second = open(addr, Mode::Stream);
    send(&mut first, b"\xc1garbage");
    send(&mut second, &request("ok", "unaffected", CodecKind::MessagePack));
    assert!(read_ack(&mut second, CodecKind::MessagePack).ok);
    assert!(!read_ack(&mut first, CodecKind::MessagePack).ok);
}

#[rstest]
fn idle_stream_hits_deadline() {
    let server = start(RelayServerBuilder::new().with_idle_timeout_ms(100));
    let mut stream = open(server.handle.local_addr(), Mode::Stream);
    let started = Instant::now();
    assert_closed_by_server(&mut stream);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[rstest]
fn bad_preamble_closes_connection(server: Running) {
    let mut stream = TcpStream::connect(server.handle.local_addr()).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("set read timeout");
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").expect("write");
    assert_closed_by_server(&mut stream);
    assert!(server.sink.is_empty());
}

#[rstest]
fn shutdown_ends_open_streams(server: Running) {
    let Running { handle, .. } = server;
    let mut stream = open(handle.local_addr(), Mode::Stream);
    send(&mut stream, &request("1", "before", CodecKind::MessagePack));
    assert!(read_ack(&mut stream, CodecKind::MessagePack).ok);

    let started = Instant::now();
    handle.shutdown();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_closed_by_server(&mut stream);
}

#[rstest]
fn occupied_address_fails_to_bind() {
    let taken = TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral listener");
    let addr = taken.local_addr().expect("listener has address");
    let err = RelayServerBuilder::new()
        .with_address(addr.to_string())
        .start(Arc::new(MemorySink::new()))
        .expect_err("address in use");
    assert!(matches!(err, ServerError::Bind { .. }));
}

#[rstest]
fn missing_tls_identity_fails_to_start() {
    let err = RelayServerBuilder::new()
        .with_address("127.0.0.1:0")
        .with_tls("/nonexistent/cert.pem", "/nonexistent/key.pem")
        .start(Arc::new(MemorySink::new()))
        .expect_err("identity missing");
    assert!(matches!(err, ServerError::Tls(_)));
}
