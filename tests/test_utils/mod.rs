//! Shared helpers for relay integration tests.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use femtorelay::{
    BackoffOverrides, FemtoEvent, FemtoLevel, MemorySink, RelayClientBuilder, RelayServerBuilder,
    ServerHandle,
};

/// A running server with the sink it writes to.
pub struct Collector {
    pub handle: ServerHandle,
    pub sink: MemorySink,
}

impl Collector {
    pub fn addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }
}

/// Start a server on `address` writing into a fresh [`MemorySink`].
pub fn start_collector(address: &str) -> Collector {
    let sink = MemorySink::new();
    let handle = RelayServerBuilder::new()
        .with_address(address)
        .with_poll_interval_ms(10)
        .start(Arc::new(sink.clone()))
        .expect("start collector");
    Collector { handle, sink }
}

/// An address nothing is listening on.
pub fn closed_address() -> SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral listener");
    listener.local_addr().expect("listener has address")
}

/// Client builder with short timeouts and no jitter.
pub fn fast_client(addr: SocketAddr) -> RelayClientBuilder {
    RelayClientBuilder::new()
        .with_address(addr.to_string())
        .with_connect_timeout_ms(500)
        .with_ack_timeout_ms(1_000)
        .with_rng_seed(11)
        .with_backoff(BackoffOverrides::new().with_max_jitter_ms(0).with_ceiling_ms(2_000))
}

pub fn event(message: &str) -> FemtoEvent {
    FemtoEvent::builder()
        .prefix("it")
        .level(FemtoLevel::Info)
        .message(message)
        .field("seq", message)
        .build()
        .expect("valid event")
}

/// Poll `condition` every few milliseconds for up to ten seconds.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}
