//! End-to-end delivery between a relay client and a relay server.

mod test_utils;

use femtorelay::{LinkState, Mode};
use rstest::rstest;
use test_utils::{closed_address, event, fast_client, start_collector, wait_until};

#[rstest]
fn buffered_events_arrive_in_order_once_server_starts() {
    let addr = closed_address();
    let mut client = fast_client(addr).build().expect("build client");
    let messages = ["m1", "m2", "m3", "m4", "m5"];
    for message in messages {
        client.submit(event(message)).expect("queue event");
    }
    wait_until("buffering", || client.backoff().attempt_count() >= 1);
    assert_eq!(client.delivered(), 0);

    let collector = start_collector(&addr.to_string());
    wait_until("five acknowledgements", || client.delivered() == 5);

    assert_eq!(collector.sink.messages(), messages);
    assert_eq!(client.rejected(), 0);
    assert_eq!(client.state(), LinkState::Streaming);
    assert_eq!(client.backoff().attempt_count(), 0);
    let received = collector.sink.events();
    assert!(received.iter().all(|e| e.prefix == "it"));
    assert!(client.close().is_clean());
}

#[rstest]
fn stream_recovers_after_server_restart() {
    let first = start_collector("127.0.0.1:0");
    let addr = first.addr();
    let mut client = fast_client(addr).build().expect("build client");
    client.submit(event("before-1")).expect("queue event");
    client.submit(event("before-2")).expect("queue event");
    wait_until("first acknowledgements", || client.delivered() == 2);
    assert_eq!(first.sink.messages(), ["before-1", "before-2"]);
    first.handle.shutdown();

    for message in ["after-1", "after-2", "after-3"] {
        client.submit(event(message)).expect("queue event");
    }
    wait_until("link loss", || client.backoff().attempt_count() >= 1);

    let second = start_collector(&addr.to_string());
    wait_until("replayed acknowledgements", || client.delivered() == 5);
    assert_eq!(second.sink.messages(), ["after-1", "after-2", "after-3"]);
    assert!(client.close().is_clean());
}

#[rstest]
fn unary_mode_delivers_each_event_on_its_own_connection() {
    let collector = start_collector("127.0.0.1:0");
    let mut client = fast_client(collector.addr())
        .with_mode(Mode::Unary)
        .build()
        .expect("build client");
    for message in ["u1", "u2", "u3"] {
        client.submit(event(message)).expect("queue event");
    }
    wait_until("unary acknowledgements", || client.delivered() == 3);
    assert_eq!(collector.sink.messages(), ["u1", "u2", "u3"]);
    assert!(client.close().is_clean());
}

#[rstest]
fn metadata_and_timestamps_survive_the_trip() {
    let collector = start_collector("127.0.0.1:0");
    let mut client = fast_client(collector.addr()).build().expect("build client");
    let sent = event("with-meta");
    client.submit(sent.clone()).expect("queue event");
    wait_until("acknowledgement", || client.delivered() == 1);

    let received = collector.sink.events().remove(0);
    assert_eq!(received.metadata, sent.metadata);
    assert_eq!(received.level, sent.level);
    assert!(received.timestamp.is_some());
    client.close();
}

#[rstest]
fn close_hands_back_what_never_arrived() {
    let mut client = fast_client(closed_address()).build().expect("build client");
    client.submit(event("lost-1")).expect("queue event");
    client.submit(event("lost-2")).expect("queue event");
    let report = client.close();
    let undelivered: Vec<_> = report.undelivered.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(undelivered, ["lost-1", "lost-2"]);
    assert!(client.submit(event("late")).is_err());
}
