//! Threads draining error channels into the operational log.

use std::fmt::Display;
use std::thread;

use crossbeam_channel::Receiver;
use log::{Level, debug, log};

/// Log level at which an error should be reported.
pub trait Severity {
    fn severity(&self) -> Level;
}

/// Log every error received on `errors` until all senders are dropped.
pub fn spawn_supervisor<E>(name: impl Into<String>, errors: Receiver<E>) -> thread::JoinHandle<()>
where
    E: Display + Severity + Send + 'static,
{
    let name = name.into();
    thread::spawn(move || {
        for err in errors.iter() {
            log!(err.severity(), "{name}: {err}");
        }
        debug!("{name}: error channel closed");
    })
}
