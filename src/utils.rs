//! Identifier generation and bounded external calls

use bech32::Bech32m;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use uuid7::uuid7;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Run `f` on a worker thread, giving up after `timeout`.
///
/// Returns `None` when the deadline passes. The worker keeps running in the
/// background; its result is dropped when it finally completes.
pub fn call_with_timeout<T, F>(timeout: Duration, f: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(timeout).ok()
}
