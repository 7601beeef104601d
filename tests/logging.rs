//! Circuit breaker logging: verifies the stability envelope actually emits
//! the state-transition events §4.F promises, not just that the state
//! machine itself is correct.
//!
//! Captures `tracing` output through a small in-memory writer rather than
//! asserting on internal state, since the point is to confirm the log line
//! an operator would grep for in production actually appears.

use std::sync::{Arc, Mutex};

use routeros_client::breaker::CircuitBreaker;
use routeros_client::Error;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone, Default)]
struct CapturingWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for CapturingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturingWriter {
    type Writer = Self;
    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

async fn fail() -> Result<(), Error> {
    Err(Error::Transport("boom".into()))
}

#[tokio::test]
async fn breaker_logs_the_closed_to_open_transition() {
    let writer = CapturingWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(writer.clone())
        .with_ansi(false)
        .finish();

    // `set_default` installs a thread-local dispatcher for as long as the
    // guard lives — unlike `with_default`, which only covers a synchronous
    // closure call and would miss events raised across `.await` points.
    // Safe to hold across awaits here because `#[tokio::test]` runs on a
    // single-threaded current-thread runtime by default.
    let guard = tracing::subscriber::set_default(subscriber);
    let breaker = CircuitBreaker::new(3, std::time::Duration::from_secs(10));
    for _ in 0..3 {
        let _ = breaker.execute(fail).await;
    }
    drop(guard);

    let logged = String::from_utf8(writer.0.lock().unwrap().clone()).unwrap();
    assert!(
        logged.contains("CLOSED -> OPEN"),
        "expected a CLOSED -> OPEN transition log line, got: {logged}"
    );
}
