use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;

type Callback = Arc<dyn Fn(&str) + Send + Sync>;

/// Write-only handle for human-readable progress text.
///
/// Workers only ever send; the display side owns the receiving end (or the
/// callback) and decides how to present each message.
#[derive(Clone)]
pub struct StatusSink {
    inner: SinkInner,
}

#[derive(Clone)]
enum SinkInner {
    Channel(mpsc::Sender<String>),
    Callback(Callback),
    Discard,
}

impl StatusSink {
    /// Sink backed by a channel. Drain the receiver from the one thread that
    /// owns the display.
    pub fn channel() -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                inner: SinkInner::Channel(tx),
            },
            rx,
        )
    }

    pub fn from_fn(f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            inner: SinkInner::Callback(Arc::new(f)),
        }
    }

    pub fn discard() -> Self {
        Self {
            inner: SinkInner::Discard,
        }
    }

    /// Delivers `message`. A display that has gone away is not an error for
    /// the sender.
    pub fn send(&self, message: impl Into<String>) {
        match &self.inner {
            SinkInner::Channel(tx) => {
                let _ = tx.send(message.into());
            }
            SinkInner::Callback(f) => {
                let message = message.into();
                f(&message);
            }
            SinkInner::Discard => {}
        }
    }
}

impl fmt::Debug for StatusSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.inner {
            SinkInner::Channel(_) => "channel",
            SinkInner::Callback(_) => "callback",
            SinkInner::Discard => "discard",
        };
        f.debug_struct("StatusSink").field("kind", &kind).finish()
    }
}
