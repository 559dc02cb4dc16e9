//! Raw event sources: where file change records come from.
//!
//! A [`RawEventSource`] turns a root into a stream of [`SourceMessage`]s on a
//! bounded Tokio channel. The session owns the receiving end; sources own a
//! sender per subscription and block (or wait) when the channel is full,
//! which is how slow blocking handlers push back on the operating system
//! watcher.
//!
//! Two sources ship with the crate:
//!
//! - [`NotifySource`](crate::NotifySource) wraps the platform watcher from the
//!   `notify` crate.
//! - [`ChannelSource`] is fed by hand, for tests and for embedding the engine
//!   behind some other change feed.

use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::WatchError;
use crate::events::RawEvent;

/// A message from a raw event source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceMessage {
    /// A change record.
    Event(RawEvent),
    /// The subscription for `root` can no longer deliver events.
    Disconnected {
        /// The affected root.
        root: Utf8PathBuf,
        /// What went wrong.
        reason: String,
    },
}

/// Sending half handed to a source for one subscription.
pub type RawEventSender = mpsc::Sender<SourceMessage>;

/// A live subscription. Dropping it stops delivery for its root.
pub trait Subscription: Send {
    /// Returns the subscribed root.
    fn root(&self) -> &Utf8Path;
}

/// Something that can report changes under a directory.
pub trait RawEventSource: Send + Sync + 'static {
    /// Starts delivering changes under `root` to `sender`.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be observed.
    fn subscribe(
        &self,
        root: &Utf8Path,
        recursive: bool,
        sender: RawEventSender,
    ) -> Result<Box<dyn Subscription>, WatchError>;
}

impl<S: RawEventSource + ?Sized> RawEventSource for Arc<S> {
    fn subscribe(
        &self,
        root: &Utf8Path,
        recursive: bool,
        sender: RawEventSender,
    ) -> Result<Box<dyn Subscription>, WatchError> {
        (**self).subscribe(root, recursive, sender)
    }
}

#[derive(Default)]
struct ChannelState {
    next_token: u64,
    subscribers: Vec<(u64, Utf8PathBuf, RawEventSender)>,
}

/// A source driven by explicit calls, for tests and embedding.
///
/// # Examples
///
/// ```
/// use fsd_watcher::{ChannelSource, RawEvent, RawKind, RawEventSource};
/// use camino::Utf8Path;
/// use tokio::sync::mpsc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), fsd_watcher::WatchError> {
/// let source = ChannelSource::new();
/// let (tx, mut rx) = mpsc::channel(8);
/// let _subscription = source.subscribe(Utf8Path::new("/watch"), true, tx)?;
///
/// assert!(source.send(RawEvent::new("/watch", "/watch/a.txt", RawKind::Create)).await);
/// assert!(rx.recv().await.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct ChannelSource {
    state: Arc<Mutex<ChannelState>>,
}

impl ChannelSource {
    /// Creates a source with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers a raw event to the subscriber for its root, waiting for
    /// channel capacity.
    ///
    /// Returns `false` if nobody is subscribed to that root.
    pub async fn send(&self, event: RawEvent) -> bool {
        let Some(sender) = self.sender_for(&event.root) else {
            return false;
        };
        sender.send(SourceMessage::Event(event)).await.is_ok()
    }

    /// Delivers a raw event without waiting.
    ///
    /// Returns `false` if nobody is subscribed or the channel is full.
    pub fn try_send(&self, event: RawEvent) -> bool {
        let Some(sender) = self.sender_for(&event.root) else {
            return false;
        };
        sender.try_send(SourceMessage::Event(event)).is_ok()
    }

    /// Reports a failure for `root` and drops its subscription.
    pub async fn disconnect(&self, root: &Utf8Path, reason: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let position = state.subscribers.iter().position(|(_, r, _)| r == root);
            position.map(|index| state.subscribers.remove(index))
        };
        let Some((_, root, sender)) = removed else {
            return false;
        };
        sender
            .send(SourceMessage::Disconnected {
                root,
                reason: reason.to_owned(),
            })
            .await
            .is_ok()
    }

    /// Drops every subscription's sender without a message.
    pub fn close(&self) {
        self.state.lock().subscribers.clear();
    }

    /// Returns the number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    fn sender_for(&self, root: &Utf8Path) -> Option<RawEventSender> {
        self.state
            .lock()
            .subscribers
            .iter()
            .find(|(_, r, _)| r == root)
            .map(|(_, _, sender)| sender.clone())
    }
}

impl fmt::Debug for ChannelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSource")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl RawEventSource for ChannelSource {
    fn subscribe(
        &self,
        root: &Utf8Path,
        _recursive: bool,
        sender: RawEventSender,
    ) -> Result<Box<dyn Subscription>, WatchError> {
        let mut state = self.state.lock();
        let token = state.next_token;
        state.next_token += 1;
        state.subscribers.push((token, root.to_owned(), sender));
        debug!(root = %root, "Channel source subscribed");

        Ok(Box::new(ChannelSubscription {
            token,
            root: root.to_owned(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct ChannelSubscription {
    token: u64,
    root: Utf8PathBuf,
    state: Arc<Mutex<ChannelState>>,
}

impl Subscription for ChannelSubscription {
    fn root(&self) -> &Utf8Path {
        &self.root
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        self.state
            .lock()
            .subscribers
            .retain(|(token, _, _)| *token != self.token);
    }
}
