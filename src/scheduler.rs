//! Primary execution context primitives.
//!
//! The session runs on one tokio task. Anything that happens elsewhere
//! (background device start/stop, writer preparation, timer expiry) comes
//! back to it as a continuation posted through [`PrimaryHandle`] and is
//! executed with exclusive access to the session. Nothing outside that task
//! mutates session state.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Work queued for the primary context.
pub type Continuation<C> = Box<dyn FnOnce(&mut C) + Send>;

/// Receiving end drained by the primary context's run loop.
pub type ContinuationQueue<C> = mpsc::UnboundedReceiver<Continuation<C>>;

/// Cloneable sender for continuations.
pub struct PrimaryHandle<C> {
    tx: mpsc::UnboundedSender<Continuation<C>>,
}

impl<C> Clone for PrimaryHandle<C> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

/// Creates a continuation queue for a context of type `C`.
pub fn primary_channel<C>() -> (PrimaryHandle<C>, ContinuationQueue<C>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PrimaryHandle { tx }, rx)
}

impl<C: 'static> PrimaryHandle<C> {
    /// Queues `f` to run on the primary context. Returns false once the
    /// primary context has gone away.
    pub fn run_on_primary<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.tx.send(Box::new(f)).is_ok()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Contexts that own a [`Timers`] table.
pub trait TimerHost: Sized + 'static {
    fn timers(&mut self) -> &mut Timers<Self>;
}

/// Cancellable one-shot timers delivering onto the primary context.
///
/// A timer is a sleeping task that posts its callback when it expires. The
/// callback only runs if the timer is still registered when the primary
/// context picks it up, so a cancel issued before that point always wins.
pub struct Timers<C> {
    primary: PrimaryHandle<C>,
    next_id: u64,
    pending: HashMap<TimerId, JoinHandle<()>>,
}

impl<C: TimerHost> Timers<C> {
    pub fn new(primary: PrimaryHandle<C>) -> Self {
        Self {
            primary,
            next_id: 0,
            pending: HashMap::new(),
        }
    }

    /// Runs `f` on the primary context after `delay`.
    pub fn schedule_once<F>(&mut self, delay: Duration, f: F) -> TimerId
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let primary = self.primary.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            primary.run_on_primary(move |ctx: &mut C| {
                if ctx.timers().fire(id) {
                    f(ctx);
                }
            });
        });
        debug!("timer {:?} scheduled in {:?}", id, delay);
        self.pending.insert(id, task);
        id
    }

    /// Cancels a pending timer. Returns false if it already ran or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.pending.remove(&id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Cancels every pending timer.
    pub fn clear(&mut self) {
        for (_, task) in self.pending.drain() {
            task.abort();
        }
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn fire(&mut self, id: TimerId) -> bool {
        self.pending.remove(&id).is_some()
    }
}
