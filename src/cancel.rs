//! Cooperative cancellation shared between threads.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

type Hook = Box<dyn FnOnce() + Send>;

/// A cloneable cancellation flag.
///
/// The signal is a channel that never carries a message: cancelling drops
/// its only sender, so every clone of the receiver becomes ready at once and
/// can sit in a `select!` next to an event queue or a timer. Code that
/// cannot select, such as a thread blocked in a read, registers a hook with
/// [`on_cancel`](Self::on_cancel) instead.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

struct Inner {
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
    hooks: Mutex<Vec<Hook>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (trigger, signal) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                trigger: Mutex::new(Some(trigger)),
                signal,
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Fire the token and run the registered hooks on the calling thread.
    /// Calling this more than once has no further effect.
    pub fn cancel(&self) {
        if self.inner.trigger.lock().take().is_none() {
            return;
        }
        let hooks = std::mem::take(&mut *self.inner.hooks.lock());
        for hook in hooks {
            hook();
        }
    }

    /// Run `hook` once when the token fires, or right away if it already has.
    ///
    /// Hooks run on the thread that cancels, outside any lock of the token,
    /// so they may clone or query it.
    pub fn on_cancel<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut hooks = self.inner.hooks.lock();
        if !self.is_cancelled() {
            hooks.push(Box::new(hook));
            return;
        }
        drop(hooks);
        hook();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.trigger.lock().is_none()
    }

    /// Receiver that disconnects when the token fires.
    pub(crate) fn signal(&self) -> &Receiver<()> {
        &self.inner.signal
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{after, select};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_cancel_is_shared_across_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_signal_wakes_select() {
        let token = CancellationToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        let woke = select! {
            recv(token.signal()) -> _ => true,
            recv(after(Duration::from_secs(5))) -> _ => false,
        };
        assert!(woke);
        handle.join().unwrap();
    }

    #[test]
    fn test_hooks_run_once_on_cancel() {
        let token = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        token.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        token.cancel();
        token.cancel();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Registered after the fact: runs immediately.
        let counter = Arc::clone(&runs);
        token.clone().on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_hook_may_use_the_token() {
        let token = CancellationToken::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        let inner = token.clone();
        token.on_cancel(move || {
            let _ = tx.send(inner.is_cancelled());
        });

        token.cancel();
        assert_eq!(rx.try_recv(), Ok(true));
    }
}
