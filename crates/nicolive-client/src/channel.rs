//! Shared producer/consumer queue behind the message and watch-frame
//! sequences.
//!
//! One FIFO with any number of cooperating receivers: receivers race for
//! values and each value is delivered to exactly one of them. The producer
//! side can latch an error (the next read fails) or close (reads drain with
//! end-of-sequence), and may install a one-shot filter that drops values
//! until its condition fires.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Verdict of a push-side filter.
pub struct FilterDecision {
    /// Enqueue this value for consumers.
    pub deliver: bool,
    /// Uninstall the filter after this value.
    pub done: bool,
}

impl FilterDecision {
    pub fn deliver() -> Self {
        Self {
            deliver: true,
            done: false,
        }
    }

    pub fn skip() -> Self {
        Self {
            deliver: false,
            done: false,
        }
    }

    /// Drop this value too, then deliver everything after it.
    pub fn skip_last() -> Self {
        Self {
            deliver: false,
            done: true,
        }
    }
}

pub type Filter<T> = Box<dyn FnMut(&T) -> FilterDecision + Send>;
type AbandonHook = Box<dyn FnOnce() + Send>;

enum Latch<E> {
    Open,
    Closed,
    Failed(Arc<E>),
}

struct State<T, E> {
    queue: VecDeque<T>,
    latch: Latch<E>,
    filter: Option<Filter<T>>,
    receivers: usize,
    senders: usize,
    on_abandon: Option<AbandonHook>,
}

struct Core<T, E> {
    state: Mutex<State<T, E>>,
    notify: Notify,
}

pub fn channel<T, E>() -> (Sender<T, E>, Receiver<T, E>) {
    let core = Arc::new(Core {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            latch: Latch::Open,
            filter: None,
            receivers: 1,
            senders: 1,
            on_abandon: None,
        }),
        notify: Notify::new(),
    });
    (
        Sender { core: core.clone() },
        Receiver { core },
    )
}

pub struct Sender<T, E> {
    core: Arc<Core<T, E>>,
}

impl<T, E> Sender<T, E> {
    /// Appends a value unless the channel is closed or errored.
    pub fn push(&self, value: T) {
        {
            let mut state = self.core.state.lock().unwrap();
            if !matches!(state.latch, Latch::Open) {
                return;
            }
            if let Some(filter) = state.filter.as_mut() {
                let decision = filter(&value);
                if decision.done {
                    state.filter = None;
                }
                if !decision.deliver {
                    return;
                }
            }
            state.queue.push_back(value);
        }
        self.core.notify.notify_one();
    }

    /// Latches the error; the next consumer read fails with it.
    pub fn fail(&self, error: E) {
        self.fail_arc(Arc::new(error));
    }

    /// [`fail`](Self::fail) for an error that is already shared.
    pub fn fail_arc(&self, error: Arc<E>) {
        {
            let mut state = self.core.state.lock().unwrap();
            if !matches!(state.latch, Latch::Open) {
                return;
            }
            state.latch = Latch::Failed(error);
        }
        self.core.notify.notify_waiters();
    }

    /// Latches end-of-sequence; queued values drain first.
    pub fn close(&self) {
        {
            let mut state = self.core.state.lock().unwrap();
            if !matches!(state.latch, Latch::Open) {
                return;
            }
            state.latch = Latch::Closed;
        }
        self.core.notify.notify_waiters();
    }

    /// Installs (or clears) the push-side filter.
    pub fn set_filter(&self, filter: Option<Filter<T>>) {
        let mut state = self.core.state.lock().unwrap();
        state.filter = filter;
    }

    /// Hook invoked when the last receiver drops before close.
    pub fn set_abandon_hook(&self, hook: AbandonHook) {
        let mut state = self.core.state.lock().unwrap();
        state.on_abandon = Some(hook);
    }
}

impl<T, E> Clone for Sender<T, E> {
    fn clone(&self) -> Self {
        self.core.state.lock().unwrap().senders += 1;
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T, E> Drop for Sender<T, E> {
    fn drop(&mut self) {
        let close = {
            let mut state = self.core.state.lock().unwrap();
            state.senders -= 1;
            if state.senders == 0 && matches!(state.latch, Latch::Open) {
                state.latch = Latch::Closed;
                true
            } else {
                false
            }
        };
        if close {
            self.core.notify.notify_waiters();
        }
    }
}

pub struct Receiver<T, E> {
    core: Arc<Core<T, E>>,
}

impl<T, E> Receiver<T, E> {
    /// Next value in FIFO order.
    ///
    /// Waits while the queue is empty and the channel is open. Returns
    /// `Ok(None)` once closed and drained, `Err` once the error latch is
    /// set. Receivers race; a value goes to exactly one of them.
    pub async fn recv(&self) -> Result<Option<T>, Arc<E>> {
        loop {
            {
                let mut state = self.core.state.lock().unwrap();
                if let Latch::Failed(error) = &state.latch {
                    return Err(error.clone());
                }
                if let Some(value) = state.queue.pop_front() {
                    if !state.queue.is_empty() {
                        self.core.notify.notify_one();
                    }
                    return Ok(Some(value));
                }
                if matches!(state.latch, Latch::Closed) {
                    return Ok(None);
                }
            }

            let notified = self.core.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.core.state.lock().unwrap();
                if !state.queue.is_empty() || !matches!(state.latch, Latch::Open) {
                    continue;
                }
            }
            notified.await;
        }
    }
}

impl<T, E> Clone for Receiver<T, E> {
    fn clone(&self) -> Self {
        self.core.state.lock().unwrap().receivers += 1;
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T, E> Drop for Receiver<T, E> {
    fn drop(&mut self) {
        let hook = {
            let mut state = self.core.state.lock().unwrap();
            state.receivers -= 1;
            if state.receivers == 0 && matches!(state.latch, Latch::Open) {
                state.on_abandon.take()
            } else {
                None
            }
        };
        if let Some(hook) = hook {
            hook();
        }
    }
}
