//! Single-threaded execution context for observers and timers.
//!
//! Background threads never call listeners directly. They post tasks through
//! a [`DispatchHandle`]; whichever thread owns the [`Dispatcher`] drains the
//! queue and fires due timers, so every observer runs serialized on that one
//! thread.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::error;

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    Schedule(TimerEntry),
}

struct TimerEntry {
    due: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: Task,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the heap yields the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Cancellation handle for a task scheduled with [`DispatchHandle::post_after`].
#[derive(Clone, Debug, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Prevents the task from running if it has not fired yet.
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }
}

/// Cloneable sender side of the dispatcher, usable from any thread.
#[derive(Clone)]
pub struct DispatchHandle {
    sender: Sender<Message>,
    seq: Arc<AtomicU64>,
}

impl DispatchHandle {
    /// Queues `task` to run on the dispatcher thread.
    ///
    /// Returns `false` when the dispatcher has been dropped.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.sender.send(Message::Run(Box::new(task))).is_ok()
    }

    /// Queues `task` to run on the dispatcher thread after `delay`.
    pub fn post_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TimerHandle {
        let handle = TimerHandle::default();
        let entry = TimerEntry {
            due: Instant::now() + delay,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            cancelled: Arc::clone(&handle.cancelled),
            task: Box::new(task),
        };
        if self.sender.send(Message::Schedule(entry)).is_err() {
            handle.cancel();
        }
        handle
    }
}

impl std::fmt::Debug for DispatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchHandle")
            .field("queued", &self.sender.len())
            .finish()
    }
}

/// Owner side of the execution context.
pub struct Dispatcher {
    receiver: Receiver<Message>,
    handle: DispatchHandle,
    timers: BinaryHeap<TimerEntry>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            receiver,
            handle: DispatchHandle {
                sender,
                seq: Arc::new(AtomicU64::new(0)),
            },
            timers: BinaryHeap::new(),
        }
    }

    #[must_use]
    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    /// Number of timers waiting to fire, cancelled ones included.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Waits up to `timeout` for work and runs everything that became ready.
    /// Returns the number of tasks executed.
    pub fn run_once(&mut self, timeout: Duration) -> usize {
        let mut executed = self.fire_due_timers();
        if executed > 0 {
            executed += self.drain_queue();
            return executed;
        }

        let wait = self.timers.peek().map_or(timeout, |next| {
            next.due
                .saturating_duration_since(Instant::now())
                .min(timeout)
        });
        match self.receiver.recv_timeout(wait) {
            Ok(message) => executed += self.accept(message),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {}
        }
        executed += self.drain_queue();
        executed + self.fire_due_timers()
    }

    /// Runs queued tasks and due timers without blocking.
    pub fn run_until_idle(&mut self) -> usize {
        let mut executed = 0;
        loop {
            let step = self.drain_queue() + self.fire_due_timers();
            if step == 0 {
                return executed;
            }
            executed += step;
        }
    }

    /// Services the queue for `duration`.
    pub fn run_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.run_once(deadline - now);
        }
    }

    /// Services the queue until `done` returns `true` or `timeout` elapses.
    /// Returns the final value of `done`.
    pub fn run_until(&mut self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.run_once((deadline - now).min(Duration::from_millis(10)));
        }
    }

    fn accept(&mut self, message: Message) -> usize {
        match message {
            Message::Run(task) => {
                run_guarded(task);
                1
            }
            Message::Schedule(entry) => {
                self.timers.push(entry);
                0
            }
        }
    }

    fn drain_queue(&mut self) -> usize {
        let mut executed = 0;
        while let Ok(message) = self.receiver.try_recv() {
            executed += self.accept(message);
        }
        executed
    }

    fn fire_due_timers(&mut self) -> usize {
        let now = Instant::now();
        let mut executed = 0;
        while let Some(next) = self.timers.peek()
            && next.due <= now
        {
            let Some(entry) = self.timers.pop() else {
                break;
            };
            if !entry.cancelled.swap(true, AtomicOrdering::SeqCst) {
                run_guarded(entry.task);
                executed += 1;
            }
        }
        executed
    }
}

fn run_guarded(task: Task) {
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!("dispatched task panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::thread;

    #[test]
    fn tasks_posted_from_other_threads_run_on_the_owner() {
        let mut dispatcher = Dispatcher::new();
        let owner = thread::current().id();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handle = dispatcher.handle();
        let recorder = Arc::clone(&seen);
        thread::spawn(move || {
            for value in 0..3 {
                let recorder = Arc::clone(&recorder);
                handle.post(move || recorder.lock().push((value, thread::current().id())));
            }
        })
        .join()
        .expect("poster thread");

        assert!(dispatcher.run_until(Duration::from_secs(1), || seen.lock().len() == 3));
        let seen = seen.lock();
        assert_eq!(
            seen.iter().map(|(value, _)| *value).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(seen.iter().all(|(_, id)| *id == owner));
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut dispatcher = Dispatcher::new();
        let handle = dispatcher.handle();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, delay) in [("late", 60), ("early", 10), ("middle", 30)] {
            let order = Arc::clone(&order);
            handle.post_after(Duration::from_millis(delay), move || order.lock().push(label));
        }

        assert!(dispatcher.run_until(Duration::from_secs(1), || order.lock().len() == 3));
        assert_eq!(*order.lock(), vec!["early", "middle", "late"]);
    }

    #[test]
    fn cancelled_timers_never_run() {
        let mut dispatcher = Dispatcher::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let timer = dispatcher
            .handle()
            .post_after(Duration::from_millis(20), move || flag.store(true, AtomicOrdering::SeqCst));
        timer.cancel();

        dispatcher.run_for(Duration::from_millis(60));
        assert!(!fired.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn panicking_task_does_not_poison_the_queue() {
        let mut dispatcher = Dispatcher::new();
        let handle = dispatcher.handle();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        handle.post(|| panic!("listener failure"));
        handle.post(move || flag.store(true, AtomicOrdering::SeqCst));

        assert_eq!(dispatcher.run_until_idle(), 2);
        assert!(ran.load(AtomicOrdering::SeqCst));
    }
}
