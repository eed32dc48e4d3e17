//! One-shot / repeating delayed callbacks run on a dedicated timer thread.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};
use triomphe::Arc;

use crate::errors::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DelayQueueAction {
    /// Drop the task.
    Stop,
    /// Run the task again after the same delay.
    Repeat,
}

type Task = Box<dyn FnMut() -> DelayQueueAction + Send>;

struct Entry {
    deadline: Instant,
    seq: u64,
    delay: Duration,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap is a max-heap; the earliest deadline must come out first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct State {
    entries: BinaryHeap<Entry>,
    next_seq: u64,
    running: bool,
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
}

pub struct DelayQueue {
    name: String,
    resolution: Duration,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DelayQueue {
    pub fn new(name: impl Into<String>, resolution: Duration) -> Self {
        Self {
            name: name.into(),
            resolution: resolution.max(Duration::from_millis(1)),
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                wakeup: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Starts the timer thread. Starting a running queue is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }

        self.shared.state.lock().running = true;

        let shared = self.shared.clone();
        let resolution = self.resolution;
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run(shared, resolution))
            .map_err(|err| {
                self.shared.state.lock().running = false;
                Error::ThreadSpawn(err)
            })?;
        *thread = Some(handle);
        debug!(name = %self.name, "Delay queue started");
        Ok(())
    }

    /// Stops the timer thread and waits for it. Pending tasks are kept.
    pub fn stop(&self) {
        let handle = self.thread.lock().take();
        let Some(handle) = handle else {
            return;
        };

        self.shared.state.lock().running = false;
        self.shared.wakeup.notify_all();

        if handle.thread().id() != thread::current().id() && handle.join().is_err() {
            tracing::error!(name = %self.name, "Delay queue thread panicked");
        }
        debug!(name = %self.name, "Delay queue stopped");
    }

    pub fn push<F>(&self, task: F, delay: Duration)
    where
        F: FnMut() -> DelayQueueAction + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push(Entry {
            deadline: Instant::now() + delay,
            seq,
            delay,
            task: Box::new(task),
        });
        drop(state);
        self.shared.wakeup.notify_one();
    }

    pub fn clear(&self) {
        // Tasks may own values with their own Drop; release them unlocked.
        let entries = std::mem::take(&mut self.shared.state.lock().entries);
        drop(entries);
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for DelayQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<Shared>, resolution: Duration) {
    let mut state = shared.state.lock();

    while state.running {
        let now = Instant::now();
        let next_deadline = state.entries.peek().map(|entry| entry.deadline);

        match next_deadline {
            Some(deadline) if deadline <= now => {
                if let Some(entry) = state.entries.pop() {
                    fire(&mut state, entry);
                }
            }
            Some(deadline) => {
                let wait = (deadline - now).min(resolution);
                shared.wakeup.wait_for(&mut state, wait);
            }
            None => {
                shared.wakeup.wait_for(&mut state, resolution);
            }
        }
    }
}

fn fire(state: &mut MutexGuard<'_, State>, mut entry: Entry) {
    let action = MutexGuard::unlocked(state, || (entry.task)());
    trace!(seq = entry.seq, ?action, "Delayed task fired");

    match action {
        DelayQueueAction::Repeat => {
            entry.deadline = Instant::now() + entry.delay;
            entry.seq = state.next_seq;
            state.next_seq += 1;
            state.entries.push(entry);
        }
        // Captured values may push new tasks when dropped.
        DelayQueueAction::Stop => MutexGuard::unlocked(state, || drop(entry)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    use super::*;
    use crate::test_support::wait_until;

    fn queue() -> DelayQueue {
        let queue = DelayQueue::new("DQtest", Duration::from_millis(5));
        queue.start().unwrap();
        queue
    }

    #[test]
    fn task_fires_once_after_delay() {
        let queue = queue();
        let fired = std::sync::Arc::new(AtomicUsize::new(0));
        let started = Instant::now();
        {
            let fired = fired.clone();
            queue.push(
                move || {
                    fired.fetch_add(1, AtomicOrdering::SeqCst);
                    DelayQueueAction::Stop
                },
                Duration::from_millis(30),
            );
        }

        assert!(wait_until(Duration::from_secs(2), || fired.load(AtomicOrdering::SeqCst) == 1));
        assert!(started.elapsed() >= Duration::from_millis(30));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn earlier_deadline_runs_first() {
        let queue = queue();
        let order = std::sync::Arc::new(Mutex::new(Vec::new()));
        for (label, delay) in [("late", 60), ("early", 10)] {
            let order = order.clone();
            queue.push(
                move || {
                    order.lock().push(label);
                    DelayQueueAction::Stop
                },
                Duration::from_millis(delay),
            );
        }

        assert!(wait_until(Duration::from_secs(2), || order.lock().len() == 2));
        assert_eq!(*order.lock(), vec!["early", "late"]);
    }

    #[test]
    fn repeating_task_runs_until_it_stops() {
        let queue = queue();
        let runs = std::sync::Arc::new(AtomicUsize::new(0));
        {
            let runs = runs.clone();
            queue.push(
                move || {
                    if runs.fetch_add(1, AtomicOrdering::SeqCst) + 1 < 3 {
                        DelayQueueAction::Repeat
                    } else {
                        DelayQueueAction::Stop
                    }
                },
                Duration::from_millis(5),
            );
        }

        assert!(wait_until(Duration::from_secs(2), || runs.load(AtomicOrdering::SeqCst) == 3));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(runs.load(AtomicOrdering::SeqCst), 3);
    }

    #[test]
    fn cleared_and_stopped_queues_fire_nothing() {
        let queue = queue();
        let fired = std::sync::Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let fired = fired.clone();
            queue.push(
                move || {
                    fired.fetch_add(1, AtomicOrdering::SeqCst);
                    DelayQueueAction::Stop
                },
                Duration::from_millis(20),
            );
        }
        assert_eq!(queue.len(), 2);
        queue.clear();
        assert!(queue.is_empty());

        let late = fired.clone();
        queue.push(
            move || {
                late.fetch_add(1, AtomicOrdering::SeqCst);
                DelayQueueAction::Stop
            },
            Duration::from_millis(20),
        );
        queue.stop();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(queue.len(), 1);
    }
}
