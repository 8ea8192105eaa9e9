//! Single-thread cooperative executor for script threads.
//!
//! Script threads are ordinary futures. They run until they await something
//! (a hook, [`yield_now`], a [`Sleep`]) and the executor polls whichever task
//! was woken next, in wake order. There is no tick: an idle executor parks
//! until a task is woken or the earliest timer is due.

use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::task::{waker_ref, ArcWake};
use futures::FutureExt;

use parking_lot::{Condvar, Mutex};
use slab::Slab;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

pub use futures::channel::oneshot::Canceled;

/// Owns the task queue. Drive it from one thread with
/// [`Executor::run_until_stalled`] and [`Executor::park_until_deadline_or_woken`],
/// or with [`Executor::run_until`].
#[derive(Clone, Default)]
pub struct Executor {
    shared: Arc<Shared>,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Handle {
        Handle {
            shared: self.shared.clone(),
        }
    }

    /// Poll woken tasks until none is left ready. Returns the number of polls.
    pub fn run_until_stalled(&self) -> usize {
        let mut polls = 0;
        loop {
            self.shared.fire_due_timers(Instant::now());
            let Some(id) = self.shared.next_ready() else {
                return polls;
            };
            self.shared.poll(id);
            polls += 1;
        }
    }

    /// Drive the executor until `join` resolves.
    ///
    /// Fails with `Canceled` if the task was dropped, or if nothing is ready
    /// and no timer is pending, since then nothing could ever wake it.
    pub fn run_until<T>(&self, mut join: JoinHandle<T>) -> Result<T, Canceled> {
        loop {
            self.run_until_stalled();
            if let Some(out) = join.try_take() {
                return out;
            }
            if self.next_deadline().is_none() && !self.shared.any_ready() {
                log::warn!("executor stalled with {} pending task(s)", self.task_count());
                return Err(Canceled);
            }
            self.park_until_deadline_or_woken();
        }
    }

    /// The earliest pending timer, for callers running their own event loop.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.shared.timers.lock().peek().map(|t| t.0.deadline)
    }

    /// Block until a task is woken or the earliest timer is due.
    pub fn park_until_deadline_or_woken(&self) {
        self.shared.park();
    }

    /// Tasks spawned and not yet completed.
    pub fn task_count(&self) -> usize {
        self.shared.tasks.lock().len()
    }
}

/// Spawns tasks and creates timers. Cheap to clone.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    pub fn spawn<F, T>(&self, fut: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let body = async move {
            // the receiver may be gone; the result is then discarded
            let _ = tx.send(fut.await);
        };
        let id = self.shared.add_task(body.boxed());
        self.shared.push_ready(id);
        JoinHandle { rx }
    }

    pub fn sleep(&self, dur: Duration) -> Sleep {
        Sleep {
            shared: self.shared.clone(),
            deadline: Instant::now() + dur,
            armed: false,
        }
    }
}

/// Resolves to the spawned future's output.
pub struct JoinHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> JoinHandle<T> {
    /// The output, if the task has finished (or was dropped).
    pub fn try_take(&mut self) -> Option<Result<T, Canceled>> {
        self.rx.try_recv().transpose()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, Canceled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx.poll_unpin(cx)
    }
}

/// Let every other ready task run once before continuing.
pub async fn yield_now() {
    let mut yielded = false;
    futures::future::poll_fn(move |cx| {
        if yielded {
            Poll::Ready(())
        } else {
            yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    })
    .await
}

/// Completes once its deadline has passed.
pub struct Sleep {
    shared: Arc<Shared>,
    deadline: Instant,
    armed: bool,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if Instant::now() >= self.deadline {
            return Poll::Ready(());
        }
        if !self.armed {
            let deadline = self.deadline;
            self.shared.add_timer(deadline, cx.waker().clone());
            self.armed = true;
        }
        Poll::Pending
    }
}

#[derive(Default)]
struct Shared {
    tasks: Mutex<Slab<Arc<TaskCell>>>,
    ready: Mutex<VecDeque<usize>>,
    timers: Mutex<BinaryHeap<Reverse<Timer>>>,
    wakeup: Condvar,
    ready_hint: AtomicBool,
}

impl Shared {
    fn add_task(self: &Arc<Self>, fut: BoxFuture<'static, ()>) -> usize {
        let mut tasks = self.tasks.lock();
        let slot = tasks.vacant_entry();
        let id = slot.key();
        slot.insert(Arc::new(TaskCell {
            shared: self.clone(),
            id,
            future: Mutex::new(Some(fut)),
            scheduled: AtomicBool::new(true),
        }));
        id
    }

    fn any_ready(&self) -> bool {
        self.ready_hint.load(Ordering::Acquire)
    }

    fn push_ready(&self, id: usize) {
        self.ready.lock().push_back(id);
        self.ready_hint.store(true, Ordering::Release);
        self.wakeup.notify_one();
    }

    fn next_ready(&self) -> Option<usize> {
        let mut ready = self.ready.lock();
        let id = ready.pop_front();
        self.ready_hint.store(!ready.is_empty(), Ordering::Release);
        id
    }

    fn poll(&self, id: usize) {
        let Some(task) = self.tasks.lock().get(id).cloned() else {
            return;
        };
        // a wake during the poll below must queue the task again
        task.scheduled.store(false, Ordering::Release);

        let mut slot = task.future.lock();
        let Some(fut) = slot.as_mut() else {
            return;
        };
        let waker = waker_ref(&task);
        let mut cx = Context::from_waker(&waker);
        if fut.as_mut().poll(&mut cx).is_ready() {
            *slot = None;
            self.tasks.lock().try_remove(id);
        }
    }

    fn add_timer(&self, deadline: Instant, waker: Waker) {
        self.timers.lock().push(Reverse(Timer { deadline, waker }));
        self.wakeup.notify_one();
    }

    fn fire_due_timers(&self, now: Instant) {
        let due: Vec<Waker> = {
            let mut timers = self.timers.lock();
            let mut due = Vec::new();
            while timers.peek().is_some_and(|t| t.0.deadline <= now) {
                if let Some(Reverse(timer)) = timers.pop() {
                    due.push(timer.waker);
                }
            }
            due
        };
        due.into_iter().for_each(Waker::wake);
    }

    fn park(&self) {
        loop {
            self.fire_due_timers(Instant::now());
            let deadline = self.timers.lock().peek().map(|t| t.0.deadline);

            // the ready queue's lock guards the wait
            let mut ready = self.ready.lock();
            if !ready.is_empty() {
                return;
            }
            match deadline {
                None => {
                    self.wakeup.wait(&mut ready);
                    if !ready.is_empty() {
                        return;
                    }
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline > now {
                        self.wakeup.wait_for(&mut ready, deadline - now);
                    }
                }
            }
        }
    }
}

struct TaskCell {
    shared: Arc<Shared>,
    id: usize,
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    scheduled: AtomicBool,
}

impl ArcWake for TaskCell {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if !arc_self.scheduled.swap(true, Ordering::AcqRel) {
            arc_self.shared.push_ready(arc_self.id);
        }
    }
}

struct Timer {
    deadline: Instant,
    waker: Waker,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}
