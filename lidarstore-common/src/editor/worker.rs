//! The background worker thread.
//!
//! The worker runs one task at a time in short slices. For each slice it takes the editor lock,
//! runs the task until the time budget of the slice is used up and then releases the lock again,
//! so that foreground calls get their turn.

use super::events::EditorEvent;
use super::{EditorError, EditorState};
use crate::action::Action;
use crate::query::{Query, QueryError, QueryState};
use crate::span;
use log::{debug, error};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Max number of points per [EditorEvent::ViewportPoints] event.
const VIEWPORT_BATCH_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum StepOutcome {
    Continue,
    Finished,
}

pub(super) enum Task {
    Viewport(ViewportTask),
    Action(Action),
}

/// Streams the points of the viewport query to the subscribers.
pub(super) struct ViewportTask {
    query: Query,
}

impl ViewportTask {
    pub fn new(query: Query) -> Self {
        ViewportTask { query }
    }

    fn step(
        &mut self,
        state: &mut EditorState,
        deadline: Instant,
        cancel: &AtomicBool,
    ) -> Result<StepOutcome, EditorError> {
        if self.query.state() == QueryState::New {
            self.query.exec().map_err(QueryError::from)?;
        }
        loop {
            if cancel.load(Ordering::Relaxed) || Instant::now() >= deadline {
                return Ok(StepOutcome::Continue);
            }
            let batch = self.query.next_batch(state.cache_mut(), VIEWPORT_BATCH_SIZE)?;
            if batch.is_empty() {
                state.emit(EditorEvent::ViewportFinished {
                    nr_points: self.query.nr_points_returned(),
                });
                return Ok(StepOutcome::Finished);
            }
            state.emit(EditorEvent::ViewportPoints(Arc::new(batch)));
        }
    }
}

impl Task {
    fn step(
        &mut self,
        state: &mut EditorState,
        deadline: Instant,
        cancel: &AtomicBool,
    ) -> Result<StepOutcome, EditorError> {
        match self {
            Task::Viewport(viewport) => viewport.step(state, deadline, cancel),
            Task::Action(action) => loop {
                if action.is_finished() {
                    state.emit(EditorEvent::ActionFinished {
                        action: action.name().to_string(),
                    });
                    return Ok(StepOutcome::Finished);
                }
                if cancel.load(Ordering::Relaxed) || Instant::now() >= deadline {
                    state.emit(EditorEvent::ActionProgress {
                        action: action.name().to_string(),
                        progress: action.progress(),
                    });
                    return Ok(StepOutcome::Continue);
                }
                action.next(state)?;
            },
        }
    }

    /// Releases everything the task holds in the editor state.
    fn release(&mut self, state: &mut EditorState) {
        match self {
            Task::Viewport(viewport) => viewport.query.cancel(state.cache_mut()),
            Task::Action(action) => {
                // pages the action already changed are kept
                if let Err(e) = state.cache_mut().flush() {
                    error!("Writing back the pages of {} failed: {e}", action.name());
                }
            }
        }
    }

    /// Stops the task before it finished. Cancelled actions are reported as
    /// [EditorEvent::ActionCancelled].
    fn cancel(&mut self, state: &mut EditorState) {
        self.release(state);
        if let Task::Action(action) = self {
            debug!("Cancelled action {}.", action.name());
            state.emit(EditorEvent::ActionCancelled {
                action: action.name().to_string(),
            });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Idle,
    Run,
    Cancel,
    Exit,
}

struct Control {
    command: Command,
    task: Option<Task>,
}

struct Shared {
    control: Mutex<Control>,
    condvar: Condvar,

    /// Set while a cancel is requested, so that a running slice can end early.
    cancel: AtomicBool,
}

pub(super) struct Worker {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

struct WorkerThread {
    shared: Arc<Shared>,
    state: Arc<Mutex<EditorState>>,
}

impl Worker {
    pub fn spawn(state: Arc<Mutex<EditorState>>) -> Self {
        let shared = Arc::new(Shared {
            control: Mutex::new(Control {
                command: Command::Idle,
                task: None,
            }),
            condvar: Condvar::new(),
            cancel: AtomicBool::new(false),
        });
        let worker_thread = WorkerThread {
            shared: Arc::clone(&shared),
            state,
        };
        let thread = thread::spawn(move || {
            tracy_client::set_thread_name("editor worker");
            worker_thread.run()
        });
        Worker {
            shared,
            thread: Some(thread),
        }
    }

    /// Replaces the current task.
    pub fn start(&self, task: Task) {
        self.cancel();
        let mut control = self.shared.control.lock().unwrap();
        if control.command == Command::Exit {
            return;
        }
        self.shared.cancel.store(false, Ordering::Relaxed);
        control.task = Some(task);
        control.command = Command::Run;
        self.shared.condvar.notify_all();
    }

    /// Cancels the current task. Blocks until the worker has released it.
    /// Must not be called while holding the editor lock.
    pub fn cancel(&self) {
        let mut control = self.shared.control.lock().unwrap();
        if control.command == Command::Exit || control.command == Command::Idle {
            return;
        }
        self.shared.cancel.store(true, Ordering::Relaxed);
        control.command = Command::Cancel;
        self.shared.condvar.notify_all();
        while control.command == Command::Cancel {
            control = self.shared.condvar.wait(control).unwrap();
        }
    }

    pub fn wait_idle(&self) {
        let mut control = self.shared.control.lock().unwrap();
        while matches!(control.command, Command::Run | Command::Cancel) {
            control = self.shared.condvar.wait(control).unwrap();
        }
    }

    pub fn is_idle(&self) -> bool {
        self.shared.control.lock().unwrap().command != Command::Run
    }

    /// Cancels the current task and stops the thread.
    pub fn stop(&mut self) {
        {
            let mut control = self.shared.control.lock().unwrap();
            self.shared.cancel.store(true, Ordering::Relaxed);
            control.command = Command::Exit;
            self.shared.condvar.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("The editor worker thread panicked.");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl WorkerThread {
    fn run(self) {
        while let Some(mut task) = self.next_task() {
            let outcome = {
                let _span = span!("WorkerThread::run: slice");
                let mut state = self.state.lock().unwrap();
                let deadline = Instant::now() + state.settings().worker_time_budget();
                match task.step(&mut state, deadline, &self.shared.cancel) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("Background task failed: {e}");
                        task.release(&mut state);
                        state.emit(EditorEvent::Error(e.to_string()));
                        StepOutcome::Finished
                    }
                }
            };

            let mut control = self.shared.control.lock().unwrap();
            match outcome {
                StepOutcome::Continue => control.task = Some(task),
                StepOutcome::Finished => {
                    if control.command == Command::Run {
                        control.command = Command::Idle;
                        self.shared.condvar.notify_all();
                    }
                }
            }
        }
    }

    /// Waits for a task to run. Cancel requests are handled on the way.
    /// Returns `None` when the thread should exit.
    fn next_task(&self) -> Option<Task> {
        let mut control = self.shared.control.lock().unwrap();
        loop {
            match control.command {
                Command::Idle => control = self.shared.condvar.wait(control).unwrap(),
                Command::Run => match control.task.take() {
                    Some(task) => return Some(task),
                    None => {
                        control.command = Command::Idle;
                        self.shared.condvar.notify_all();
                    }
                },
                Command::Cancel | Command::Exit => {
                    let exit = control.command == Command::Exit;
                    let task = control.task.take();
                    drop(control);
                    if let Some(mut task) = task {
                        task.cancel(&mut self.state.lock().unwrap());
                    }
                    if exit {
                        return None;
                    }
                    control = self.shared.control.lock().unwrap();
                    if control.command == Command::Cancel {
                        control.command = Command::Idle;
                        self.shared.cancel.store(false, Ordering::Relaxed);
                    }
                    self.shared.condvar.notify_all();
                }
            }
        }
    }
}
