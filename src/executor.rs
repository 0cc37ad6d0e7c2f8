//! Executor
//!
//! Runs a (copy of a) sequence on a worker thread while keeping a foreground
//! sequence object observably in sync. The worker communicates exclusively
//! through the communication channel: it pushes lifecycle messages into the
//! bounded queue and honors the termination flag. The foreground drains the
//! queue with [`Executor::update`] and mirrors the state onto its own
//! sequence copy.
//!
//! Message callbacks always run on the thread that calls `update()`: the
//! callback is removed from the context copy handed to the worker, and the
//! foreground re-invokes it for every drained message.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::comm::CommChannel;
use crate::context::{Context, VariableMap};
use crate::error::Error;
use crate::message::MessageType;
use crate::sequence::Sequence;
use crate::step::{Step, StepIndex};

/// Executes a sequence on a worker thread and mirrors its progress.
///
/// An executor drives at most one execution at a time. Destroying an
/// executor cancels and joins a still-running worker.
#[derive(Debug)]
pub struct Executor {
    comm_channel: Arc<CommChannel>,
    worker: Option<JoinHandle<VariableMap>>,
    context: Context,
}

impl Executor {
    /// Create an idle executor.
    pub fn new() -> Self {
        Self {
            comm_channel: Arc::new(CommChannel::new()),
            worker: None,
            context: Context::default(),
        }
    }

    /// Return the foreground copy of the context of the last launched
    /// execution. Once the worker has finished (observed via `update()`,
    /// `is_busy()`, or `cancel()`), the variables reflect the final state of
    /// the execution.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Start the execution of the sequence on a worker thread.
    ///
    /// Both the sequence and the context are copied; the foreground
    /// sequence is marked as running and is updated from worker messages on
    /// every call to [`update()`](Self::update).
    pub fn run_asynchronously(
        &mut self,
        sequence: &mut Sequence,
        context: Context,
    ) -> Result<(), Error> {
        self.launch_async_execution(sequence, context, None)
    }

    /// Start the execution of a single step of the sequence on a worker
    /// thread.
    pub fn run_single_step_asynchronously(
        &mut self,
        sequence: &mut Sequence,
        context: Context,
        step_index: StepIndex,
    ) -> Result<(), Error> {
        if usize::from(step_index) >= sequence.len() {
            return Err(Error::new(format!("Invalid step index {step_index}")));
        }
        self.launch_async_execution(sequence, context, Some(step_index))
    }

    fn launch_async_execution(
        &mut self,
        sequence: &mut Sequence,
        context: Context,
        step_index: Option<StepIndex>,
    ) -> Result<(), Error> {
        if self.worker.is_some() {
            return Err(Error::new("Busy executing another sequence"));
        }

        debug!(label = %sequence.label(), ?step_index, "launching worker");

        // Keep a copy with the caller's message callback; the worker copy
        // only uses the queue path.
        self.context = context.clone();
        let mut worker_context = context;
        worker_context.message_callback_function = None;

        let mut worker_sequence = sequence.clone();
        let comm = Arc::clone(&self.comm_channel);

        let handle = thread::Builder::new()
            .name("taskolib-worker".to_string())
            .spawn(move || {
                // The sequence takes care of sending the appropriate
                // messages; the outcome is reported through them.
                let _ = worker_sequence.execute(&mut worker_context, Some(&comm), step_index);
                worker_context.variables
            })
            .map_err(|e| Error::new(format!("Cannot start worker thread: {e}")))?;

        self.worker = Some(handle);
        sequence.set_running(true);
        sequence.set_error(None);
        Ok(())
    }

    /// Drain the message queue, mirroring all state changes onto the given
    /// sequence and invoking the context's message callback for each
    /// message.
    ///
    /// Returns true if the worker is still running afterwards. When the
    /// worker has finished, it is joined and its final variables are copied
    /// into the foreground context. Calling `update()` without a running or
    /// finished execution returns false.
    pub fn update(&mut self, sequence: &mut Sequence) -> bool {
        self.drain_messages(sequence);

        let busy = self.is_busy();
        if !busy {
            // Final messages can land between the first drain and the
            // worker's exit
            self.drain_messages(sequence);
        }
        busy
    }

    fn drain_messages(&mut self, sequence: &mut Sequence) {
        while let Some(msg) = self.comm_channel.queue.try_pop() {
            if let Some(callback) = &self.context.message_callback_function {
                callback(&msg);
            }

            match msg.message_type() {
                MessageType::Output => {}
                MessageType::SequenceStarted => {}
                MessageType::SequenceStopped => {
                    sequence.set_running(false);
                }
                MessageType::SequenceStoppedWithError => {
                    sequence.set_running(false);
                    sequence.set_error(Some(Error::with_index(msg.text(), msg.step_index())));
                }
                MessageType::StepStarted => {
                    let timestamp = msg.timestamp();
                    apply_to_step(sequence, msg.step_index(), move |step| {
                        step.set_running(true);
                        step.set_time_of_last_execution(Some(timestamp));
                    });
                }
                MessageType::StepStopped | MessageType::StepStoppedWithError => {
                    apply_to_step(sequence, msg.step_index(), |step| {
                        step.set_running(false);
                    });
                }
            }
        }
    }

    /// Determine whether a worker is still executing. A worker that has
    /// finished on its own is joined and its variables are taken over.
    pub fn is_busy(&mut self) -> bool {
        let still_running = self
            .worker
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        if still_running {
            return true;
        }

        if let Some(handle) = self.worker.take() {
            self.join_worker(handle);
        }
        false
    }

    /// Stop a running execution as quickly as possible, discarding pending
    /// messages. Cancelling an idle executor is a no-op.
    pub fn cancel(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };

        debug!("cancelling worker");
        self.comm_channel.request_termination();

        // Keep draining so the worker can never block on a full queue
        while !handle.is_finished() {
            while self.comm_channel.queue.try_pop().is_some() {}
            thread::sleep(Duration::from_millis(1));
        }
        while self.comm_channel.queue.try_pop().is_some() {}

        self.join_worker(handle);
        self.comm_channel.clear_termination_request();
    }

    /// Stop a running execution as quickly as possible, mirroring the final
    /// messages onto the given sequence before joining the worker.
    pub fn cancel_and_update(&mut self, sequence: &mut Sequence) {
        if self.worker.is_none() {
            return;
        }

        self.comm_channel.request_termination();
        while self.update(sequence) {
            thread::yield_now();
        }

        if let Some(handle) = self.worker.take() {
            self.join_worker(handle);
        }
        self.comm_channel.clear_termination_request();
    }

    fn join_worker(&mut self, handle: JoinHandle<VariableMap>) {
        match handle.join() {
            Ok(variables) => self.context.variables = variables,
            Err(_) => warn!("worker thread panicked"),
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Mirror a state change onto one step of the foreground sequence.
///
/// The sequence is marked as running during an asynchronous execution, which
/// blocks its mutation API; the flag is lowered for the duration of the
/// mirroring.
fn apply_to_step<F>(sequence: &mut Sequence, step_index: Option<StepIndex>, modification: F)
where
    F: FnOnce(&mut Step),
{
    let Some(idx) = step_index else {
        warn!("step message without step index");
        return;
    };

    let was_running = sequence.is_running();
    sequence.set_running(false);
    if let Err(e) = sequence.modify(usize::from(idx), modification) {
        warn!("cannot mirror step state: {e}");
    }
    sequence.set_running(was_running);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{VariableName, VariableValue};
    use crate::message::Message;
    use crate::step::StepType;
    use std::sync::Mutex;
    use std::time::Instant;

    fn step(step_type: StepType, script: &str, variables: &[&str]) -> Step {
        let mut step = Step::new(step_type);
        step.set_script(script);
        step.set_used_context_variable_names(
            variables
                .iter()
                .map(|n| VariableName::new(*n).unwrap())
                .collect(),
        );
        step
    }

    fn wait_until_finished(executor: &mut Executor, sequence: &mut Sequence) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while executor.update(sequence) {
            assert!(Instant::now() < deadline, "worker did not finish in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_update_without_execution_returns_false() {
        let mut executor = Executor::new();
        let mut sequence = Sequence::new("idle").unwrap();
        assert!(!executor.update(&mut sequence));
        assert!(!executor.is_busy());
    }

    #[test]
    fn test_cancel_on_idle_executor_is_noop() {
        let mut executor = Executor::new();
        executor.cancel();
        let mut sequence = Sequence::new("idle").unwrap();
        executor.cancel_and_update(&mut sequence);
    }

    #[test]
    fn test_run_asynchronously_roundtrip() {
        let mut sequence = Sequence::new("Async add").unwrap();
        sequence
            .push_back(step(StepType::Action, "a = a + 1", &["a"]))
            .unwrap();

        let mut context = Context::default();
        context
            .variables
            .insert(VariableName::new("a").unwrap(), VariableValue::Integer(1));

        let mut executor = Executor::new();
        executor.run_asynchronously(&mut sequence, context).unwrap();
        assert!(sequence.is_running());

        wait_until_finished(&mut executor, &mut sequence);

        assert!(!sequence.is_running());
        assert!(sequence.last_error().is_none());
        assert_eq!(
            executor.context().variables.get("a"),
            Some(&VariableValue::Integer(2))
        );
    }

    #[test]
    fn test_second_launch_is_rejected_while_busy() {
        let mut sequence = Sequence::new("Busy").unwrap();
        sequence
            .push_back(step(StepType::Action, "sleep(0.5)", &[]))
            .unwrap();

        let mut executor = Executor::new();
        executor
            .run_asynchronously(&mut sequence, Context::default())
            .unwrap();

        let err = executor
            .run_asynchronously(&mut sequence, Context::default())
            .unwrap_err();
        assert!(err.message().contains("Busy"));

        executor.cancel();
    }

    #[test]
    fn test_update_mirrors_step_state() {
        let mut sequence = Sequence::new("Mirror").unwrap();
        sequence
            .push_back(step(StepType::Action, "a = 1", &["a"]))
            .unwrap();
        assert!(sequence[0].time_of_last_execution().is_none());

        let mut executor = Executor::new();
        executor
            .run_asynchronously(&mut sequence, Context::default())
            .unwrap();
        wait_until_finished(&mut executor, &mut sequence);

        assert!(!sequence[0].is_running());
        assert!(sequence[0].time_of_last_execution().is_some());
    }

    #[test]
    fn test_update_invokes_message_callback_on_foreground() {
        let mut sequence = Sequence::new("Callback").unwrap();
        sequence
            .push_back(step(StepType::Action, "print('hi')", &[]))
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut context = Context::default();
        context.message_callback_function = Some(Arc::new(move |msg: &Message| {
            sink.lock().unwrap().push((msg.message_type(), msg.text().to_string()));
        }));

        let mut executor = Executor::new();
        executor.run_asynchronously(&mut sequence, context).unwrap();
        wait_until_finished(&mut executor, &mut sequence);

        let seen = seen.lock().unwrap();
        let types: Vec<MessageType> = seen.iter().map(|(t, _)| *t).collect();
        assert_eq!(
            types,
            [
                MessageType::SequenceStarted,
                MessageType::StepStarted,
                MessageType::Output,
                MessageType::StepStopped,
                MessageType::SequenceStopped,
            ]
        );
        assert_eq!(seen[2].1, "hi\n");
    }

    #[test]
    fn test_failed_sequence_reports_error_on_foreground() {
        let mut sequence = Sequence::new("Fails").unwrap();
        sequence
            .push_back(step(StepType::Action, "error('deliberate')", &[]))
            .unwrap();

        let mut executor = Executor::new();
        executor
            .run_asynchronously(&mut sequence, Context::default())
            .unwrap();
        wait_until_finished(&mut executor, &mut sequence);

        let error = sequence.last_error().unwrap();
        assert!(error.message().contains("deliberate"));
        assert_eq!(error.step_index(), Some(0));
    }

    #[test]
    fn test_cancel_stops_sleeping_worker_quickly() {
        let mut sequence = Sequence::new("Cancel").unwrap();
        sequence
            .push_back(step(StepType::While, "return true", &[]))
            .unwrap();
        sequence
            .push_back(step(StepType::Action, "sleep(0.001)", &[]))
            .unwrap();
        sequence.push_back(Step::new(StepType::End)).unwrap();

        let mut executor = Executor::new();
        executor
            .run_asynchronously(&mut sequence, Context::default())
            .unwrap();
        thread::sleep(Duration::from_millis(5));

        let start = Instant::now();
        executor.cancel_and_update(&mut sequence);
        assert!(start.elapsed() <= Duration::from_millis(200));

        assert!(!sequence.is_running());
        let error = sequence.last_error().unwrap();
        assert_eq!(error.message(), "Sequence aborted: Stop on user request");
    }

    #[test]
    fn test_cancel_without_sequence_discards_messages() {
        let mut sequence = Sequence::new("Plain cancel").unwrap();
        sequence
            .push_back(step(StepType::Action, "sleep(10)", &[]))
            .unwrap();

        let mut executor = Executor::new();
        executor
            .run_asynchronously(&mut sequence, Context::default())
            .unwrap();
        thread::sleep(Duration::from_millis(5));

        let start = Instant::now();
        executor.cancel();
        assert!(start.elapsed() <= Duration::from_millis(200));
        assert!(!executor.is_busy());

        // A new run can be launched afterwards
        sequence.set_running(false);
        executor
            .run_asynchronously(&mut sequence, Context::default())
            .unwrap();
        wait_until_finished(&mut executor, &mut sequence);
    }

    #[test]
    fn test_worker_keeps_producing_when_foreground_lags() {
        // More output than the queue can hold; update() must still see
        // every message in order
        let mut sequence = Sequence::new("Chatty").unwrap();
        sequence
            .push_back(step(
                StepType::Action,
                "for i = 1, 100 do print(i) end",
                &[],
            ))
            .unwrap();

        let counter = Arc::new(Mutex::new(0u32));
        let sink = Arc::clone(&counter);
        let mut context = Context::default();
        context.message_callback_function = Some(Arc::new(move |msg: &Message| {
            if msg.message_type() == MessageType::Output {
                *sink.lock().unwrap() += 1;
            }
        }));

        let mut executor = Executor::new();
        executor.run_asynchronously(&mut sequence, context).unwrap();
        wait_until_finished(&mut executor, &mut sequence);

        assert_eq!(*counter.lock().unwrap(), 100);
        assert!(sequence.last_error().is_none());
    }

    #[test]
    fn test_run_single_step_asynchronously() {
        let mut sequence = Sequence::new("Single").unwrap();
        sequence
            .push_back(step(StepType::Action, "a = a + 1", &["a"]))
            .unwrap();
        sequence
            .push_back(step(StepType::Action, "a = a + 10", &["a"]))
            .unwrap();

        let mut context = Context::default();
        context
            .variables
            .insert(VariableName::new("a").unwrap(), VariableValue::Integer(0));

        let mut executor = Executor::new();
        executor
            .run_single_step_asynchronously(&mut sequence, context, 1)
            .unwrap();
        wait_until_finished(&mut executor, &mut sequence);

        assert_eq!(
            executor.context().variables.get("a"),
            Some(&VariableValue::Integer(10))
        );
    }

    #[test]
    fn test_run_single_step_rejects_invalid_index() {
        let mut sequence = Sequence::new("Single").unwrap();
        sequence.push_back(Step::new(StepType::Action)).unwrap();

        let mut executor = Executor::new();
        let err = executor
            .run_single_step_asynchronously(&mut sequence, Context::default(), 1)
            .unwrap_err();
        assert!(err.message().contains("Invalid step index 1"));
        assert!(!sequence.is_running());
    }

    #[test]
    fn test_drop_joins_running_worker() {
        let mut sequence = Sequence::new("Dropped").unwrap();
        sequence
            .push_back(step(StepType::Action, "sleep(10)", &[]))
            .unwrap();

        let start = Instant::now();
        {
            let mut executor = Executor::new();
            executor
                .run_asynchronously(&mut sequence, Context::default())
                .unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
