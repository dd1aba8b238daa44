//! Event-driven engine that runs a state machine to a terminal state

use std::collections::VecDeque;
use std::fmt::Debug;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::deploy::states::Event;
use crate::errors::AgentError;

/// FIFO of events posted by the state being entered
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    pub fn post(&mut self, event: Event) {
        self.events.push_back(event);
    }

    fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// What the engine needs from a concrete machine
#[async_trait]
pub trait StateMachine: Send {
    type State: Copy + Eq + Debug + Send + Sync;

    fn transition(&self, state: Self::State, event: Event) -> Result<Self::State, AgentError>;

    /// Persisted name written before the state runs, for checkpoint states
    fn checkpoint_name(&self, state: Self::State) -> Option<&'static str>;

    /// Failure-path states proceed even if their checkpoint cannot be written
    fn is_failure_path(&self, state: Self::State) -> bool;

    async fn save_checkpoint(
        &mut self,
        state: Self::State,
        name: &'static str,
    ) -> Result<(), AgentError>;

    /// Run the state's action, posting one or more events
    async fn on_enter(&mut self, state: Self::State, events: &mut EventQueue);

    /// Every posted event passes through here before any transition
    fn observe(&mut self, _event: Event) {}
}

pub struct Orchestrator<M: StateMachine> {
    machine: M,
    events: EventQueue,
}

impl<M: StateMachine> Orchestrator<M> {
    pub fn new(machine: M) -> Self {
        Self {
            machine,
            events: EventQueue::default(),
        }
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn into_machine(self) -> M {
        self.machine
    }

    /// Run from `start` until a state posts no further transition.
    ///
    /// Returns the terminal state. An event with no transition from the
    /// current state is a programming error and aborts the run.
    pub async fn run(&mut self, start: M::State) -> Result<M::State, AgentError> {
        let mut state = start;
        loop {
            self.enter(state).await;

            let mut next = None;
            while let Some(event) = self.events.pop() {
                self.machine.observe(event);
                if event.is_tracking_signal() {
                    continue;
                }
                if next.is_some() {
                    return Err(AgentError::Internal(format!(
                        "{:?} posted {:?} after already transitioning",
                        state, event
                    )));
                }
                let to = self.machine.transition(state, event)?;
                info!("State transition: {:?} [{:?}] -> {:?}", state, event, to);
                next = Some(to);
            }

            match next {
                Some(to) => state = to,
                None => {
                    debug!("Terminal state reached: {:?}", state);
                    return Ok(state);
                }
            }
        }
    }

    async fn enter(&mut self, state: M::State) {
        if let Some(name) = self.machine.checkpoint_name(state) {
            match self.machine.save_checkpoint(state, name).await {
                Ok(()) => {}
                Err(e) if e.is_state_loop() => {
                    error!("{}", e);
                    self.events.post(Event::StateLoopDetected);
                    return;
                }
                Err(e) if !self.machine.is_failure_path(state) => {
                    error!("Could not save state data for {:?}: {}", state, e);
                    self.events.post(Event::Failure);
                    return;
                }
                Err(e) => {
                    warn!(
                        "Could not save state data for {:?}, continuing the failure path: {}",
                        state, e
                    );
                }
            }
        }
        self.machine.on_enter(state, &mut self.events).await;
    }
}
