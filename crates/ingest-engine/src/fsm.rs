//! Table-driven retrying state machine.
//!
//! States are data: each [`StateDef`] names the states it may be entered
//! from, how to compute the next state from the context, what to do on
//! entry and how many times it may be re-entered in a row.

use std::fmt;

use tracing::{debug, trace};

use ingest_proto::{StateSet, StreamState, Timestamp};

use crate::error::StreamError;
use crate::StreamResult;

/// Retry budget meaning "never give up".
pub const INFINITE_RETRY_COUNT_SENTINEL: u32 = 0;

/// A state identifier usable by [`StateMachine`].
pub trait MachineState: Copy + Eq + fmt::Debug + fmt::Display {
    /// Set type used for accept masks.
    type Set: Copy + fmt::Debug;

    fn is_in(self, set: Self::Set) -> bool;
}

impl MachineState for StreamState {
    type Set = StateSet;

    fn is_in(self, set: StateSet) -> bool {
        set.contains(self)
    }
}

/// One row of the state table.
pub struct StateDef<S: MachineState, C> {
    pub state: S,

    /// States this one may be entered from, itself included when it retries.
    pub accept_from: S::Set,

    /// Compute the state to move to.
    pub next_state: fn(&C) -> StreamResult<S>,

    /// Run on entry and on every retry.
    pub execute: fn(&mut C, Timestamp) -> StreamResult<()>,

    /// Consecutive re-entries allowed. [`INFINITE_RETRY_COUNT_SENTINEL`] disables the limit.
    pub max_retries: u32,

    /// Error reported once the budget is exceeded.
    pub retry_error: fn(&C) -> StreamError,
}

/// Retrying state machine over a flat table.
///
/// Not synchronized; the owner serializes access.
pub struct StateMachine<S: MachineState, C> {
    table: Vec<StateDef<S, C>>,
    current: S,
    retry_count: u32,
}

impl<S: MachineState, C> StateMachine<S, C> {
    /// Create a machine positioned at `initial` without executing it.
    pub fn new(table: Vec<StateDef<S, C>>, initial: S) -> StreamResult<Self> {
        let machine = Self {
            table,
            current: initial,
            retry_count: 0,
        };
        machine.def(initial)?;
        Ok(machine)
    }

    fn def(&self, state: S) -> StreamResult<&StateDef<S, C>> {
        self.table
            .iter()
            .find(|def| def.state == state)
            .ok_or_else(|| StreamError::InvalidStateTransition {
                from: self.current.to_string(),
                to: state.to_string(),
            })
    }

    pub fn current_state(&self) -> S {
        self.current
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn reset_retry_count(&mut self) {
        self.retry_count = 0;
    }

    /// Advance once: compute the next state, then execute it.
    ///
    /// Returns the state the machine is in afterwards.
    pub fn step(&mut self, ctx: &mut C, now: Timestamp) -> StreamResult<S> {
        let next = (self.def(self.current)?.next_state)(ctx)?;
        let (accept_from, max_retries, retry_error, execute) = {
            let def = self.def(next)?;
            (def.accept_from, def.max_retries, def.retry_error, def.execute)
        };

        if !self.current.is_in(accept_from) {
            return Err(StreamError::InvalidStateTransition {
                from: self.current.to_string(),
                to: next.to_string(),
            });
        }

        if next == self.current {
            // Unbounded states re-enter on every poll and are never counted.
            if max_retries != INFINITE_RETRY_COUNT_SENTINEL {
                self.retry_count += 1;
                if self.retry_count > max_retries {
                    debug!(state = %next, retries = self.retry_count, "Retries exhausted");
                    return Err(retry_error(ctx));
                }
            }
            trace!(state = %next, retry = self.retry_count, "Re-entering state");
        } else {
            debug!(from = %self.current, to = %next, "State transition");
            self.retry_count = 0;
        }

        self.current = next;
        execute(ctx, now)?;
        Ok(next)
    }

    /// Force the current state without executing it.
    pub fn accept_state(&mut self, state: S) -> StreamResult<()> {
        let def = self.def(state)?;
        if !self.current.is_in(def.accept_from) {
            return Err(StreamError::InvalidStateTransition {
                from: self.current.to_string(),
                to: state.to_string(),
            });
        }

        debug!(from = %self.current, to = %state, "Accepting state");
        self.current = state;
        self.retry_count = 0;
        Ok(())
    }

    /// Fail unless the current state is in `states`.
    pub fn check_accepted(&self, states: S::Set) -> StreamResult<()>
    where
        S: Into<StreamState>,
    {
        if self.current.is_in(states) {
            Ok(())
        } else {
            Err(StreamError::NotAcceptedInState(self.current.into()))
        }
    }
}
