use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestrationError, Result};

/// Bounds shared by every state and event enumeration driven by a [`StateMachine`].
pub trait Symbol: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

impl<T> Symbol for T where
    T: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
}

/// Side-effect tag attached to a transition.
///
/// Tags never alter control flow; listeners consume them on a side channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Impact {
    /// The transition must be reported to usage accounting.
    Usage,
}

/// One immutable edge: `(from, event) -> (to, impacts)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S, E> {
    pub from: S,
    pub event: E,
    pub to: S,
    pub impacts: &'static [Impact],
}

impl<S, E> Transition<S, E> {
    pub const fn new(from: S, event: E, to: S) -> Self {
        Self {
            from,
            event,
            to,
            impacts: &[],
        }
    }

    /// An edge that must be reported to usage accounting.
    pub const fn usage(from: S, event: E, to: S) -> Self {
        Self {
            from,
            event,
            to,
            impacts: &[Impact::Usage],
        }
    }

    pub fn has_impact(&self, impact: Impact) -> bool {
        self.impacts.contains(&impact)
    }
}

impl<S: fmt::Display, E: fmt::Display> fmt::Display for Transition<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} --{}--> {}", self.from, self.event, self.to)?;
        if !self.impacts.is_empty() {
            let tags: Vec<String> = self.impacts.iter().map(|i| format!("{i:?}")).collect();
            write!(f, " [{}]", tags.join(", "))?;
        }
        Ok(())
    }
}

/// A declarative transition table, built once and never mutated afterwards.
///
/// Lookups are exact `(state, event)` matches. There is no wildcard and no
/// priority ordering, so registering the same pair twice is rejected.
#[derive(Debug)]
pub struct StateMachine<S, E> {
    name: &'static str,
    transitions: Vec<Transition<S, E>>,
    index: HashMap<(S, E), usize>,
}

impl<S: Symbol, E: Symbol> StateMachine<S, E> {
    /// Build the table, failing on a duplicate `(state, event)` pair.
    pub fn try_from_table(name: &'static str, table: &[Transition<S, E>]) -> Result<Self> {
        let mut index = HashMap::with_capacity(table.len());
        for (position, transition) in table.iter().enumerate() {
            if let Some(previous) = index.insert((transition.from, transition.event), position) {
                return Err(OrchestrationError::Unexpected(format!(
                    "{name}: duplicate transition for ({}, {}): '{}' and '{}'",
                    transition.from, transition.event, table[previous], transition
                )));
            }
        }
        Ok(Self {
            name,
            transitions: table.to_vec(),
            index,
        })
    }

    /// Build a static table. A duplicate registration is a programming error
    /// and aborts at startup.
    pub fn from_table(name: &'static str, table: &[Transition<S, E>]) -> Self {
        match Self::try_from_table(name, table) {
            Ok(machine) => machine,
            Err(err) => panic!("invalid state machine table: {err}"),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Look up the edge registered for `(from, event)`.
    pub fn transition(&self, from: S, event: E) -> Result<&Transition<S, E>> {
        self.index
            .get(&(from, event))
            .map(|&position| &self.transitions[position])
            .ok_or_else(|| OrchestrationError::NoTransition {
                machine: self.name.to_string(),
                state: from.to_string(),
                event: event.to_string(),
            })
    }

    pub fn next_state(&self, from: S, event: E) -> Result<S> {
        self.transition(from, event).map(|t| t.to)
    }

    pub fn accepts(&self, from: S, event: E) -> bool {
        self.index.contains_key(&(from, event))
    }

    /// Events accepted in `state`, in registration order.
    pub fn events_from(&self, state: S) -> Vec<E> {
        self.transitions
            .iter()
            .filter(|t| t.from == state)
            .map(|t| t.event)
            .collect()
    }

    /// All edges, in registration order.
    pub fn transitions(&self) -> &[Transition<S, E>] {
        &self.transitions
    }
}
