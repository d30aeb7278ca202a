//! The pluggable state-machine contract driven by the committed log.
//!
//! The node calls [`StateMachine::apply`] once per batch of newly
//! committed entries, in index order, and otherwise never touches the
//! state machine except via [`StateMachine::reset`] (on load, and when
//! installing a follower-side snapshot) and [`StateMachine::snapshot`]
//! (when the leader compacts its own log).

use serde_json::Value;

pub trait StateMachine: Send {
    /// Replaces in-memory state with the given opaque snapshot value.
    fn reset(&mut self, snapshot: Value);

    /// Returns a serializable image of the current state.
    fn snapshot(&self) -> Value;

    /// Applies an ordered batch of committed command payloads.
    fn apply(&mut self, commands: &[Value]);

    /// Answers a read-only query; must never mutate state.
    fn query(&self, query: &Value) -> Value;
}
