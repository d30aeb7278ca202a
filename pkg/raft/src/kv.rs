//! An example key-value [`StateMachine`], provided only to demonstrate the
//! state-machine interface (the consensus engine is the specified core;
//! this module is not).
//!
//! Commands are JSON objects shaped like `{"op": "+", "key": "x", "val": 1}`,
//! grounded in `original_source/raft.py`'s own key-value demo
//! (`KeyValueVM.run`). Supported ops: `"+"` and `"set"` (both overwrite —
//! `"+"` is the original's only op, kept with its original overwrite
//! semantics rather than reinterpreted as a numeric increment; `"set"` is
//! a same-behavior alias, added because `"+"` reads oddly as an overwrite
//! name outside the original's own source), and `"delete"`. Queries are
//! the bare key string and return the stored value or `null`.

use std::collections::HashMap;

use serde_json::Value;

use crate::state_machine::StateMachine;

#[derive(Debug, Default)]
pub struct KeyValueStateMachine {
    data: HashMap<String, Value>,
}

impl KeyValueStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    fn apply_one(&mut self, command: &Value) {
        let op = command.get("op").and_then(Value::as_str).unwrap_or("");
        let key = match command.get("key").and_then(Value::as_str) {
            Some(k) => k.to_string(),
            None => return,
        };
        match op {
            "set" | "+" => {
                if let Some(val) = command.get("val") {
                    self.data.insert(key, val.clone());
                }
            }
            "delete" => {
                self.data.remove(&key);
            }
            _ => {}
        }
    }
}

impl StateMachine for KeyValueStateMachine {
    fn reset(&mut self, snapshot: Value) {
        self.data = match snapshot {
            Value::Object(map) => map.into_iter().collect(),
            _ => HashMap::new(),
        };
    }

    fn snapshot(&self) -> Value {
        Value::Object(self.data.clone().into_iter().collect())
    }

    fn apply(&mut self, commands: &[Value]) {
        for command in commands {
            self.apply_one(command);
        }
    }

    fn query(&self, query: &Value) -> Value {
        let key = match query.as_str() {
            Some(k) => k,
            None => match query.get("key").and_then(Value::as_str) {
                Some(k) => k,
                None => return Value::Null,
            },
        };
        self.data.get(key).cloned().unwrap_or(Value::Null)
    }
}
