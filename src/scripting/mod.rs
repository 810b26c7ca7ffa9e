pub mod api;
pub mod dispatch;
pub mod proxy;
pub mod value;
pub mod vm;

use serde::{Deserialize, Serialize};

use crate::component::ComponentKey;
use crate::entity::EntityKey;

pub const DEFAULT_SCRIPT_BUDGET_MS: u64 = 8;
pub const DEFAULT_SCRIPT_HOOK_INSTRUCTION_INTERVAL: u32 = 10_000;
pub const DEFAULT_SCRIPT_MAX_INSTRUCTIONS: u64 = 5_000_000;
pub const DEFAULT_MARSHAL_DEPTH: usize = 16;
/// Calls to an uncached method before its handle is kept.
pub const HOT_METHOD_THRESHOLD: u32 = 2;

const MAX_SCRIPT_ERRORS: usize = 100;

pub use dispatch::{CallOutcome, DispatchCache, Lifecycle};
pub use value::ScriptValue;
pub use vm::ScriptLibrary;

/// Native object reachable from script.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Handle {
    Entity(EntityKey),
    Component(ComponentKey),
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ScriptError {
    pub script_name: String,
    pub entity_id: Option<String>,
    pub error_message: String,
    pub tick: u64,
}

#[derive(Default)]
pub struct ScriptErrors {
    pub entries: Vec<ScriptError>,
    pub total: u64,
}

impl ScriptErrors {
    pub fn push(&mut self, entry: ScriptError) {
        self.total = self.total.saturating_add(1);
        self.entries.push(entry);
        if self.entries.len() > MAX_SCRIPT_ERRORS {
            let excess = self.entries.len() - MAX_SCRIPT_ERRORS;
            self.entries.drain(0..excess);
        }
    }
}
