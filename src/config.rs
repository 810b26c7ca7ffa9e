use serde::{Deserialize, Serialize};

use crate::scripting::{
    DEFAULT_MARSHAL_DEPTH, DEFAULT_SCRIPT_BUDGET_MS, DEFAULT_SCRIPT_HOOK_INSTRUCTION_INTERVAL,
    DEFAULT_SCRIPT_MAX_INSTRUCTIONS,
};
use crate::world::DEFAULT_COMPONENT_CAPACITY;

/// Per-call limits for script execution. Exceeding either budget aborts the
/// in-flight call only.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptLimits {
    pub budget_ms: u64,
    pub instruction_interval: u32,
    pub max_instructions: u64,
    pub marshal_depth: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            budget_ms: DEFAULT_SCRIPT_BUDGET_MS,
            instruction_interval: DEFAULT_SCRIPT_HOOK_INSTRUCTION_INTERVAL,
            max_instructions: DEFAULT_SCRIPT_MAX_INSTRUCTIONS,
            marshal_depth: DEFAULT_MARSHAL_DEPTH,
        }
    }
}

impl ScriptLimits {
    /// Environment variables win over file values.
    pub fn with_env_overrides(self) -> Self {
        Self {
            budget_ms: env_u64("PIXIE_SCRIPT_BUDGET_MS", self.budget_ms).max(1),
            instruction_interval: env_u64(
                "PIXIE_SCRIPT_HOOK_INSTRUCTION_INTERVAL",
                self.instruction_interval as u64,
            )
            .clamp(100, 1_000_000) as u32,
            max_instructions: env_u64("PIXIE_SCRIPT_MAX_INSTRUCTIONS", self.max_instructions)
                .max(1),
            marshal_depth: self.marshal_depth.max(1),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tick_hz: f64,
    pub scripts_dir: String,
    pub boot_script: Option<String>,
    pub component_capacity: usize,
    pub headless: bool,
    pub window_title: String,
    pub window_width: f32,
    pub window_height: f32,
    pub background_color: [f32; 3],
    pub debug_colliders: bool,
    pub script_limits: ScriptLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_hz: 60.0,
            scripts_dir: "scripts".to_string(),
            boot_script: None,
            component_capacity: DEFAULT_COMPONENT_CAPACITY,
            headless: false,
            window_title: "Pixie".to_string(),
            window_width: 960.0,
            window_height: 540.0,
            background_color: [0.08, 0.08, 0.12],
            debug_colliders: false,
            script_limits: ScriptLimits::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(contents: &str) -> Result<Self, String> {
        serde_json::from_str::<EngineConfig>(contents).map_err(|e| e.to_string())
    }
}

/// Reads `PIXIE_CONFIG` (default `pixie.json`). A missing file yields
/// defaults; a malformed one is reported and ignored.
pub fn load_engine_config() -> EngineConfig {
    let path = std::env::var("PIXIE_CONFIG")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "pixie.json".to_string());
    let mut config = match std::fs::read_to_string(&path) {
        Ok(contents) => match EngineConfig::from_json(&contents) {
            Ok(cfg) => {
                println!("[Pixie] Loaded engine config from {}", path);
                cfg
            }
            Err(e) => {
                eprintln!("[Pixie] Failed to parse {}: {}", path, e);
                EngineConfig::default()
            }
        },
        Err(_) => EngineConfig::default(),
    };
    if let Some(dir) = std::env::var("PIXIE_SCRIPTS_DIR")
        .ok()
        .filter(|s| !s.is_empty())
    {
        config.scripts_dir = dir;
    }
    config.script_limits = config.script_limits.with_env_overrides();
    config.tick_hz = config.tick_hz.clamp(1.0, 1000.0);
    config
}
