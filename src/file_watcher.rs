use bevy::prelude::*;
use crossbeam_channel::Receiver;
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};

use crate::engine::{BootScript, Engine};

/// Hot reload for `*.lua` files under the scripts directory.
pub struct FileWatcherPlugin {
    pub scripts_dir: String,
}

pub enum FileWatchEvent {
    ScriptChanged { name: String, source: String },
    ScriptRemoved(String),
}

#[derive(Resource)]
pub struct FileWatcherReceiver(pub Receiver<FileWatchEvent>);

impl Plugin for FileWatcherPlugin {
    fn build(&self, app: &mut App) {
        let (tx, rx) = crossbeam_channel::unbounded::<FileWatchEvent>();
        app.insert_resource(FileWatcherReceiver(rx));

        let scripts_dir = PathBuf::from(&self.scripts_dir);
        std::thread::spawn(move || {
            run_watcher(tx, scripts_dir);
        });

        app.add_systems(Update, process_file_watch_events);
    }
}

fn run_watcher(tx: crossbeam_channel::Sender<FileWatchEvent>, scripts_path: PathBuf) {
    let scripts_path_clone = scripts_path.clone();
    let mut watcher: RecommendedWatcher =
        match notify::recommended_watcher(move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                handle_fs_event(event, &tx, &scripts_path_clone);
            }
        }) {
            Ok(w) => w,
            Err(e) => {
                eprintln!("[Pixie FileWatcher] Failed to create watcher: {e}");
                return;
            }
        };

    if !scripts_path.exists() {
        eprintln!(
            "[Pixie FileWatcher] Scripts dir {} does not exist; hot reload disabled",
            scripts_path.display()
        );
        return;
    }
    if let Err(e) = watcher.watch(&scripts_path, RecursiveMode::Recursive) {
        eprintln!("[Pixie FileWatcher] Failed to watch scripts dir: {e}");
        return;
    }
    println!(
        "[Pixie FileWatcher] Watching scripts: {}",
        scripts_path.display()
    );

    // The watcher stops when dropped, so this thread parks for the app lifetime.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
    }
}

fn script_name(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("lua") {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
}

fn handle_fs_event(
    event: NotifyEvent,
    tx: &crossbeam_channel::Sender<FileWatchEvent>,
    scripts_dir: &Path,
) {
    let removed = matches!(event.kind, EventKind::Remove(_));
    if !removed && !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return;
    }

    for path in &event.paths {
        if !removed && !path_is_under(path, scripts_dir) {
            continue;
        }
        let Some(name) = script_name(path) else {
            continue;
        };
        if removed {
            let _ = tx.send(FileWatchEvent::ScriptRemoved(name));
        } else if let Ok(source) = std::fs::read_to_string(path) {
            let _ = tx.send(FileWatchEvent::ScriptChanged { name, source });
        }
    }
}

fn path_is_under(path: &Path, dir: &Path) -> bool {
    let cp = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let cd = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    cp.starts_with(&cd)
}

fn process_file_watch_events(
    watcher: Option<Res<FileWatcherReceiver>>,
    engine: Option<NonSend<Engine>>,
    boot: Option<Res<BootScript>>,
) {
    let (Some(watcher), Some(engine)) = (watcher, engine) else {
        return;
    };

    for event in watcher.0.try_iter().take(16) {
        match event {
            FileWatchEvent::ScriptChanged { name, source }
                if boot.as_ref().is_some_and(|b| b.0 == name) =>
            {
                if let Err(e) = engine.restart_scene(&name, &source) {
                    warn!("[Pixie FileWatcher] Boot script '{name}' failed on reload: {e}");
                }
            }
            FileWatchEvent::ScriptChanged { name, source } => {
                if let Err(e) = engine.reload_script(&name, source) {
                    warn!("[Pixie FileWatcher] Script reload failed for '{name}': {e}");
                }
            }
            // Removal keeps the last good source so live instances keep running.
            FileWatchEvent::ScriptRemoved(name) => {
                info!("[Pixie FileWatcher] Script file removed: {name}");
            }
        }
    }
}
