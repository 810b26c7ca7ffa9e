mod arena;
mod bus;
mod collision;
mod component;
mod config;
mod engine;
mod entity;
mod file_watcher;
mod geometry;
mod ownership;
mod render;
mod scripting;
mod world;

use bevy::prelude::*;

#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    headless: bool,
    ticks: Option<u64>,
    boot_script: Option<String>,
    publish: Vec<(String, serde_json::Value)>,
}

/// `topic=json`, e.g. `score={"points":3}`.
fn parse_message(arg: &str) -> Result<(String, serde_json::Value), String> {
    let (topic, json) = arg
        .split_once('=')
        .ok_or_else(|| format!("--publish {arg}: expected topic=json"))?;
    if topic.is_empty() {
        return Err(format!("--publish {arg}: empty topic"));
    }
    let value = serde_json::from_str(json).map_err(|e| format!("--publish {topic}: {e}"))?;
    Ok((topic.to_string(), value))
}

fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut cli = CliArgs::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--headless" => cli.headless = true,
            "--ticks" => {
                let value = iter.next().ok_or("--ticks needs a count")?;
                let ticks = value
                    .parse::<u64>()
                    .map_err(|e| format!("--ticks {value}: {e}"))?;
                cli.ticks = Some(ticks);
            }
            "--publish" => {
                let value = iter.next().ok_or("--publish needs topic=json")?;
                cli.publish.push(parse_message(value)?);
            }
            flag if flag.starts_with("--") => return Err(format!("unknown flag {flag}")),
            script => cli.boot_script = Some(script.to_string()),
        }
    }
    Ok(cli)
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("[Pixie] {e}");
            eprintln!("usage: pixie [--headless] [--ticks N] [--publish TOPIC=JSON]... [boot_script]");
            std::process::exit(2);
        }
    };

    let mut config = config::load_engine_config();
    config.headless |= cli.headless;
    if cli.boot_script.is_some() {
        config.boot_script = cli.boot_script;
    }

    let mut app = App::new();
    if config.headless {
        app.add_plugins(MinimalPlugins)
            .add_plugins(bevy::log::LogPlugin::default());
        println!("[Pixie] Starting in HEADLESS mode");
    } else {
        app.add_plugins(DefaultPlugins.set(WindowPlugin {
            primary_window: Some(Window {
                title: config.window_title.clone(),
                resolution: (config.window_width, config.window_height).into(),
                present_mode: bevy::window::PresentMode::AutoVsync,
                ..default()
            }),
            ..default()
        }));
        let bg = config.background_color;
        app.insert_resource(ClearColor(Color::srgb(bg[0], bg[1], bg[2])));
        println!("[Pixie] Starting in WINDOWED mode");
    }

    if let Some(ticks) = cli.ticks {
        app.insert_resource(engine::TickLimit(ticks));
    }
    app.add_plugins(file_watcher::FileWatcherPlugin {
        scripts_dir: config.scripts_dir.clone(),
    })
    .add_plugins(engine::EnginePlugin {
        config,
        startup_messages: cli.publish,
    });

    app.run();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn cli_flags_and_boot_script() {
        let cli = parse_args(&args(&["--headless", "--ticks", "120", "level1"])).expect("parse");
        assert_eq!(
            cli,
            CliArgs {
                headless: true,
                ticks: Some(120),
                boot_script: Some("level1".to_string()),
                publish: Vec::new(),
            }
        );
        assert!(parse_args(&args(&["--ticks"])).is_err());
        assert!(parse_args(&args(&["--ticks", "many"])).is_err());
        assert!(parse_args(&args(&["--verbose"])).is_err());
    }

    #[test]
    fn publish_flags_carry_json_payloads() {
        let cli = parse_args(&args(&["--publish", r#"score={"points":3}"#, "--publish", "start=true"]))
            .expect("parse");
        assert_eq!(
            cli.publish,
            vec![
                ("score".to_string(), serde_json::json!({ "points": 3 })),
                ("start".to_string(), serde_json::json!(true)),
            ]
        );
        assert!(parse_args(&args(&["--publish", "score"])).is_err());
        assert!(parse_args(&args(&["--publish", "=1"])).is_err());
        assert!(parse_args(&args(&["--publish", "score={oops"])).is_err());
    }
}
