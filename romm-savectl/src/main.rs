mod control_client;

use std::collections::HashMap;

use anyhow::{Context, bail};
use control_client::SaveSyncClient;
use romm_integrations::SaveFileStatus;
use serde::Serialize;
use serde_json::{Map, Value};

const BOOL_SETTINGS: [&str; 2] = ["sync_before_launch", "sync_after_exit"];
const CONFLICT_MODES: [&str; 4] = ["newest_wins", "always_upload", "always_download", "ask_me"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliCommand {
    Progress,
    SaveStatus(i64),
    Sync,
    PreLaunch(i64),
    PostExit(i64),
    Conflicts,
    Resolve {
        rom_id: i64,
        filename: String,
        resolution: String,
    },
    Queue,
    Retry { rom_id: i64, filename: String },
    ClearQueue,
    Settings,
    Set(String),
    LibrarySynced(HashMap<String, u32>),
    SessionStart(i64),
    SessionEnd(i64),
    Playtime(i64),
    Help,
}

fn parse_cli<I>(args: I) -> anyhow::Result<CliCommand>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(flag) = args.next() else {
        return Ok(CliCommand::Progress);
    };
    let command = match flag.as_str() {
        "--status" => CliCommand::Progress,
        "--save-status" => CliCommand::SaveStatus(rom_id_arg(args.next())?),
        "--sync" => CliCommand::Sync,
        "--pre-launch" => CliCommand::PreLaunch(rom_id_arg(args.next())?),
        "--post-exit" => CliCommand::PostExit(rom_id_arg(args.next())?),
        "--conflicts" => CliCommand::Conflicts,
        "--resolve" => {
            let rom_id = rom_id_arg(args.next())?;
            let filename = args.next().context("--resolve needs a file name")?;
            let resolution = args
                .next()
                .context("--resolve needs upload or download")?;
            if !matches!(resolution.as_str(), "upload" | "download") {
                bail!("resolution must be upload or download, got {resolution}");
            }
            CliCommand::Resolve {
                rom_id,
                filename,
                resolution,
            }
        }
        "--queue" => CliCommand::Queue,
        "--retry" => {
            let rom_id = rom_id_arg(args.next())?;
            let filename = args.next().context("--retry needs a file name")?;
            CliCommand::Retry { rom_id, filename }
        }
        "--clear-queue" => CliCommand::ClearQueue,
        "--settings" => CliCommand::Settings,
        "--set" => {
            let pairs: Vec<String> = args.by_ref().collect();
            if pairs.is_empty() {
                bail!("--set needs at least one KEY=VALUE");
            }
            return Ok(CliCommand::Set(settings_change_json(&pairs)?));
        }
        "--library-synced" => {
            let counts: Vec<String> = args.by_ref().collect();
            return Ok(CliCommand::LibrarySynced(platform_counts(&counts)?));
        }
        "--session-start" => CliCommand::SessionStart(rom_id_arg(args.next())?),
        "--session-end" => CliCommand::SessionEnd(rom_id_arg(args.next())?),
        "--playtime" => CliCommand::Playtime(rom_id_arg(args.next())?),
        "--help" | "-h" => CliCommand::Help,
        other => bail!("unknown argument: {other}"),
    };
    if let Some(extra) = args.next() {
        bail!("unexpected argument: {extra}");
    }
    Ok(command)
}

fn rom_id_arg(value: Option<String>) -> anyhow::Result<i64> {
    let value = value.context("missing ROM id")?;
    value
        .parse()
        .with_context(|| format!("ROM id must be a number, got {value}"))
}

/// Turns `KEY=VALUE` pairs into the JSON object the daemon expects.
fn settings_change_json(pairs: &[String]) -> anyhow::Result<String> {
    let mut changes = Map::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("expected KEY=VALUE, got {pair}"))?;
        let value = if BOOL_SETTINGS.contains(&key) {
            match value.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Value::Bool(true),
                "false" | "0" | "no" | "off" => Value::Bool(false),
                _ => bail!("{key} expects true or false, got {value}"),
            }
        } else if key == "conflict_mode" {
            if !CONFLICT_MODES.contains(&value) {
                bail!(
                    "conflict_mode must be one of {}, got {value}",
                    CONFLICT_MODES.join(", ")
                );
            }
            Value::String(value.to_string())
        } else {
            bail!("unknown setting: {key}");
        };
        changes.insert(key.to_string(), value);
    }
    Ok(Value::Object(changes).to_string())
}

fn platform_counts(pairs: &[String]) -> anyhow::Result<HashMap<String, u32>> {
    pairs
        .iter()
        .map(|pair| -> anyhow::Result<(String, u32)> {
            let (platform, count) = pair
                .split_once('=')
                .with_context(|| format!("expected PLATFORM=COUNT, got {pair}"))?;
            let count = count
                .parse()
                .with_context(|| format!("count for {platform} must be a number"))?;
            Ok((platform.to_string(), count))
        })
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_help() {
    println!("Usage: romm-savectl [COMMAND]");
    println!("  --status                        Show the current sync progress (default)");
    println!("  --save-status ROM               Show per-file status for a ROM");
    println!("  --sync                          Run a full save sync pass");
    println!("  --pre-launch ROM                Pull newer server saves for a ROM");
    println!("  --post-exit ROM                 Push changed local saves for a ROM");
    println!("  --conflicts                     List conflicts waiting for a decision");
    println!("  --resolve ROM FILE upload|download");
    println!("                                  Resolve a conflict in one direction");
    println!("  --queue                         List failed syncs waiting for retry");
    println!("  --retry ROM FILE                Retry one failed sync now");
    println!("  --clear-queue                   Discard all failed syncs");
    println!("  --settings                      Show save sync settings");
    println!("  --set KEY=VALUE...              Change save sync settings");
    println!("  --library-synced PLATFORM=COUNT...");
    println!("                                  Report a finished library sync");
    println!("  --session-start ROM             Mark the start of a play session");
    println!("  --session-end ROM               Record the play session and sync playtime");
    println!("  --playtime ROM                  Show local and server playtime");
}

fn run(command: CliCommand) -> anyhow::Result<()> {
    if command == CliCommand::Help {
        print_help();
        return Ok(());
    }

    let client = SaveSyncClient::connect()?;
    match command {
        CliCommand::Progress => print_json(&client.progress()?),
        CliCommand::SaveStatus(rom_id) => {
            let entries = client.save_status(rom_id)?;
            for entry in &entries {
                if let Some(status) = SaveFileStatus::parse(&entry.status) {
                    eprintln!("{}: {}", entry.filename, status.label());
                }
            }
            print_json(&entries)
        }
        CliCommand::Sync => print_json(&client.sync_all()?),
        CliCommand::PreLaunch(rom_id) => print_json(&client.pre_launch_sync(rom_id)?),
        CliCommand::PostExit(rom_id) => print_json(&client.post_exit_sync(rom_id)?),
        CliCommand::Conflicts => print_json(&client.conflicts()?),
        CliCommand::Resolve {
            rom_id,
            filename,
            resolution,
        } => {
            client.resolve_conflict(rom_id, &filename, &resolution)?;
            println!("resolved {filename} ({resolution})");
            Ok(())
        }
        CliCommand::Queue => print_json(&client.offline_queue()?),
        CliCommand::Retry { rom_id, filename } => {
            if client.retry_failed_sync(rom_id, &filename)? {
                println!("{filename} synced");
            } else {
                println!("{filename} failed again and stays queued");
            }
            Ok(())
        }
        CliCommand::ClearQueue => {
            client.clear_offline_queue()?;
            println!("offline queue cleared");
            Ok(())
        }
        CliCommand::Settings => print_json(&client.settings()?),
        CliCommand::Set(changes) => print_json(&client.update_settings(&changes)?),
        CliCommand::LibrarySynced(counts) => {
            client.report_library_sync(&counts)?;
            println!("reported {} platforms", counts.len());
            Ok(())
        }
        CliCommand::SessionStart(rom_id) => {
            client.record_session_start(rom_id)?;
            println!("session started for rom {rom_id}");
            Ok(())
        }
        CliCommand::SessionEnd(rom_id) => print_json(&client.record_session_end(rom_id)?),
        CliCommand::Playtime(rom_id) => print_json(&client.playtime(rom_id)?),
        CliCommand::Help => Ok(()),
    }
}

fn main() -> anyhow::Result<()> {
    run(parse_cli(std::env::args())?)
}
