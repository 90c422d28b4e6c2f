use std::fs;
use std::io::{self, BufRead};
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::{debug, error, info};

use crate::accounts::{AccountSource, SteamAccounts};
use crate::aggregator::SessionLog;
use crate::config::{self, AgentConfig, RuntimeSettings};
use crate::process_guard::{self, DirState};
use crate::tracker::Agent;
use crate::util::human_duration;
use crate::writer::SnapshotWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Save,
    Status,
    Exit,
}

pub fn run(config: AgentConfig, runtime: RuntimeSettings) -> Result<()> {
    let agent = build_agent(&config, runtime.clone());
    let commands = install_control_channel()?;

    agent.start()?;
    println!("appusage-agent tracking foreground applications.");
    println!("snapshots: {}", agent.output_dir().display());
    println!(
        "auto-save every {}; type `save` to write now, `quit` or Ctrl+C to stop.",
        human_duration(autosave_interval(&runtime))
    );

    for command in commands.iter() {
        match command {
            ControlCommand::Save => match agent.manual_save() {
                Ok(Some(path)) => println!("Saved {}", path.display()),
                Ok(None) => println!("Nothing to save yet."),
                Err(err) => {
                    error!(error = %err, "manual save failed");
                    println!("Save failed: {err}");
                }
            },
            ControlCommand::Status => {
                println!("pending sessions: {}", agent.pending_sessions());
            }
            ControlCommand::Exit => break,
        }
    }

    info!("stopping agent");
    match agent.exit_save() {
        Ok(Some(path)) => println!("Final snapshot saved to {}", path.display()),
        Ok(None) => println!("No sessions recorded since the last save."),
        Err(err) => return Err(err).context("final save failed"),
    }
    Ok(())
}

pub fn print_status(config: &AgentConfig) -> Result<()> {
    let runtime = config::runtime_settings();
    let output_dir = config.effective_output_dir();
    let (is_running, running_pid) = match process_guard::output_dir_state(&output_dir)? {
        DirState::Free => (false, None),
        DirState::Claimed { pid } => (true, pid),
    };

    println!("appusage-agent status");
    println!("running: {is_running}");
    if let Some(pid) = running_pid {
        println!("pid: {pid}");
    }
    println!("config: {}", config::config_path().display());
    println!("output_dir: {}", output_dir.display());
    println!("continuity: {}", config.continuity.label());
    println!("poll_interval: {}", human_duration(runtime.poll_interval));
    println!("autosave_interval: {}", human_duration(autosave_interval(&runtime)));
    if config.collect_accounts {
        match SteamAccounts::new(config.effective_steam_path()).login_users_path() {
            Ok(path) => println!("steam_login_users: {}", path.display()),
            Err(err) => println!("steam_login_users: unavailable ({err})"),
        }
    } else {
        println!("steam_login_users: disabled");
    }
    Ok(())
}

pub fn doctor(config: &AgentConfig) -> Result<u8> {
    let mut issues = 0u8;
    let output_dir = config.effective_output_dir();

    println!("appusage-agent doctor");
    println!("config_path: {}", config::config_path().display());
    println!("output_dir: {}", output_dir.display());

    match probe_writable(&output_dir) {
        Ok(()) => println!("[OK] Output directory is writable."),
        Err(err) => {
            issues += 1;
            println!("[WARN] Output directory is not writable: {err:#}");
        }
    }

    if cfg!(windows) {
        println!("[OK] Foreground window inspection available.");
    } else {
        println!("[INFO] Foreground inspection is Windows-only; this host records idle only.");
    }

    if config.collect_accounts {
        match SteamAccounts::new(config.effective_steam_path()).load() {
            Ok(accounts) => println!("[OK] Read {} Steam account(s).", accounts.len()),
            Err(err) => {
                issues += 1;
                println!("[WARN] Steam accounts unavailable: {err}");
            }
        }
    } else {
        println!("[INFO] Steam account collection disabled.");
    }

    if issues == 0 {
        println!("Doctor: healthy");
        Ok(0)
    } else {
        println!("Doctor: {issues} issue(s) found");
        Ok(1)
    }
}

pub fn print_accounts(config: &AgentConfig) -> Result<()> {
    let accounts = SteamAccounts::new(config.effective_steam_path())
        .load()
        .context("failed to read Steam accounts")?;
    println!("{}", serde_json::to_string_pretty(&accounts)?);
    Ok(())
}

fn build_agent(config: &AgentConfig, runtime: RuntimeSettings) -> Agent {
    let accounts = config.collect_accounts.then(|| {
        Arc::new(SteamAccounts::new(config.effective_steam_path())) as Arc<dyn AccountSource>
    });
    let writer = SnapshotWriter::new(config.effective_output_dir(), accounts);
    Agent::new(SessionLog::new(config.continuity), writer, runtime)
}

/// Wall-clock time between auto-saves, saturating for oversized settings.
fn autosave_interval(runtime: &RuntimeSettings) -> Duration {
    u32::try_from(runtime.autosave_every_ticks)
        .ok()
        .and_then(|ticks| runtime.poll_interval.checked_mul(ticks))
        .unwrap_or(Duration::MAX)
}

fn probe_writable(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create a file in {}", dir.display()))?;
    Ok(())
}

fn install_control_channel() -> Result<Receiver<ControlCommand>> {
    let (tx, rx) = mpsc::channel();

    let on_interrupt = tx.clone();
    ctrlc::set_handler(move || {
        let _ = on_interrupt.send(ControlCommand::Exit);
    })
    .context("failed to install Ctrl+C handler")?;

    thread::Builder::new()
        .name("console-input".to_string())
        .spawn(move || read_console(io::stdin().lock(), tx))
        .context("failed to spawn console reader")?;

    Ok(rx)
}

fn read_console(input: impl BufRead, commands: Sender<ControlCommand>) {
    for line in input.lines() {
        let Ok(line) = line else {
            break;
        };
        match parse_command(&line) {
            Some(command) => {
                if commands.send(command).is_err() {
                    break;
                }
            }
            None if line.trim().is_empty() => {}
            None => println!("commands: save (s), status, quit (q)"),
        }
    }
    debug!("console input closed");
}

fn parse_command(line: &str) -> Option<ControlCommand> {
    match line.trim().to_ascii_lowercase().as_str() {
        "save" | "s" => Some(ControlCommand::Save),
        "status" => Some(ControlCommand::Status),
        "quit" | "q" | "exit" => Some(ControlCommand::Exit),
        _ => None,
    }
}
