use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, sleep, Duration};

use safety_monitor_rs::commands::{self, Command, HELP};
use safety_monitor_rs::config::AlertMode;
use safety_monitor_rs::sos::SosOutcome;
use safety_monitor_rs::{dashboard, sensors, SafetyConfig, SafetyEvent, SafetyMonitor};

#[derive(Parser, Debug)]
#[command(name = "safety_monitor")]
#[command(about = "Personal safety monitor - location, danger zones, shake-to-SOS", long_about = None)]
struct Args {
    /// Duration in seconds (0 = until quit)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Backend base URL
    #[arg(long)]
    backend_url: Option<String>,

    /// Auth token sent as x-auth-token
    #[arg(long)]
    token: Option<String>,

    /// Alert on every fix inside a zone instead of on entry only
    #[arg(long)]
    every_sample: bool,

    /// Number dialed by `police`
    #[arg(long)]
    emergency_number: Option<String>,

    /// Output directory for status and recordings
    #[arg(long)]
    output_dir: Option<String>,

    /// Audio file played for fake calls
    #[arg(long)]
    ringtone: Option<PathBuf>,

    /// Serve /status and /ws on this port
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Use mock sensors even when Termux:API is installed
    #[arg(long)]
    mock: bool,

    /// Seconds between status file writes
    #[arg(long, default_value = "5")]
    status_interval: u64,
}

fn build_config(args: &Args) -> Result<SafetyConfig> {
    let mut config = match &args.config {
        Some(path) => SafetyConfig::load(path)?,
        None => SafetyConfig::default(),
    };
    if let Some(url) = &args.backend_url {
        config.backend.base_url = url.clone();
    }
    if let Some(token) = &args.token {
        config.backend.auth_token = Some(token.clone());
    }
    if args.every_sample {
        config.geofence.alert_mode = AlertMode::EverySample;
    }
    if let Some(number) = &args.emergency_number {
        config.emergency_number = number.clone();
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = build_config(&args)?;

    println!("[{}] Safety Monitor RS Starting", ts_now());
    println!("  Duration: {} seconds (0=until quit)", args.duration);
    println!("  Backend: {}", config.backend.base_url);
    println!("  Logged in: {}", config.backend.auth_token.is_some());
    println!("  Alert mode: {:?}", config.geofence.alert_mode);
    println!("  Output Dir: {}", config.output_dir);

    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("creating {}", config.output_dir))?;
    let status_path = PathBuf::from(&config.output_dir).join("safety_status.json");

    let platform = sensors::termux_platform(
        &PathBuf::from(&config.output_dir).join("recordings"),
        args.ringtone.clone(),
        args.mock,
    );
    let monitor = Arc::new(SafetyMonitor::new(config, platform)?);

    let printer = tokio::spawn(print_events(monitor.subscribe()));

    if let Some(port) = args.dashboard_port {
        let monitor = monitor.clone();
        tokio::spawn(async move {
            if let Err(e) = dashboard::start_dashboard(monitor, port).await {
                log::error!("[DASHBOARD] {}", e);
            }
        });
    }

    let report = monitor.start().await;
    println!(
        "[{}] Monitoring: location={} background={} shake={} push={}",
        ts_now(),
        report.tracking,
        report.background_location,
        report.shake_armed,
        report.push_token.is_some()
    );
    if !report.tracking {
        println!("[{}] Waiting for location...", ts_now());
    }
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut status_tick = interval(Duration::from_secs(args.status_interval.max(1)));
    let deadline = async {
        if args.duration > 0 {
            sleep(Duration::from_secs(args.duration)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !run_line(&monitor, &line).await {
                        break;
                    }
                }
                Ok(None) => {
                    println!("[{}] End of input, stopping...", ts_now());
                    break;
                }
                Err(e) => {
                    log::error!("stdin: {}", e);
                    break;
                }
            },
            _ = status_tick.tick() => {
                if let Err(e) = monitor.status().save(&status_path) {
                    log::warn!("Could not write {}: {}", status_path.display(), e);
                }
            }
            _ = &mut deadline => {
                println!("[{}] Duration reached, stopping...", ts_now());
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("[{}] Interrupted, stopping...", ts_now());
                break;
            }
        }
    }

    monitor.teardown().await;
    printer.abort();

    let final_status = monitor.status();
    final_status.save(&status_path)?;
    println!("[{}] Final status: {}", ts_now(), final_status.summary());
    println!("[{}] Saved {}", ts_now(), status_path.display());
    Ok(())
}

/// Returns false when the user asked to quit
async fn run_line(monitor: &SafetyMonitor, line: &str) -> bool {
    let command = match commands::parse(line) {
        Ok(Some(command)) => command,
        Ok(None) => return true,
        Err(e) => {
            println!("[{}] {}", ts_now(), e);
            return true;
        }
    };

    match command {
        Command::Sos => match monitor.trigger_sos().await {
            SosOutcome::Sent(_) => println!("[{}] SOS sent", ts_now()),
            SosOutcome::Failed { message, .. } => println!("[{}] SOS failed: {}", ts_now(), message),
            SosOutcome::Coalesced => println!("[{}] SOS already in flight", ts_now()),
        },
        Command::FakeCall(config) => {
            if let Err(e) = monitor.schedule_fake_call(config) {
                println!("[{}] {}", ts_now(), e);
            }
        }
        Command::Cancel => {
            if !monitor.cancel_fake_call() {
                println!("[{}] No fake call scheduled", ts_now());
            }
        }
        Command::Accept => {
            if !monitor.accept_fake_call().await {
                println!("[{}] No call ringing", ts_now());
            }
        }
        Command::Decline => {
            if !monitor.decline_fake_call().await {
                println!("[{}] No call ringing", ts_now());
            }
        }
        Command::Record => {
            if let Err(e) = monitor.start_recording().await {
                println!("[{}] {}", ts_now(), e);
            }
        }
        Command::StopRecording => match monitor.stop_recording().await {
            Ok(Some(uri)) => println!("[{}] Recording saved: {}", ts_now(), uri),
            Ok(None) => println!("[{}] Not recording", ts_now()),
            Err(e) => println!("[{}] {}", ts_now(), e),
        },
        Command::Police => {
            if let Err(e) = monitor.call_emergency().await {
                println!("[{}] {}", ts_now(), e);
            }
        }
        Command::Zones => match monitor.refresh_zones().await {
            Ok(count) => println!("[{}] {} danger zone(s) loaded", ts_now(), count),
            Err(e) => println!("[{}] Zone refresh failed: {}", ts_now(), e),
        },
        Command::Status => println!("[{}] {}", ts_now(), monitor.status().summary()),
        Command::Help => println!("{}", HELP),
        Command::Quit => return false,
    }
    true
}

/// Console rendering of the event bus
async fn print_events(mut events: tokio::sync::broadcast::Receiver<SafetyEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("Console skipped {} events", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match event {
            SafetyEvent::Notice { title, body } => println!("[{}] ** {} ** {}", ts_now(), title, body),
            SafetyEvent::ZoneEntered { zone_id, severity } => {
                println!("[{}] Entered danger zone {} ({})", ts_now(), zone_id, severity)
            }
            SafetyEvent::ZoneExited { zone_id } => println!("[{}] Left danger zone {}", ts_now(), zone_id),
            SafetyEvent::ShakeDetected { magnitude } => {
                println!("[{}] Shake detected ({:.2} g)", ts_now(), magnitude)
            }
            SafetyEvent::FakeCallScheduled { caller_name, delay_seconds } => {
                println!("[{}] Fake call from {} in {}s", ts_now(), caller_name, delay_seconds)
            }
            SafetyEvent::FakeCallRinging { caller_name, caller_number } => {
                println!("[{}] Incoming call: {} {} (accept/decline)", ts_now(), caller_name, caller_number)
            }
            SafetyEvent::RecordingStarted => println!("[{}] Recording...", ts_now()),
            SafetyEvent::RecordingTick { elapsed_seconds } if elapsed_seconds % 10 == 0 => {
                println!("[{}] Recording {}s", ts_now(), elapsed_seconds)
            }
            SafetyEvent::LocationUpdated(sample) => log::debug!(
                "fix {:.6},{:.6}",
                sample.coords.latitude,
                sample.coords.longitude
            ),
            _ => {}
        }
    }
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
