mod alarm;
mod audio;
mod logging;
mod session;
mod store;
mod time_provider;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, Utc};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::alarm::ack::{AckWindowPolicy, WakeupPhase};
use crate::alarm::clock::{TimeDisplayMode, format_trigger, next_trigger_instant};
use crate::alarm::model::{Alarm, SchedulerSettings, UserId};
use crate::audio::{AudioState, LoggingAudioController};
use crate::session::{Acknowledger, Collaborators, WakeupSession};
use crate::store::{AlarmConfigStore, FileAlarmConfigStore, FileWakeupStore, WakeupStore};
use crate::time_provider::{ClockSource, SystemClock};

#[derive(Parser, Debug)]
#[command(
    name = "wakey",
    version,
    about = "Daily wake-up alarm with once-per-occurrence triggering and acknowledgment"
)]
struct Cli {
    #[arg(long, default_value = "wakey.json")]
    config: PathBuf,

    #[arg(long)]
    user: String,

    #[arg(long, default_value = "wakeups.json")]
    wakeups: PathBuf,

    #[arg(long)]
    poll_interval_ms: Option<u64>,

    #[arg(long)]
    tolerance_secs: Option<u64>,

    #[arg(long)]
    ack_window_mins: Option<u64>,

    /// Replace the user's alarm and exit.
    #[arg(long, value_name = "HH:MM", conflicts_with = "set_alarm_in")]
    set_alarm: Option<Alarm>,

    /// Set the alarm to ring this many minutes from now and exit.
    #[arg(long, value_name = "MINUTES")]
    set_alarm_in: Option<u32>,

    /// Print the next trigger and the current phase, then exit.
    #[arg(long)]
    next: bool,

    #[arg(long)]
    hour12: bool,

    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply_overrides(&self, mut settings: SchedulerSettings) -> Result<SchedulerSettings> {
        if let Some(ms) = self.poll_interval_ms {
            if ms == 0 {
                bail!("--poll-interval-ms must be greater than zero");
            }
            settings.poll_interval_ms = ms;
        }
        if let Some(secs) = self.tolerance_secs {
            settings.tolerance_ms = secs.saturating_mul(1_000);
        }
        if let Some(mins) = self.ack_window_mins {
            settings.ack_window_ms = mins.saturating_mul(60_000);
        }
        settings
            .check_window()
            .context("--tolerance-secs is wider than the scheduler lookback")?;
        Ok(settings)
    }

    fn display_mode(&self) -> TimeDisplayMode {
        if self.hour12 {
            TimeDisplayMode::Hour12
        } else {
            TimeDisplayMode::Hour24
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Ack { photo_reference: Option<String> },
    Silence,
    Status,
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    let mut words = line.split_whitespace();
    let command = match words.next()? {
        "ack" => Command::Ack {
            photo_reference: words.next().map(str::to_string),
        },
        "silence" => Command::Silence,
        "status" => Command::Status,
        "quit" | "exit" => Command::Quit,
        _ => return None,
    };
    Some(command)
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let user_id = UserId::new(cli.user.trim());
    if user_id.as_str().is_empty() {
        bail!("--user must not be empty");
    }

    let alarms = Arc::new(
        FileAlarmConfigStore::open(&cli.config)
            .with_context(|| format!("failed to load {}", cli.config.display()))?,
    );
    let settings = cli.apply_overrides(alarms.settings().await)?;
    let clock: Arc<dyn ClockSource> = Arc::new(SystemClock);
    let mode = cli.display_mode();

    let picked = match (cli.set_alarm, cli.set_alarm_in) {
        (Some(alarm), _) => Some(alarm),
        (None, Some(minutes)) => {
            let at = clock.now() + chrono::Duration::minutes(i64::from(minutes));
            Some(Alarm::from_datetime(&at))
        }
        (None, None) => None,
    };
    if let Some(alarm) = picked {
        alarms
            .save(&user_id, alarm)
            .await
            .with_context(|| format!("failed to save alarm to {}", cli.config.display()))?;
        println!("Alarm for {user_id} set to {alarm}");
        return Ok(());
    }

    let wakeups = Arc::new(
        FileWakeupStore::open(&cli.wakeups)
            .with_context(|| format!("failed to open {}", cli.wakeups.display()))?,
    );

    if cli.next {
        return report_next(
            &user_id,
            &settings,
            alarms.as_ref(),
            wakeups.as_ref(),
            clock.now(),
            mode,
        )
        .await;
    }

    let collaborators = Collaborators {
        clock,
        alarms,
        wakeups,
        audio: Arc::new(LoggingAudioController::new()),
    };
    run_session(user_id, settings, collaborators, mode).await
}

async fn report_next(
    user_id: &UserId,
    settings: &SchedulerSettings,
    alarms: &dyn AlarmConfigStore,
    wakeups: &dyn WakeupStore,
    now: DateTime<Local>,
    mode: TimeDisplayMode,
) -> Result<()> {
    let Some(alarm) = alarms.get(user_id).await? else {
        println!("No alarm set for {user_id}");
        return Ok(());
    };
    let trigger = next_trigger_instant(&alarm, &now)?;
    let latest = wakeups.latest(user_id).await?;
    let phase = AckWindowPolicy::from_settings(settings).phase(
        Some(trigger.with_timezone(&Utc)),
        latest.as_ref(),
        AudioState::Silent,
        &now.with_timezone(&Utc),
    );

    println!("Alarm for {user_id}: {alarm}");
    println!("Next trigger: {}", format_trigger(Some(&trigger), mode));
    println!("Phase: {}", describe_phase(phase, mode));
    Ok(())
}

fn describe_phase(phase: WakeupPhase, mode: TimeDisplayMode) -> String {
    let local = |instant: DateTime<Utc>| format_trigger(Some(&instant.with_timezone(&Local)), mode);
    match phase {
        WakeupPhase::NoAlarm => "no alarm".to_string(),
        WakeupPhase::AlarmSet { next_trigger } => format!("alarm set for {}", local(next_trigger)),
        WakeupPhase::Active { alarm_instant } => {
            format!("wake-up active since {}", local(alarm_instant))
        }
        WakeupPhase::Acknowledged { alarm_instant } => {
            format!("woke up for {}", local(alarm_instant))
        }
    }
}

async fn run_session(
    user_id: UserId,
    settings: SchedulerSettings,
    collaborators: Collaborators,
    mode: TimeDisplayMode,
) -> Result<()> {
    let clock = Arc::clone(&collaborators.clock);
    let (session, mut events) = WakeupSession::new(user_id.clone(), settings, collaborators);
    let acknowledger = session.acknowledger();
    let mut phase = session.subscribe_phase();
    let handle = session.spawn();
    println!("Session started for {user_id}. Commands: ack [photo-url], silence, status, quit");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_trigger: Option<DateTime<Utc>> = None;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupt received");
                break;
            }
            Some(event) = events.recv() => {
                last_trigger = Some(event.alarm_instant);
                println!(
                    "WAKE UP, {}! Alarm for {} is ringing",
                    event.user_id,
                    format_trigger(Some(&event.alarm_instant.with_timezone(&Local)), mode)
                );
            }
            changed = phase.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *phase.borrow_and_update();
                println!("Phase: {}", describe_phase(current, mode));
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match parse_command(&line) {
                    Some(Command::Quit) => break,
                    Some(Command::Status) => {
                        println!("Phase: {}", describe_phase(*phase.borrow(), mode));
                    }
                    Some(Command::Silence) => acknowledger.silence(),
                    Some(Command::Ack { photo_reference }) => {
                        let now = clock.now().with_timezone(&Utc);
                        acknowledge(&acknowledger, last_trigger, now, photo_reference, mode).await;
                    }
                    None if line.trim().is_empty() => {}
                    None => println!("Unknown command: {}", line.trim()),
                }
            }
        }
    }

    handle.sign_out().await;
    println!("Signed out");
    Ok(())
}

async fn acknowledge(
    acknowledger: &Acknowledger,
    last_trigger: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    photo_reference: Option<String>,
    mode: TimeDisplayMode,
) {
    let target = match last_trigger {
        Some(instant) => Some(instant),
        None => match acknowledger.latest().await {
            Ok(latest) => latest
                .filter(|wakeup| !wakeup.is_acknowledged())
                .map(|wakeup| wakeup.alarm_instant),
            Err(err) => {
                println!("Acknowledgment failed: {err}");
                return;
            }
        },
    };
    let Some(alarm_instant) = target else {
        println!("Nothing to acknowledge");
        return;
    };

    match acknowledger.acknowledge(alarm_instant, now, photo_reference).await {
        Ok(_) => println!(
            "Acknowledged wake-up for {}",
            format_trigger(Some(&alarm_instant.with_timezone(&Local)), mode)
        ),
        Err(err) => println!("Acknowledgment failed: {err}"),
    }
}
