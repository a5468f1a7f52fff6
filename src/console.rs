//! Line based front end: prints what the state store publishes and turns typed lines into
//! manager requests.

use std::io;
use std::str::FromStr;
use log::debug;
use tokio::io::{stdin, stdout, AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::archive::Archiver;
use crate::device::connection::ConnectionManager;
use crate::device::store::{Snapshot, StateStore};
use crate::device::types::{Command, ScanState};
use crate::error::{AppRunError, ConsoleError, DeviceError};

pub const HELP: &str = "\
Commands:
  scan              start scanning for the cuff
  stop              stop scanning
  disconnect        disconnect from the cuff
  inflate           start inflating
  deflate           start deflating
  emergency_stop    stop immediately (also: stop!)
  calibrate         calibrate the pressure sensor
  water <ml>        record a water intake
  status            print the current state
  quit              exit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    StartScan,
    StopScan,
    Disconnect,
    Send(Command),
    WaterIntake { millilitres: u32 },
    Status,
    Help,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = ConsoleError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let name = words.next().unwrap_or("").to_lowercase();

        let command = match name.as_str() {
            "scan" => ConsoleCommand::StartScan,
            "stop" => ConsoleCommand::StopScan,
            "stop!" => ConsoleCommand::Send(Command::EmergencyStop),
            "disconnect" => ConsoleCommand::Disconnect,
            "status" => ConsoleCommand::Status,
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" => ConsoleCommand::Quit,
            "water" => {
                let value = words.next().ok_or(ConsoleError::MissingAmount)?;
                let millilitres = value.parse::<u32>().map_err(|_| ConsoleError::InvalidAmount { value: value.to_string() })?;
                ConsoleCommand::WaterIntake { millilitres }
            },
            name => match Command::from_str(name) {
                Ok(command) => ConsoleCommand::Send(command),
                Err(_) => return Err(ConsoleError::UnknownCommand { name: name.to_string() }),
            },
        };

        if let Some(extra) = words.next() {
            return Err(ConsoleError::UnknownCommand { name: format!("{} {}", name, extra) });
        }

        Ok(command)
    }
}

/// Returns `None` for blank lines.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, ConsoleError> {
    if line.trim().is_empty() {
        return Ok(None);
    }

    line.parse().map(Some)
}

pub fn status_line(snapshot: &Snapshot) -> String {
    let scan = match snapshot.scan {
        ScanState::Idle => "idle",
        ScanState::Scanning => "scanning",
    };
    let device = snapshot.peripheral
        .as_ref()
        .map_or(String::from("no device"), |peripheral| format!("{} ({})", peripheral.name, peripheral.address));

    format!(
        "{}; scan {}; pressure {}; retries {}; {}",
        snapshot.connection,
        scan,
        snapshot.reading.value,
        snapshot.retries,
        device,
    )
}

/// The lines worth printing when the store moves from `previous` to `current`.
pub fn describe_changes(previous: &Snapshot, current: &Snapshot) -> Vec<String> {
    let mut lines = Vec::new();

    if previous.connection != current.connection {
        lines.push(match &current.peripheral {
            Some(peripheral) => format!("State: {} ({})", current.connection, peripheral.name),
            None => format!("State: {}", current.connection),
        });
    }

    if previous.scan != current.scan && current.scan == ScanState::Scanning {
        lines.push(String::from("Scanning..."));
    }

    if previous.retries != current.retries && current.retries > 0 {
        lines.push(format!("Retrying ({})", current.retries));
    }

    if previous.reading != current.reading && !current.reading.is_baseline() {
        lines.push(format!("Pressure: {}", current.reading.value));
    }

    lines
}

async fn print_line(out: &mut Stdout, text: &str) -> io::Result<()> {
    out.write_all(text.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}

/// Prints state changes and log messages until cancelled.
pub fn print_state_task(store: StateStore, cancel: CancellationToken) -> JoinHandle<io::Result<()>> {
    spawn(async move {
        let mut out = stdout();
        let mut state = store.subscribe();
        let mut log = store.subscribe_log();
        let mut previous = state.borrow_and_update().clone();
        log.borrow_and_update();

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                changed = state.changed() => {
                    if changed.is_err() {
                        break 'mainloop;
                    }

                    let current = state.borrow_and_update().clone();
                    for line in describe_changes(&previous, &current) {
                        print_line(&mut out, &line).await?;
                    }
                    previous = current;
                },
                changed = log.changed() => {
                    if changed.is_err() {
                        break 'mainloop;
                    }

                    let message = log.borrow_and_update().clone();
                    if let Some(message) = message {
                        print_line(&mut out, &format!("> {}", message.text)).await?;
                    }
                },
            }
        }

        Ok(())
    })
}

/// Reads commands from stdin until `quit`, end of input, or cancellation.
pub async fn run_console(manager: ConnectionManager, archive: Option<Archiver>, cancel: CancellationToken) -> Result<(), AppRunError> {
    let mut lines = BufReader::new(stdin()).lines();
    let mut out = stdout();
    print_line(&mut out, HELP).await?;

    'mainloop: loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            line = lines.next_line() => line?,
        };

        let line = match line {
            Some(line) => line,
            None => break 'mainloop,
        };

        let command = match parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                print_line(&mut out, &err.to_string()).await?;
                continue;
            },
        };
        debug!("Console command {:?}", command);

        match command {
            ConsoleCommand::Quit => break 'mainloop,
            ConsoleCommand::Help => print_line(&mut out, HELP).await?,
            ConsoleCommand::Status => print_line(&mut out, &status_line(&manager.store().snapshot())).await?,
            ConsoleCommand::StartScan => manager.start_scan()?,
            ConsoleCommand::StopScan => manager.stop_scan()?,
            ConsoleCommand::Disconnect => manager.disconnect()?,
            ConsoleCommand::Send(command) => match manager.send_command(command).await {
                Err(DeviceError::ManagerStopped) => return Err(DeviceError::ManagerStopped.into()),
                // the manager already published the outcome
                _ => {},
            },
            ConsoleCommand::WaterIntake { millilitres } => match &archive {
                Some(archive) => {
                    archive.record_water_intake(millilitres);
                    print_line(&mut out, &format!("Recorded {} ml", millilitres)).await?;
                },
                None => print_line(&mut out, "Nothing is archived without an identity (--identity)").await?,
            },
        }
    }

    Ok(())
}
