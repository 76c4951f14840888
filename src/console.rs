//! Line-oriented operator console
//!
//! Reads commands from stdin and prints status and echo updates as they arrive.
//! Parsing is kept apart from execution in [`parse_line`].

use crate::mqtt::codec::{Command, Controls, Heading, Maneuver};
use crate::mqtt::message_manager::{EchoRecord, StatusRecord};
use crate::mqtt::mqtt_handler::{Session, SessionStatus};
use crate::peer::HttpPeer;
use crate::persistence::profile_store::ProfileStore;
use crate::persistence::Profile;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

pub const HELP: &str = "\
commands:
  f|b|l|r [speed] [ms]  drive forward/backward/left/right
  s                     stop
  speed N               set default speed (0-255)
  ms N                  set default duration (0 = continuous)
  status                show session and vehicle status
  connect | disconnect  manage the broker session
  save                  store the current profile
  help                  show this text
  quit                  leave";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleAction {
    Drive {
        heading: Heading,
        speed: Option<u32>,
        duration_ms: Option<u32>,
    },
    Stop,
    SetSpeed(u32),
    SetDuration(u32),
    Status,
    Connect,
    Disconnect,
    Save,
    Help,
    Quit,
    Nothing,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown command '{0}', type help")]
    Unknown(String),
    #[error("{0} needs a value")]
    MissingValue(&'static str),
    #[error("'{0}' is not a number")]
    InvalidNumber(String),
    #[error("too many arguments for '{0}'")]
    TooManyArguments(String),
}

pub fn parse_line(line: &str) -> Result<ConsoleAction, ParseError> {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return Ok(ConsoleAction::Nothing);
    };
    let keyword = word.to_ascii_lowercase();
    let args: Vec<&str> = words.collect();

    let action = match keyword.as_str() {
        "f" | "forward" => drive(Heading::Forward, &args, &keyword)?,
        "b" | "back" | "backward" => drive(Heading::Backward, &args, &keyword)?,
        "l" | "left" => drive(Heading::Left, &args, &keyword)?,
        "r" | "right" => drive(Heading::Right, &args, &keyword)?,
        "s" | "stop" => bare(ConsoleAction::Stop, &args, &keyword)?,
        "speed" => ConsoleAction::SetSpeed(single_value("speed", &args, &keyword)?),
        "ms" | "duration" => ConsoleAction::SetDuration(single_value("ms", &args, &keyword)?),
        "status" => bare(ConsoleAction::Status, &args, &keyword)?,
        "connect" => bare(ConsoleAction::Connect, &args, &keyword)?,
        "disconnect" => bare(ConsoleAction::Disconnect, &args, &keyword)?,
        "save" => bare(ConsoleAction::Save, &args, &keyword)?,
        "help" | "?" => ConsoleAction::Help,
        "quit" | "exit" | "q" => ConsoleAction::Quit,
        _ => return Err(ParseError::Unknown(word.to_string())),
    };
    Ok(action)
}

fn drive(heading: Heading, args: &[&str], keyword: &str) -> Result<ConsoleAction, ParseError> {
    if args.len() > 2 {
        return Err(ParseError::TooManyArguments(keyword.to_string()));
    }
    let speed = args.first().map(|v| number(v)).transpose()?;
    let duration_ms = args.get(1).map(|v| number(v)).transpose()?;
    Ok(ConsoleAction::Drive {
        heading,
        speed,
        duration_ms,
    })
}

fn bare(action: ConsoleAction, args: &[&str], keyword: &str) -> Result<ConsoleAction, ParseError> {
    if args.is_empty() {
        Ok(action)
    } else {
        Err(ParseError::TooManyArguments(keyword.to_string()))
    }
}

fn single_value(name: &'static str, args: &[&str], keyword: &str) -> Result<u32, ParseError> {
    match args {
        [] => Err(ParseError::MissingValue(name)),
        [value] => number(value),
        _ => Err(ParseError::TooManyArguments(keyword.to_string())),
    }
}

fn number(value: &str) -> Result<u32, ParseError> {
    value
        .parse()
        .map_err(|_| ParseError::InvalidNumber(value.to_string()))
}

/// Whether the console keeps reading after an action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Console {
    session: Arc<Session>,
    peer: Option<HttpPeer>,
    store: ProfileStore,
    profile_name: String,
    profile: Profile,
}

impl Console {
    /// With a peer, motion commands go over HTTP instead of the broker
    pub fn new(
        session: Arc<Session>,
        peer: Option<HttpPeer>,
        store: ProfileStore,
        profile_name: String,
        profile: Profile,
    ) -> Self {
        Self {
            session,
            peer,
            store,
            profile_name,
            profile,
        }
    }

    pub fn controls(&self) -> Controls {
        self.profile.device.controls
    }

    pub async fn run(mut self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut session_rx = self.session.watch();
        let mut status_rx = self.session.subscriber().watch_status();
        let mut echo_rx = self.session.subscriber().watch_echo();

        println!("{}", HELP);
        self.print_controls();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.map_err(|e| eyre!("Failed to read stdin: {}", e))? else {
                        info!("stdin closed, leaving console");
                        break;
                    };
                    match parse_line(&line) {
                        Ok(action) => {
                            if self.execute(action).await == Flow::Quit {
                                break;
                            }
                        }
                        Err(e) => println!("{}", e),
                    }
                }
                Ok(()) = session_rx.changed() => {
                    let status = session_rx.borrow_and_update().clone();
                    print_session(&status);
                }
                Ok(()) = status_rx.changed() => {
                    if let Some(record) = status_rx.borrow_and_update().clone() {
                        print_status(&record);
                    }
                }
                Ok(()) = echo_rx.changed() => {
                    if let Some(echo) = echo_rx.borrow_and_update().clone() {
                        print_echo(&echo);
                    }
                }
            }
        }
        Ok(())
    }

    /// Runs one parsed action; failures are reported and the console keeps going
    pub async fn execute(&mut self, action: ConsoleAction) -> Flow {
        match action {
            ConsoleAction::Drive {
                heading,
                speed,
                duration_ms,
            } => {
                let mut controls = self.profile.device.controls;
                controls.speed = speed.unwrap_or(controls.speed);
                controls.duration_ms = duration_ms.unwrap_or(controls.duration_ms);
                self.dispatch(Maneuver::Drive(heading), &controls).await;
            }
            ConsoleAction::Stop => {
                let controls = self.profile.device.controls;
                self.dispatch(Maneuver::Stop, &controls).await;
            }
            ConsoleAction::SetSpeed(speed) => {
                if speed > u8::MAX as u32 {
                    println!("speed {} outside 0..=255", speed);
                } else {
                    self.profile.device.controls.speed = speed;
                    self.print_controls();
                }
            }
            ConsoleAction::SetDuration(duration_ms) => {
                if duration_ms > crate::mqtt::codec::MAX_DURATION_MS {
                    println!(
                        "duration {} above {} ms",
                        duration_ms,
                        crate::mqtt::codec::MAX_DURATION_MS
                    );
                } else {
                    self.profile.device.controls.duration_ms = duration_ms;
                    self.print_controls();
                }
            }
            ConsoleAction::Status => self.show_status().await,
            ConsoleAction::Connect => match self.session.connect().await {
                Ok(state) => println!("session {:?}", state),
                Err(e) => println!("connect failed: {}", e),
            },
            ConsoleAction::Disconnect => {
                self.session.disconnect().await;
                println!("session disconnected");
            }
            ConsoleAction::Save => match self.store.save(&self.profile_name, &self.profile).await {
                Ok(()) => println!("profile {} saved", self.profile_name),
                Err(e) => {
                    warn!("Saving profile {} failed: {}", self.profile_name, e);
                    println!("save failed: {}", e);
                }
            },
            ConsoleAction::Help => println!("{}", HELP),
            ConsoleAction::Quit => return Flow::Quit,
            ConsoleAction::Nothing => {}
        }
        Flow::Continue
    }

    async fn dispatch(&self, maneuver: Maneuver, controls: &Controls) {
        let command = match Command::from_controls(maneuver, controls) {
            Ok(command) => command,
            Err(e) => {
                println!("{}", e);
                return;
            }
        };

        match &self.peer {
            Some(peer) => match peer.send(&command).await {
                Ok(reply) => println!("sent {} -> {}", command, reply.trim()),
                Err(e) => println!("send failed: {}", e),
            },
            None => match self.session.send(&command).await {
                Ok(()) => println!("sent {}", command.encode()),
                Err(e) => println!("send failed: {}", e),
            },
        }
    }

    async fn show_status(&self) {
        print_session(&self.session.status());
        match self.session.subscriber().last_status() {
            Some(record) => print_status(&record),
            None => println!("no status from {} yet", self.session.identity()),
        }
        if let Some(peer) = &self.peer {
            match peer.status().await {
                Ok(body) => println!("[http] {}", body.trim()),
                Err(e) => println!("[http] {}", e),
            }
        }
    }

    fn print_controls(&self) {
        let controls = self.profile.device.controls;
        debug!("Controls now {:?}", controls);
        println!(
            "speed {} | duration {} ms",
            controls.speed, controls.duration_ms
        );
    }
}

fn print_session(status: &SessionStatus) {
    let mut line = format!(
        "[session] {:?} | sent {} | received {}",
        status.connection_state, status.messages_sent, status.messages_received
    );
    if let Some(failure) = &status.last_failure {
        line.push_str(&format!(" | last failure: {}", failure.to_error()));
    }
    println!("{}", line);
}

fn print_status(record: &StatusRecord) {
    println!("[status] {}", record.render());
}

fn print_echo(echo: &EchoRecord) {
    match &echo.command {
        Ok(command) => println!("[echo] {}", command),
        Err(e) => println!("[echo] {} ({})", echo.record.payload, e),
    }
}
