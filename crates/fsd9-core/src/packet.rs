//! Protocol 9 wire format.
//!
//! A packet is an ASCII line of `:` separated fields. The command is a short
//! prefix glued to the first field (`#APN123:SERVER:...`). Outbound lines end
//! in `\r\n`.

use std::fmt;

/// Field separator.
pub const SPLIT_SIGN: char = ':';

/// Outbound line terminator.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Every command prefix of protocol 9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsdCommand {
    AddAtc,
    RemoveAtc,
    AddPilot,
    RemovePilot,
    RequestHandoff,
    AcHandoff,
    Message,
    RequestWeather,
    PilotPosition,
    AtcPosition,
    Ping,
    Pong,
    Plan,
    Sb,
    Pc,
    Weather,
    CloudData,
    WindData,
    TempData,
    RequestComm,
    ReplyComm,
    RequestAcars,
    ReplyAcars,
    Error,
    Cq,
    Cr,
    Kill,
    WindDelta,
}

impl FsdCommand {
    /// All commands, used for prefix matching.
    pub const ALL: [FsdCommand; 28] = [
        FsdCommand::AddAtc,
        FsdCommand::RemoveAtc,
        FsdCommand::AddPilot,
        FsdCommand::RemovePilot,
        FsdCommand::RequestHandoff,
        FsdCommand::AcHandoff,
        FsdCommand::Message,
        FsdCommand::RequestWeather,
        FsdCommand::PilotPosition,
        FsdCommand::AtcPosition,
        FsdCommand::Ping,
        FsdCommand::Pong,
        FsdCommand::Plan,
        FsdCommand::Sb,
        FsdCommand::Pc,
        FsdCommand::Weather,
        FsdCommand::CloudData,
        FsdCommand::WindData,
        FsdCommand::TempData,
        FsdCommand::RequestComm,
        FsdCommand::ReplyComm,
        FsdCommand::RequestAcars,
        FsdCommand::ReplyAcars,
        FsdCommand::Error,
        FsdCommand::Cq,
        FsdCommand::Cr,
        FsdCommand::Kill,
        FsdCommand::WindDelta,
    ];

    /// Wire prefix of the command.
    pub fn prefix(&self) -> &'static str {
        match self {
            FsdCommand::AddAtc => "#AA",
            FsdCommand::RemoveAtc => "#DA",
            FsdCommand::AddPilot => "#AP",
            FsdCommand::RemovePilot => "#DP",
            FsdCommand::RequestHandoff => "$HO",
            FsdCommand::AcHandoff => "$HA",
            FsdCommand::Message => "#TM",
            FsdCommand::RequestWeather => "#RW",
            FsdCommand::PilotPosition => "@",
            FsdCommand::AtcPosition => "%",
            FsdCommand::Ping => "$PI",
            FsdCommand::Pong => "$PO",
            FsdCommand::Plan => "$FP",
            FsdCommand::Sb => "#SB",
            FsdCommand::Pc => "#PC",
            FsdCommand::Weather => "#WX",
            FsdCommand::CloudData => "#CD",
            FsdCommand::WindData => "#WD",
            FsdCommand::TempData => "#TD",
            FsdCommand::RequestComm => "$C?",
            FsdCommand::ReplyComm => "$CI",
            FsdCommand::RequestAcars => "$AX",
            FsdCommand::ReplyAcars => "$AR",
            FsdCommand::Error => "$ER",
            FsdCommand::Cq => "$CQ",
            FsdCommand::Cr => "$CR",
            FsdCommand::Kill => "$!!",
            FsdCommand::WindDelta => "#DL",
        }
    }

    /// Returns the command whose prefix starts `line`. The longest matching
    /// prefix wins.
    pub fn from_line(line: &str) -> Option<FsdCommand> {
        Self::ALL
            .iter()
            .filter(|cmd| line.starts_with(cmd.prefix()))
            .max_by_key(|cmd| cmd.prefix().len())
            .copied()
    }

    /// Commands a client may send. The rest are server-to-client only.
    pub fn is_client_command(&self) -> bool {
        !matches!(
            self,
            FsdCommand::RequestWeather
                | FsdCommand::CloudData
                | FsdCommand::WindData
                | FsdCommand::TempData
                | FsdCommand::ReplyAcars
                | FsdCommand::Error
                | FsdCommand::WindDelta
        )
    }
}

impl fmt::Display for FsdCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A line split into its command and fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet<'a> {
    pub command: Option<FsdCommand>,
    pub fields: Vec<&'a str>,
}

impl<'a> Packet<'a> {
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field at `index`, empty if missing.
    pub fn field(&self, index: usize) -> &'a str {
        self.fields.get(index).copied().unwrap_or("")
    }

    /// Fields from `index` on, re-joined with the separator.
    pub fn rest_from(&self, index: usize) -> String {
        self.fields
            .get(index..)
            .map(|rest| rest.join(":"))
            .unwrap_or_default()
    }
}

/// Splits a line into command and fields, stripping the prefix from the
/// first field.
///
/// ```
/// use fsd9_core::packet::{break_packet, FsdCommand};
///
/// let packet = break_packet("#TMN123:*:hello");
/// assert_eq!(packet.command, Some(FsdCommand::Message));
/// assert_eq!(packet.fields, vec!["N123", "*", "hello"]);
/// ```
pub fn break_packet(line: &str) -> Packet<'_> {
    let command = FsdCommand::from_line(line);
    let body = match command {
        Some(cmd) => &line[cmd.prefix().len()..],
        None => line,
    };
    Packet {
        command,
        fields: body.split(SPLIT_SIGN).collect(),
    }
}

/// Joins parts with the field separator.
pub fn make_packet<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            out.push(SPLIT_SIGN);
        }
        out.push_str(part.as_ref());
    }
    out
}

/// Protocol error codes sent in `$ER` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FsdErrorCode {
    Ok = 0,
    CallsignInUse = 1,
    CallsignInvalid = 2,
    AlreadyRegistered = 3,
    Syntax = 4,
    SourceInvalid = 5,
    CidInvalid = 6,
    NoSuchCallsign = 7,
    NoFlightPlan = 8,
    NoWeather = 9,
    Revision = 10,
    Level = 11,
    ServerFull = 12,
    Suspended = 13,
}

impl FsdErrorCode {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Human readable text that ends the `$ER` line.
    pub fn text(&self) -> &'static str {
        match self {
            FsdErrorCode::Ok => "No error",
            FsdErrorCode::CallsignInUse => "Callsign in use",
            FsdErrorCode::CallsignInvalid => "Callsign invalid",
            FsdErrorCode::AlreadyRegistered => "Already registered",
            FsdErrorCode::Syntax => "Syntax error",
            FsdErrorCode::SourceInvalid => "Invalid source in packet",
            FsdErrorCode::CidInvalid => "Invalid CID/password",
            FsdErrorCode::NoSuchCallsign => "No such callsign",
            FsdErrorCode::NoFlightPlan => "No flightplan",
            FsdErrorCode::NoWeather => "No such weather",
            FsdErrorCode::Revision => "Invalid protocol revision",
            FsdErrorCode::Level => "Requested level too high",
            FsdErrorCode::ServerFull => "No more clients",
            FsdErrorCode::Suspended => "CID/PID suspended",
        }
    }
}

/// Builds `$ERserver:{callsign}:{code:03}:{env}:{text}`.
pub fn error_line(callsign: Option<&str>, code: FsdErrorCode, env: &str) -> String {
    format!(
        "$ERserver:{}:{:03}:{}:{}",
        callsign.unwrap_or("unknown"),
        code.code(),
        env,
        code.text()
    )
}

/// Callsigns are 2 to 12 characters with no separators or wildcards.
pub fn is_valid_callsign(callsign: &str) -> bool {
    const FORBIDDEN: &[char] = &['!', '@', '#', '$', '%', '*', ':', '&', ' ', '\t'];
    (2..=12).contains(&callsign.len()) && !callsign.contains(FORBIDDEN)
}

/// Station codes are exactly four ASCII letters or digits.
pub fn is_icao_code(code: &str) -> bool {
    code.len() == 4 && code.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Targets that address more than one client.
pub fn is_multicast(target: &str) -> bool {
    matches!(target, "*" | "*A" | "*P") || target.starts_with('@')
}

/// Replaces every non-ASCII character with `?`.
pub fn ascii_only(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_ascii() { c } else { '?' })
        .collect()
}
