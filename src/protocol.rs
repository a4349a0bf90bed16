//! Imaging Machine command protocol.
//!
//! Protocol Overview:
//! - Transport: TCP, ASCII, one line per message (`\n` terminated)
//! - Request: `Name(arg1,arg2,...)`
//! - Reply: `OK`, `OK <value>` or `ERR <message>`
//! - Timing: half-duplex request/response, one outstanding request
//!
//! Argument encoding:
//! - integers in decimal
//! - X/Y coordinates in mm with 3 decimals, Z in µm with 1 decimal
//! - booleans as `true` / `false`
//! - strings double-quoted, with `\\`, `\"`, `\n` and `\r` escaped; a missing
//!   optional string is `""`
//!
//! # Example
//!
//! ```
//! use im_control::protocol::{Command, Reply};
//!
//! let line = Command::MoveXyTo { x: 10.123, y: 30.456 }.encode();
//! assert_eq!(line, "MoveXYTo(10.123,30.456)");
//! assert_eq!(Command::parse(&line).unwrap(), Command::MoveXyTo { x: 10.123, y: 30.456 });
//!
//! assert_eq!(Reply::parse("OK 18010.0").unwrap(), Reply::Ok(Some("18010.0".into())));
//! ```

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::types::{
    Acquisition, AutofocusSettings, CameraRoi, LightSettings, LightSource, Mode, StackSettings,
};

/// Errors raised while encoding or decoding protocol lines.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    /// The request line is not of the form `Name(args)`.
    #[error("malformed request line: {0}")]
    MalformedRequest(String),

    /// The command name is not part of the protocol.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// The command received the wrong number of arguments.
    #[error("{command} expects {expected} argument(s), got {found}")]
    ArgumentCount {
        /// Command name.
        command: &'static str,
        /// Expected argument count.
        expected: usize,
        /// Received argument count.
        found: usize,
    },

    /// One argument could not be decoded.
    #[error("{command}: invalid argument #{index} '{value}'")]
    InvalidArgument {
        /// Command name.
        command: &'static str,
        /// 1-based position of the argument.
        index: usize,
        /// Raw argument text.
        value: String,
    },

    /// A quoted string was not closed.
    #[error("unterminated string in: {0}")]
    UnterminatedString(String),

    /// The reply line is neither `OK` nor `ERR`.
    #[error("malformed reply: {0}")]
    MalformedReply(String),

    /// A value does not belong to its type (mode, light source, ...).
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// One request understood by the Imaging Machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Select the objective mounted at slot `index`.
    SetObjective(u8),
    /// Absolute XY move, mm.
    MoveXyTo {
        /// Target X in mm.
        x: f64,
        /// Target Y in mm.
        y: f64,
    },
    /// Relative XY move, mm.
    MoveXyBy {
        /// X step in mm.
        dx: f64,
        /// Y step in mm.
        dy: f64,
    },
    /// Absolute Z move, µm.
    MoveZTo(f64),
    /// Relative Z move, µm.
    MoveZBy(f64),
    /// Absolute XYZ move.
    MoveXyzTo {
        /// Target X in mm.
        x: f64,
        /// Target Y in mm.
        y: f64,
        /// Target Z in µm.
        z: f64,
    },
    /// Switch on a light source with the given settings.
    SetLightSource(LightSettings),
    /// Switch on fluorescence LEDs; the light source is always `Fluo`.
    SetFluoChannel(LightSettings),
    /// Set camera ROI and binning.
    SetCamera(CameraRoi),
    /// Restore the full-frame camera settings.
    ResetCamera,
    /// Image-based autofocus over a stack.
    RunSoftwareAutofocus(AutofocusSettings),
    /// Autofocus with the dedicated hardware focus sensor.
    RunHardwareAutofocus {
        /// Objective slot.
        objective: u8,
        /// Detection filter slot.
        detection_filter: u8,
        /// Start of the search in µm.
        z_start: f64,
    },
    /// Well ID tag for the next acquisitions.
    SetMetadataWellId(String),
    /// Subposition tag for the next acquisitions.
    SetMetadataSubposition(u32),
    /// Timepoint tag for the next acquisitions.
    SetMetadataTimepoint(u32),
    /// Default project folder for acquisitions without a save directory.
    SetDefaultProjectFolder(String),
    /// Plate ID used to name plate directories.
    SetPlateId(String),
    /// Switch operating mode.
    SetMode(Mode),
    /// Acquire a stack.
    Acquire(Acquisition),
    /// End the session; the device returns to live mode.
    CloseConnection,
    /// Read the operating mode.
    GetMode,
    /// Read the selected objective slot.
    GetObjective,
    /// Read the X position in mm.
    GetPositionX,
    /// Read the Y position in mm.
    GetPositionY,
    /// Read the Z position in µm.
    GetPositionZ,
    /// Read the default project folder.
    GetProjectFolder,
    /// Read the plate ID.
    GetPlateId,
}

impl Command {
    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetObjective(_) => "SetObjective",
            Command::MoveXyTo { .. } => "MoveXYTo",
            Command::MoveXyBy { .. } => "MoveXYBy",
            Command::MoveZTo(_) => "MoveZTo",
            Command::MoveZBy(_) => "MoveZBy",
            Command::MoveXyzTo { .. } => "MoveXYZTo",
            Command::SetLightSource(_) => "SetLightSource",
            Command::SetFluoChannel(_) => "SetFluoChannel",
            Command::SetCamera(_) => "SetCamera",
            Command::ResetCamera => "ResetCamera",
            Command::RunSoftwareAutofocus(_) => "RunSoftwareAutoFocus",
            Command::RunHardwareAutofocus { .. } => "RunHardwareAutoFocus",
            Command::SetMetadataWellId(_) => "SetMetadataWellId",
            Command::SetMetadataSubposition(_) => "SetMetadataSubposition",
            Command::SetMetadataTimepoint(_) => "SetMetadataTimepoint",
            Command::SetDefaultProjectFolder(_) => "SetDefaultProjectFolder",
            Command::SetPlateId(_) => "SetPlateId",
            Command::SetMode(_) => "SetMode",
            Command::Acquire(_) => "Acquire",
            Command::CloseConnection => "CloseConnection",
            Command::GetMode => "GetMode",
            Command::GetObjective => "GetObjective",
            Command::GetPositionX => "GetPositionX",
            Command::GetPositionY => "GetPositionY",
            Command::GetPositionZ => "GetPositionZ",
            Command::GetProjectFolder => "GetProjectFolder",
            Command::GetPlateId => "GetPlateId",
        }
    }

    /// True for commands that run a long device-side routine (autofocus, acquire).
    pub fn is_long_running(&self) -> bool {
        matches!(
            self,
            Command::RunSoftwareAutofocus(_)
                | Command::RunHardwareAutofocus { .. }
                | Command::Acquire(_)
        )
    }

    /// Encode as a request line, without the terminator.
    pub fn encode(&self) -> String {
        let args: Vec<String> = match self {
            Command::SetObjective(index) => vec![index.to_string()],
            Command::MoveXyTo { x, y } => vec![mm(*x), mm(*y)],
            Command::MoveXyBy { dx, dy } => vec![mm(*dx), mm(*dy)],
            Command::MoveZTo(z) | Command::MoveZBy(z) => vec![um(*z)],
            Command::MoveXyzTo { x, y, z } => vec![mm(*x), mm(*y), um(*z)],
            Command::SetLightSource(light) | Command::SetFluoChannel(light) => light_args(light),
            Command::SetCamera(roi) => vec![
                roi.x.to_string(),
                roi.y.to_string(),
                roi.width.to_string(),
                roi.height.to_string(),
                roi.binning.to_string(),
            ],
            Command::RunSoftwareAutofocus(af) => {
                let mut args = vec![
                    quote(&af.light_source.to_string()),
                    af.detection_filter.to_string(),
                    af.intensity.to_string(),
                    af.exposure_ms.to_string(),
                ];
                args.extend(stack_args(&af.stack));
                args
            }
            Command::RunHardwareAutofocus {
                objective,
                detection_filter,
                z_start,
            } => vec![objective.to_string(), detection_filter.to_string(), um(*z_start)],
            Command::SetMetadataWellId(s)
            | Command::SetDefaultProjectFolder(s)
            | Command::SetPlateId(s) => vec![quote(s)],
            Command::SetMetadataSubposition(n) | Command::SetMetadataTimepoint(n) => {
                vec![n.to_string()]
            }
            Command::SetMode(mode) => vec![quote(mode.as_str())],
            Command::Acquire(acq) => {
                let light = &acq.light;
                let mut args = vec![
                    light.channel.to_string(),
                    quote(&light.light_source.to_string()),
                    light.detection_filter.to_string(),
                    light.intensity.to_string(),
                    light.exposure_ms.to_string(),
                ];
                args.extend(stack_args(&acq.stack));
                args.push(light.light_constant_on.to_string());
                args.push(quote(acq.save_directory.as_deref().unwrap_or("")));
                args
            }
            Command::ResetCamera
            | Command::CloseConnection
            | Command::GetMode
            | Command::GetObjective
            | Command::GetPositionX
            | Command::GetPositionY
            | Command::GetPositionZ
            | Command::GetProjectFolder
            | Command::GetPlateId => Vec::new(),
        };
        format!("{}({})", self.name(), args.join(","))
    }

    /// Decode a request line.
    pub fn parse(line: &str) -> Result<Command, ProtocolError> {
        let line = line.trim();
        let open = line
            .find('(')
            .ok_or_else(|| ProtocolError::MalformedRequest(line.to_string()))?;
        if !line.ends_with(')') {
            return Err(ProtocolError::MalformedRequest(line.to_string()));
        }
        let name = line[..open].trim();
        let tokens = tokenize(&line[open + 1..line.len() - 1])?;

        let (command, expected): (&'static str, usize) = match name {
            "SetObjective" => ("SetObjective", 1),
            "MoveXYTo" => ("MoveXYTo", 2),
            "MoveXYBy" => ("MoveXYBy", 2),
            "MoveZTo" => ("MoveZTo", 1),
            "MoveZBy" => ("MoveZBy", 1),
            "MoveXYZTo" => ("MoveXYZTo", 3),
            "SetLightSource" => ("SetLightSource", 6),
            "SetFluoChannel" => ("SetFluoChannel", 6),
            "SetCamera" => ("SetCamera", 5),
            "ResetCamera" => ("ResetCamera", 0),
            "RunSoftwareAutoFocus" => ("RunSoftwareAutoFocus", 7),
            "RunHardwareAutoFocus" => ("RunHardwareAutoFocus", 3),
            "SetMetadataWellId" => ("SetMetadataWellId", 1),
            "SetMetadataSubposition" => ("SetMetadataSubposition", 1),
            "SetMetadataTimepoint" => ("SetMetadataTimepoint", 1),
            "SetDefaultProjectFolder" => ("SetDefaultProjectFolder", 1),
            "SetPlateId" => ("SetPlateId", 1),
            "SetMode" => ("SetMode", 1),
            "Acquire" => ("Acquire", 10),
            "CloseConnection" => ("CloseConnection", 0),
            "GetMode" => ("GetMode", 0),
            "GetObjective" => ("GetObjective", 0),
            "GetPositionX" => ("GetPositionX", 0),
            "GetPositionY" => ("GetPositionY", 0),
            "GetPositionZ" => ("GetPositionZ", 0),
            "GetProjectFolder" => ("GetProjectFolder", 0),
            "GetPlateId" => ("GetPlateId", 0),
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        };
        if tokens.len() != expected {
            return Err(ProtocolError::ArgumentCount {
                command,
                expected,
                found: tokens.len(),
            });
        }
        let args = Args { command, tokens };

        let parsed = match command {
            "SetObjective" => Command::SetObjective(args.num(0)?),
            "MoveXYTo" => Command::MoveXyTo {
                x: args.num(0)?,
                y: args.num(1)?,
            },
            "MoveXYBy" => Command::MoveXyBy {
                dx: args.num(0)?,
                dy: args.num(1)?,
            },
            "MoveZTo" => Command::MoveZTo(args.num(0)?),
            "MoveZBy" => Command::MoveZBy(args.num(0)?),
            "MoveXYZTo" => Command::MoveXyzTo {
                x: args.num(0)?,
                y: args.num(1)?,
                z: args.num(2)?,
            },
            "SetLightSource" => Command::SetLightSource(args.light(0)?),
            "SetFluoChannel" => {
                let light = args.light(0)?;
                if !matches!(light.light_source, LightSource::Fluo(_)) {
                    return Err(args.invalid(1));
                }
                Command::SetFluoChannel(light)
            }
            "SetCamera" => Command::SetCamera(CameraRoi {
                x: args.num(0)?,
                y: args.num(1)?,
                width: args.num(2)?,
                height: args.num(3)?,
                binning: args.num(4)?,
            }),
            "ResetCamera" => Command::ResetCamera,
            "RunSoftwareAutoFocus" => Command::RunSoftwareAutofocus(AutofocusSettings {
                light_source: args.value(0)?,
                detection_filter: args.num(1)?,
                intensity: args.num(2)?,
                exposure_ms: args.num(3)?,
                stack: args.stack(4)?,
            }),
            "RunHardwareAutoFocus" => Command::RunHardwareAutofocus {
                objective: args.num(0)?,
                detection_filter: args.num(1)?,
                z_start: args.num(2)?,
            },
            "SetMetadataWellId" => Command::SetMetadataWellId(args.string(0)?),
            "SetMetadataSubposition" => Command::SetMetadataSubposition(args.num(0)?),
            "SetMetadataTimepoint" => Command::SetMetadataTimepoint(args.num(0)?),
            "SetDefaultProjectFolder" => Command::SetDefaultProjectFolder(args.string(0)?),
            "SetPlateId" => Command::SetPlateId(args.string(0)?),
            "SetMode" => Command::SetMode(args.value(0)?),
            "Acquire" => {
                let light = LightSettings {
                    channel: args.num(0)?,
                    light_source: args.value(1)?,
                    detection_filter: args.num(2)?,
                    intensity: args.num(3)?,
                    exposure_ms: args.num(4)?,
                    light_constant_on: args.boolean(8)?,
                };
                let save_directory = Some(args.string(9)?).filter(|dir| !dir.is_empty());
                Command::Acquire(Acquisition {
                    light,
                    stack: args.stack(5)?,
                    save_directory,
                })
            }
            "CloseConnection" => Command::CloseConnection,
            "GetMode" => Command::GetMode,
            "GetObjective" => Command::GetObjective,
            "GetPositionX" => Command::GetPositionX,
            "GetPositionY" => Command::GetPositionY,
            "GetPositionZ" => Command::GetPositionZ,
            "GetProjectFolder" => Command::GetProjectFolder,
            _ => Command::GetPlateId,
        };
        Ok(parsed)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Reply to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Command completed, optionally with a value.
    Ok(Option<String>),
    /// Command rejected or failed on the device.
    Err(String),
}

impl Reply {
    /// Decode a reply line.
    pub fn parse(line: &str) -> Result<Reply, ProtocolError> {
        let line = line.trim();
        if line == "OK" {
            return Ok(Reply::Ok(None));
        }
        if let Some(value) = line.strip_prefix("OK ") {
            let value = value.trim();
            return Ok(Reply::Ok((!value.is_empty()).then(|| value.to_string())));
        }
        if line == "ERR" {
            return Ok(Reply::Err(String::new()));
        }
        if let Some(message) = line.strip_prefix("ERR ") {
            return Ok(Reply::Err(message.trim().to_string()));
        }
        Err(ProtocolError::MalformedReply(line.to_string()))
    }

    /// Encode as a reply line, without the terminator.
    ///
    /// Embedded line breaks are flattened to spaces so a reply always fits
    /// one line. Reply values are not escaped, so a value containing `\r` or
    /// `\n` (such as a project folder set with a line break) reads back with
    /// spaces in their place.
    pub fn encode(&self) -> String {
        match self {
            Reply::Ok(None) => "OK".to_string(),
            Reply::Ok(Some(value)) => format!("OK {}", single_line(value)),
            Reply::Err(message) => format!("ERR {}", single_line(message)),
        }
    }
}

fn single_line(s: &str) -> String {
    s.replace(['\r', '\n'], " ")
}

fn mm(value: f64) -> String {
    format!("{value:.3}")
}

fn um(value: f64) -> String {
    format!("{value:.1}")
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn stack_args(stack: &StackSettings) -> [String; 3] {
    [um(stack.z_center), stack.n_slices.to_string(), um(stack.z_step)]
}

fn light_args(light: &LightSettings) -> Vec<String> {
    vec![
        light.channel.to_string(),
        quote(&light.light_source.to_string()),
        light.detection_filter.to_string(),
        light.intensity.to_string(),
        light.exposure_ms.to_string(),
        light.light_constant_on.to_string(),
    ]
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Bare(String),
    Quoted(String),
}

impl Token {
    fn text(&self) -> &str {
        match self {
            Token::Bare(s) | Token::Quoted(s) => s,
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ProtocolError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    if input.trim().is_empty() {
        return Ok(tokens);
    }

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        if chars.next_if_eq(&'"').is_some() {
            let mut s = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('n') => s.push('\n'),
                        Some('r') => s.push('\r'),
                        Some(c) => s.push(c),
                        None => return Err(ProtocolError::UnterminatedString(input.to_string())),
                    },
                    Some(c) => s.push(c),
                    None => return Err(ProtocolError::UnterminatedString(input.to_string())),
                }
            }
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            tokens.push(Token::Quoted(s));
        } else {
            let mut s = String::new();
            while let Some(c) = chars.next_if(|c| *c != ',') {
                s.push(c);
            }
            tokens.push(Token::Bare(s.trim().to_string()));
        }

        match chars.next() {
            None => return Ok(tokens),
            Some(',') => continue,
            Some(_) => return Err(ProtocolError::MalformedRequest(input.to_string())),
        }
    }
}

struct Args {
    command: &'static str,
    tokens: Vec<Token>,
}

impl Args {
    fn invalid(&self, i: usize) -> ProtocolError {
        ProtocolError::InvalidArgument {
            command: self.command,
            index: i + 1,
            value: self.tokens.get(i).map(|t| t.text().to_string()).unwrap_or_default(),
        }
    }

    fn num<T: FromStr>(&self, i: usize) -> Result<T, ProtocolError> {
        match &self.tokens[i] {
            Token::Bare(s) => s.parse().map_err(|_| self.invalid(i)),
            Token::Quoted(_) => Err(self.invalid(i)),
        }
    }

    fn boolean(&self, i: usize) -> Result<bool, ProtocolError> {
        match self.tokens[i].text().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(self.invalid(i)),
        }
    }

    fn string(&self, i: usize) -> Result<String, ProtocolError> {
        match &self.tokens[i] {
            Token::Quoted(s) => Ok(s.clone()),
            Token::Bare(_) => Err(self.invalid(i)),
        }
    }

    fn value<T: FromStr>(&self, i: usize) -> Result<T, ProtocolError> {
        self.tokens[i].text().parse().map_err(|_| self.invalid(i))
    }

    fn stack(&self, i: usize) -> Result<StackSettings, ProtocolError> {
        Ok(StackSettings::new(self.num(i)?, self.num(i + 1)?, self.num(i + 2)?))
    }

    fn light(&self, i: usize) -> Result<LightSettings, ProtocolError> {
        Ok(LightSettings {
            channel: self.num(i)?,
            light_source: self.value(i + 1)?,
            detection_filter: self.num(i + 2)?,
            intensity: self.num(i + 3)?,
            exposure_ms: self.num(i + 4)?,
            light_constant_on: self.boolean(i + 5)?,
        })
    }
}
