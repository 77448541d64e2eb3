// src/gcode.rs
// G-code parsing, command registration and dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("{0}")]
    GCodeError(String),
    #[error("Unknown command: \"{0}\"")]
    UnknownCommand(String),
    #[error("Malformed command '{0}'")]
    Malformed(String),
    #[error("Error on '{line}': {message}")]
    BadParameter { line: String, message: String },
}

/// A parsed G-code line.
///
/// Classic commands (`G28 Z`, `G1 X10`) store each parameter under its letter,
/// with an empty value for bare flags. Extended commands
/// (`STABLE_Z_HOME RETRIES=5`) store `NAME=VALUE` pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct GCodeCommand {
    pub command: String,
    pub raw_line: String,
    pub params: HashMap<String, String>,
}

impl GCodeCommand {
    pub fn has_param(&self, name: &str) -> bool {
        self.params.contains_key(&name.to_uppercase())
    }

    pub fn get(&self, name: &str, default: Option<&str>) -> Result<String, CommandError> {
        match self.params.get(&name.to_uppercase()) {
            Some(v) => Ok(v.clone()),
            None => default
                .map(str::to_string)
                .ok_or_else(|| self.param_error(format!("Missing required parameter '{}'", name))),
        }
    }

    pub fn get_int(&self, name: &str, default: Option<i64>, minval: Option<i64>) -> Result<i64, CommandError> {
        let val = match self.params.get(&name.to_uppercase()) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| self.param_error(format!("Unable to parse '{}' as a int", raw)))?,
            None => default.ok_or_else(|| self.param_error(format!("Missing required parameter '{}'", name)))?,
        };
        if let Some(min) = minval {
            if val < min {
                return Err(self.param_error(format!("{} must have minimum of {}", name, min)));
            }
        }
        Ok(val)
    }

    pub fn get_float(&self, name: &str, default: Option<f64>, minval: Option<f64>) -> Result<f64, CommandError> {
        let val = match self.params.get(&name.to_uppercase()) {
            Some(raw) => raw
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| self.param_error(format!("Unable to parse '{}' as a float", raw)))?,
            None => default.ok_or_else(|| self.param_error(format!("Missing required parameter '{}'", name)))?,
        };
        if let Some(min) = minval {
            if val < min {
                return Err(self.param_error(format!("{} must have minimum of {}", name, min)));
            }
        }
        Ok(val)
    }

    fn param_error(&self, message: String) -> CommandError {
        CommandError::BadParameter { line: self.raw_line.clone(), message }
    }
}

/// Parses one line. Returns `Ok(None)` for blank and comment-only lines.
pub fn parse_line(line: &str) -> Result<Option<GCodeCommand>, CommandError> {
    let clean_line = line.split(';').next().unwrap_or("").trim();
    if clean_line.is_empty() {
        return Ok(None);
    }

    let mut parts = clean_line.split_whitespace();
    let command = match parts.next() {
        Some(c) => c.to_uppercase(),
        None => return Ok(None),
    };
    if !command.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return Err(CommandError::Malformed(clean_line.to_string()));
    }

    let extended = command.len() > 1 && !command[1..].chars().all(|c| c.is_ascii_digit() || c == '.');
    let mut params = HashMap::new();
    for part in parts {
        if extended {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| CommandError::Malformed(clean_line.to_string()))?;
            if key.is_empty() {
                return Err(CommandError::Malformed(clean_line.to_string()));
            }
            params.insert(key.to_uppercase(), value.to_string());
        } else {
            let mut chars = part.chars();
            let letter = match chars.next() {
                Some(c) if c.is_ascii_alphabetic() => c.to_ascii_uppercase(),
                _ => return Err(CommandError::Malformed(clean_line.to_string())),
            };
            params.insert(letter.to_string(), chars.as_str().to_string());
        }
    }

    Ok(Some(GCodeCommand {
        command,
        raw_line: clean_line.to_string(),
        params,
    }))
}

pub type GCodeHandler = dyn Fn(&GCodeCommand) -> Result<(), CommandError> + Send + Sync;

struct RegisteredCommand {
    handler: Arc<GCodeHandler>,
    help: Option<String>,
}

/// Command registry and script runner.
///
/// Handlers may call back into `run_script`; the registry lock is not held
/// while a handler runs.
#[derive(Default)]
pub struct GCode {
    commands: RwLock<HashMap<String, RegisteredCommand>>,
    responses: Mutex<Vec<String>>,
}

impl GCode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_command<F>(&self, command: &str, handler: F, help: Option<&str>)
    where
        F: Fn(&GCodeCommand) -> Result<(), CommandError> + Send + Sync + 'static,
    {
        let command = command.to_uppercase();
        let mut commands = self.commands.write();
        if commands.contains_key(&command) {
            log::warn!("G-code command {} registered twice, replacing previous handler", command);
        }
        commands.insert(
            command,
            RegisteredCommand { handler: Arc::new(handler), help: help.map(str::to_string) },
        );
    }

    pub fn get_help(&self, command: &str) -> Option<String> {
        self.commands.read().get(&command.to_uppercase()).and_then(|c| c.help.clone())
    }

    pub fn run_command(&self, gcmd: &GCodeCommand) -> Result<(), CommandError> {
        let handler = self
            .commands
            .read()
            .get(&gcmd.command)
            .map(|c| Arc::clone(&c.handler))
            .ok_or_else(|| CommandError::UnknownCommand(gcmd.command.clone()))?;
        log::debug!("Running G-code: {}", gcmd.raw_line);
        handler(gcmd)
    }

    /// Runs each line of `script` in order, stopping at the first failure.
    pub fn run_script(&self, script: &str) -> Result<(), CommandError> {
        for line in script.lines() {
            if let Some(gcmd) = parse_line(line)? {
                self.run_command(&gcmd)?;
            }
        }
        Ok(())
    }

    pub fn respond_info(&self, msg: &str) {
        let msg = msg.trim_end();
        log::info!("{}", msg);
        self.responses.lock().push(msg.to_string());
    }

    /// Drains the responses emitted so far.
    pub fn take_responses(&self) -> Vec<String> {
        std::mem::take(&mut *self.responses.lock())
    }
}
