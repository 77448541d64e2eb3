// src/configfile.rs
// Reads and processes the printer configuration.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Section not found: [{0}]")]
    SectionNotFound(String),
    #[error("Option '{1}' not found in section '[{0}]'")]
    OptionNotFound(String, String),
    #[error("Failed to parse option '{0}' value '{1}' as {2}")]
    ParseError(String, String, String), // option, value, type_expected
    #[error("Validation error: {0}")]
    ValidationError(String), // General validation like min/max
    #[error("Syntax error: {0}")]
    SyntaxError(String),
    #[error("Unable to open config file {0}: {1}")]
    Io(String, String),
}

#[derive(Debug, Default, Clone)]
pub struct Configfile {
    // section_name -> { option_name -> option_value }
    // Section and option names are stored as lowercase.
    data: HashMap<String, HashMap<String, String>>,
    filename: Option<String>,
}

impl Configfile {
    pub fn new(filename: Option<String>) -> Self {
        Configfile {
            data: HashMap::new(),
            filename,
        }
    }

    /// Loads and parses a config file from disk.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(name.clone(), e.to_string()))?;
        let mut cf = Configfile::new(Some(name));
        cf.parse(&content)?;
        Ok(cf)
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Parses an INI-style configuration string.
    ///
    /// Indented lines directly following an option are continuation lines and
    /// are appended to that option's value, separated by newlines. This is how
    /// multi-line G-code scripts are written.
    pub fn parse(&mut self, config_content: &str) -> Result<(), ConfigError> {
        self.data.clear();
        let mut current_section: Option<String> = None;
        let mut current_option: Option<String> = None;

        for line_raw in config_content.lines() {
            let line_no_comment = match line_raw.find(|c| c == '#' || c == ';') {
                Some(index) => &line_raw[..index],
                None => line_raw,
            };
            let line = line_no_comment.trim();

            if line.is_empty() {
                continue;
            }

            let indented = line_raw.starts_with(' ') || line_raw.starts_with('\t');
            if indented {
                if let (Some(section), Some(option)) = (&current_section, &current_option) {
                    if let Some(value) = self.data.get_mut(section).and_then(|s| s.get_mut(option)) {
                        if !value.is_empty() {
                            value.push('\n');
                        }
                        value.push_str(line);
                        continue;
                    }
                }
            }

            if line.starts_with('[') && line.ends_with(']') {
                let section_name = line[1..line.len() - 1].trim().to_lowercase();
                if section_name.is_empty() {
                    return Err(ConfigError::SyntaxError("Empty section name found".to_string()));
                }
                self.data.entry(section_name.clone()).or_default();
                current_section = Some(section_name);
                current_option = None;
                continue;
            }

            let Some(section) = current_section.as_ref() else {
                return Err(ConfigError::SyntaxError(format!("Line outside of section: {}", line_raw)));
            };

            let split_at = match (line.find('='), line.find(':')) {
                (Some(eq), Some(colon)) => Some(eq.min(colon)),
                (eq, colon) => eq.or(colon),
            };
            let Some(idx) = split_at else {
                return Err(ConfigError::SyntaxError(format!(
                    "Malformed line in section [{}]: {}",
                    section, line_raw
                )));
            };
            let key = line[..idx].trim().to_lowercase();
            let value = line[idx + 1..].trim().to_string();
            if key.is_empty() {
                return Err(ConfigError::SyntaxError(format!("Empty key found in section [{}]", section)));
            }
            self.data.entry(section.clone()).or_default().insert(key.clone(), value);
            current_option = Some(key);
        }
        Ok(())
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.data.contains_key(&section.to_lowercase())
    }

    /// Section names starting with `prefix`, sorted.
    pub fn sections_with_prefix(&self, prefix: &str) -> Vec<String> {
        let prefix = prefix.to_lowercase();
        let mut names: Vec<String> = self.data.keys().filter(|s| s.starts_with(&prefix)).cloned().collect();
        names.sort();
        names
    }

    // Helper to get a raw string value
    pub fn get_str(&self, section: &str, option: &str) -> Result<&String, ConfigError> {
        self.data
            .get(&section.to_lowercase())
            .ok_or_else(|| ConfigError::SectionNotFound(section.to_string()))?
            .get(&option.to_lowercase())
            .ok_or_else(|| ConfigError::OptionNotFound(section.to_string(), option.to_string()))
    }

    // Looks up an option, falling back to `default` only when the option is missing.
    fn lookup<T>(
        &self,
        section: &str,
        option: &str,
        default: Option<T>,
        parse: impl FnOnce(&String) -> Result<T, ConfigError>,
    ) -> Result<T, ConfigError> {
        match self.get_str(section, option) {
            Ok(s_val) => parse(s_val),
            Err(ConfigError::OptionNotFound(_, _)) => {
                default.ok_or_else(|| ConfigError::OptionNotFound(section.to_string(), option.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, section: &str, option: &str, default: Option<&str>) -> Result<String, ConfigError> {
        self.lookup(section, option, default.map(str::to_string), |s| Ok(s.clone()))
    }

    pub fn getfloat(&self, section: &str, option: &str, default: Option<f64>, minval: Option<f64>, maxval: Option<f64>) -> Result<f64, ConfigError> {
        self.lookup(section, option, default, |s_val| {
            let parsed_val = s_val.parse::<f64>().map_err(|_| {
                ConfigError::ParseError(option.to_string(), s_val.clone(), "float".to_string())
            })?;
            check_bounds(section, option, parsed_val, minval, maxval)?;
            Ok(parsed_val)
        })
    }

    /// Float option that must be strictly greater than `above`.
    pub fn getfloat_above(&self, section: &str, option: &str, default: Option<f64>, above: f64) -> Result<f64, ConfigError> {
        let val = self.getfloat(section, option, default, None, None)?;
        if val <= above {
            return Err(ConfigError::ValidationError(format!(
                "Option '{}' in section '[{}]' ({}) must be above {}", option, section, val, above
            )));
        }
        Ok(val)
    }

    pub fn getint(&self, section: &str, option: &str, default: Option<i64>, minval: Option<i64>, maxval: Option<i64>) -> Result<i64, ConfigError> {
        self.lookup(section, option, default, |s_val| {
            let parsed_val = s_val.parse::<i64>().map_err(|_| {
                ConfigError::ParseError(option.to_string(), s_val.clone(), "integer".to_string())
            })?;
            check_bounds(section, option, parsed_val, minval, maxval)?;
            Ok(parsed_val)
        })
    }
}

fn check_bounds<T: PartialOrd + std::fmt::Display>(
    section: &str,
    option: &str,
    val: T,
    minval: Option<T>,
    maxval: Option<T>,
) -> Result<(), ConfigError> {
    if let Some(min) = minval {
        if val < min {
            return Err(ConfigError::ValidationError(format!(
                "Option '{}' in section '[{}]' ({}) must be >= {}", option, section, val, min
            )));
        }
    }
    if let Some(max) = maxval {
        if val > max {
            return Err(ConfigError::ValidationError(format!(
                "Option '{}' in section '[{}]' ({}) must be <= {}", option, section, val, max
            )));
        }
    }
    Ok(())
}
