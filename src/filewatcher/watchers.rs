//! Watch modes and file checks.

use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

use super::hdf5::{FileHandles, FrameLocation, Hdf5Backend};
use super::FilewatcherError;
use crate::recipe::ParameterChain;

/// A C-style numeric file pattern such as `tst_%05d.cbf`
#[derive(Debug, Clone, PartialEq)]
pub struct FilePattern {
    pattern: String,
    prefix: String,
    suffix: String,
    width: usize,
    zero_pad: bool,
    left_align: bool,
    plus_sign: bool,
}

impl FilePattern {
    /// Accepts exactly one `%[flags][width]d` (or `%i`, `%u`); `%%` is a literal `%`
    pub fn parse(pattern: &str) -> Result<Self, FilewatcherError> {
        let invalid = |reason: &str| FilewatcherError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let mut prefix = String::new();
        let mut suffix = String::new();
        let mut conversion: Option<(usize, bool, bool, bool)> = None;
        let mut chars = pattern.chars().peekable();

        while let Some(c) = chars.next() {
            let target = if conversion.is_some() {
                &mut suffix
            } else {
                &mut prefix
            };
            if c != '%' {
                target.push(c);
                continue;
            }
            if chars.peek() == Some(&'%') {
                chars.next();
                target.push('%');
                continue;
            }
            if conversion.is_some() {
                return Err(invalid("more than one conversion"));
            }

            let (mut zero_pad, mut left_align, mut plus_sign) = (false, false, false);
            while let Some(flag) = chars.peek().copied() {
                match flag {
                    '0' => zero_pad = true,
                    '-' => left_align = true,
                    '+' => plus_sign = true,
                    ' ' => {}
                    _ => break,
                }
                chars.next();
            }
            let mut digits = String::new();
            while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                digits.push(d);
                chars.next();
            }
            let width = if digits.is_empty() {
                0
            } else {
                digits.parse().map_err(|_| invalid("field width out of range"))?
            };
            match chars.next() {
                Some('d' | 'i' | 'u') => {}
                _ => return Err(invalid("only integer conversions are supported")),
            }
            conversion = Some((width, zero_pad, left_align, plus_sign));
        }

        let (width, zero_pad, left_align, plus_sign) =
            conversion.ok_or_else(|| invalid("no integer conversion"))?;
        Ok(Self {
            pattern: pattern.to_string(),
            prefix,
            suffix,
            width,
            zero_pad: zero_pad && !left_align,
            left_align,
            plus_sign,
        })
    }

    pub fn render(&self, number: i64) -> String {
        let digits = if self.plus_sign && number >= 0 {
            format!("+{number}")
        } else {
            number.to_string()
        };
        let field = if self.left_align {
            format!("{digits:<width$}", width = self.width)
        } else if self.zero_pad {
            let (sign, magnitude) = match digits.strip_prefix(['-', '+']) {
                Some(magnitude) => (&digits[..1], magnitude),
                None => ("", digits.as_str()),
            };
            let pad = self.width.saturating_sub(sign.len());
            format!("{sign}{magnitude:0>pad$}")
        } else {
            format!("{digits:>width$}", width = self.width)
        };
        format!("{}{}{}", self.prefix, field, self.suffix)
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

/// Files in the inclusive range `start..=end`; `None` if reversed or unrepresentable
fn pattern_file_count(start: i64, end: i64) -> Option<u64> {
    let span = end.checked_sub(start)?;
    u64::try_from(span).ok()?.checked_add(1)
}

/// What a step asks to watch for
#[derive(Debug, Clone, PartialEq)]
pub enum WatchMode {
    /// Ordered file names; a null or empty slot ends the watch with an error
    List(Vec<Option<String>>),
    Pattern {
        pattern: FilePattern,
        start: i64,
        end: i64,
    },
    Hdf5 {
        master: String,
    },
}

impl WatchMode {
    /// Exactly one of `list`, `pattern` or `hdf5` must be present
    ///
    /// File names are read without environment substitution.
    pub fn from_parameters(parameters: &ParameterChain) -> Result<Self, FilewatcherError> {
        let present: Vec<&str> = ["list", "pattern", "hdf5"]
            .into_iter()
            .filter(|key| parameters.contains(key))
            .collect();
        match present.as_slice() {
            [] => Err(FilewatcherError::NoWatchMode),
            ["list"] => Self::list(parameters),
            ["pattern"] => Self::pattern(parameters),
            ["hdf5"] => match parameters.get_raw("hdf5") {
                Some(Value::String(master)) if !master.is_empty() => Ok(Self::Hdf5 {
                    master: master.clone(),
                }),
                _ => Err(FilewatcherError::invalid_parameter(
                    "hdf5",
                    "must be a file name",
                )),
            },
            _ => Err(FilewatcherError::ConflictingModes {
                modes: present.join(", "),
            }),
        }
    }

    fn list(parameters: &ParameterChain) -> Result<Self, FilewatcherError> {
        let Some(Value::Array(entries)) = parameters.get_raw("list") else {
            return Err(FilewatcherError::invalid_parameter("list", "must be a list"));
        };
        let files = entries
            .iter()
            .map(|entry| match entry {
                Value::String(name) if !name.is_empty() => Ok(Some(name.clone())),
                Value::String(_) | Value::Null => Ok(None),
                _ => Err(FilewatcherError::invalid_parameter(
                    "list",
                    "entries must be file names or null",
                )),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::List(files))
    }

    fn pattern(parameters: &ParameterChain) -> Result<Self, FilewatcherError> {
        let Some(Value::String(pattern)) = parameters.get_raw("pattern") else {
            return Err(FilewatcherError::invalid_parameter(
                "pattern",
                "must be a string",
            ));
        };
        let pattern = FilePattern::parse(pattern)?;
        let start = parameters.get_i64("pattern-start").ok_or_else(|| {
            FilewatcherError::invalid_parameter("pattern-start", "integer required")
        })?;
        let end = parameters
            .get_i64("pattern-end")
            .ok_or_else(|| FilewatcherError::invalid_parameter("pattern-end", "integer required"))?;
        if end < start {
            return Err(FilewatcherError::invalid_parameter(
                "pattern-end",
                format!("{end} is before pattern-start {start}"),
            ));
        }
        if pattern_file_count(start, end).is_none() {
            return Err(FilewatcherError::invalid_parameter(
                "pattern-end",
                format!("range {start}..={end} is too large"),
            ));
        }
        Ok(Self::Pattern {
            pattern,
            start,
            end,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::List(_) => "list",
            Self::Pattern { .. } => "pattern",
            Self::Hdf5 { .. } => "hdf5",
        }
    }
}

/// Outcome of checking one file
#[derive(Debug, Clone, PartialEq)]
pub enum FileCheck {
    /// Present; the fields describe it in notifications
    Found(Map<String, Value>),
    /// Not there yet
    Absent,
    /// A null slot in a file list
    Gap,
}

/// A watch opened for one activation
#[derive(Debug)]
pub struct ActiveWatch<'a> {
    mode: &'a WatchMode,
    frames: Vec<FrameLocation>,
    handles: Option<FileHandles<'a>>,
}

impl<'a> ActiveWatch<'a> {
    /// Open the watch; HDF5 mode reads the master file layout here
    pub fn open(
        mode: &'a WatchMode,
        hdf5: Option<&'a dyn Hdf5Backend>,
    ) -> Result<Self, FilewatcherError> {
        let (frames, handles) = match mode {
            WatchMode::Hdf5 { master } => {
                let backend = hdf5.ok_or(FilewatcherError::Hdf5Unavailable)?;
                let frames = backend
                    .open_master(Path::new(master))
                    .map_err(|source| FilewatcherError::hdf5(master, source))?;
                (frames, Some(FileHandles::new(backend)))
            }
            _ => (Vec::new(), None),
        };
        Ok(Self {
            mode,
            frames,
            handles,
        })
    }

    /// Number of files the watch waits for
    ///
    /// A list holding nothing but null entries expects nothing.
    pub fn expected(&self) -> u64 {
        match self.mode {
            WatchMode::List(files) if files.iter().all(Option::is_none) => 0,
            WatchMode::List(files) => files.len() as u64,
            WatchMode::Pattern { start, end, .. } => pattern_file_count(*start, *end).unwrap_or(0),
            WatchMode::Hdf5 { .. } => self.frames.len() as u64,
        }
    }

    /// Notification fields for file `index` (1-based)
    pub fn describe(&self, index: u64) -> Map<String, Value> {
        let mut fields = Map::new();
        match self.mode {
            WatchMode::List(files) => {
                let file = files
                    .get(index.saturating_sub(1) as usize)
                    .cloned()
                    .flatten();
                fields.insert("file".into(), json!(file));
                fields.insert("file-list-index".into(), json!(index));
            }
            WatchMode::Pattern { pattern, start, .. } => {
                let offset = i64::try_from(index.saturating_sub(1)).unwrap_or(i64::MAX);
                let number = start.saturating_add(offset);
                fields.insert("file".into(), json!(pattern.render(number)));
                fields.insert("file-number".into(), json!(index));
                fields.insert("file-pattern-index".into(), json!(number));
            }
            WatchMode::Hdf5 { master } => {
                fields.insert("file".into(), json!(master));
                fields.insert("file-number".into(), json!(index));
                fields.insert("hdf5".into(), json!(master));
                fields.insert("hdf5-index".into(), json!(index.saturating_sub(1)));
                fields.insert(
                    "parameters".into(),
                    json!({ "scan_range": format!("{index},{index}") }),
                );
            }
        }
        fields
    }

    pub async fn check(&mut self, index: u64) -> Result<FileCheck, FilewatcherError> {
        let present = match self.mode {
            WatchMode::List(files) => match files.get(index.saturating_sub(1) as usize) {
                Some(Some(file)) => file_exists(Path::new(file)).await,
                _ => return Ok(FileCheck::Gap),
            },
            WatchMode::Pattern { .. } => {
                let fields = self.describe(index);
                let file = fields.get("file").and_then(Value::as_str).unwrap_or_default();
                file_exists(&PathBuf::from(file)).await
            }
            WatchMode::Hdf5 { master } => {
                let (Some(frame), Some(handles)) = (
                    self.frames.get(index.saturating_sub(1) as usize),
                    self.handles.as_mut(),
                ) else {
                    return Ok(FileCheck::Absent);
                };
                handles
                    .frame_written(frame)
                    .map_err(|source| FilewatcherError::hdf5(master, source))?
            }
        };
        Ok(if present {
            FileCheck::Found(self.describe(index))
        } else {
            FileCheck::Absent
        })
    }
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
