//! Static per-process configuration, read once from a properties file.

use crate::error::Error;
use log::warn;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Keys that must be present in every properties file.
pub const REQUIRED_KEYS: &[&str] = &["input", "workers_per_node"];

/// Keys that may be present; anything else is flagged by [`check`].
///
/// [`check`]: struct.Resources.html#method.check
pub const OPTIONAL_KEYS: &[&str] =
    &["chunk_size", "logsheet_url", "delimiter", "input_type", "listen"];

/// The number of elements per `WorkPackage` when `chunk_size` is absent.
pub const DEFAULT_CHUNK_SIZE: usize = 16;

/// The distributor bind address when `listen` is absent.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:9900";

/// How the configured input path should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// A delimited text file, one element per line
    Csv,
    /// A key/value record source
    Records,
}

/// Immutable configuration for one process of a distributed job.
///
/// Built exactly once at process start from a line-oriented
/// `key = value` properties file; read-only for the process lifetime
/// and safe to share across tasks.
#[derive(Debug, Clone)]
pub struct Resources {
    /// The path of the properties file this was built from
    properties_file_name: String,
    /// `hostname-rank-pid`, used to tag log entries and error messages
    unique_id: String,
    /// This process's rank: 0 is the distributor, >= 1 are receivers
    rank: usize,
    /// The total number of processes in the job, distributor included
    num_tasks: usize,
    /// The number of pool workers each receiver spawns
    workers_per_node: usize,
    /// The maximum number of elements placed into one `WorkPackage`
    chunk_size: usize,
    /// Destination URL for logsheet entries; empty = none configured
    logsheet_url: String,
    /// The path of the input source
    input_path: String,
    /// How `input_path` should be read
    input_kind: InputKind,
    /// CSV mode only: split each line into a key/value record on this byte
    delimiter: Option<u8>,
    /// The `IP:Port` the distributor binds and receivers connect to
    listen: String,
}

impl Resources {
    /// Reads the properties file at `path` and builds the configuration
    /// for a process with the given `rank` out of `num_tasks` processes.
    ///
    /// ## Errors
    /// `Error::Io` if the file cannot be read, `Error::Config` if a
    /// required key is absent or any value is malformed.
    pub fn new(
        path: &str,
        rank: usize,
        num_tasks: usize,
    ) -> Result<Self, Error> {
        let props = read_properties(path)?;
        for key in REQUIRED_KEYS {
            if !props.contains_key(*key) {
                return Err(Error::Config(format!(
                    "required property '{}' is missing from {}",
                    key, path
                )));
            }
        }
        let workers_per_node =
            parse_count(&props, "workers_per_node", path)?;
        let chunk_size = match props.get("chunk_size") {
            Some(_) => parse_count(&props, "chunk_size", path)?,
            None => DEFAULT_CHUNK_SIZE,
        };
        let input_kind = match props.get("input_type").map(|s| s.as_str()) {
            None | Some("csv") => InputKind::Csv,
            Some("records") => InputKind::Records,
            Some(other) => {
                return Err(Error::Config(format!(
                    "unknown input_type '{}' in {}",
                    other, path
                )))
            }
        };
        let delimiter = match props.get("delimiter") {
            None => None,
            Some(d) if d.len() == 1 => Some(d.as_bytes()[0]),
            Some(d) => {
                return Err(Error::Config(format!(
                    "delimiter must be a single character, got '{}'",
                    d
                )))
            }
        };

        let hostname = gethostname::gethostname();
        let unique_id = format!(
            "{}-{}-{}",
            hostname.to_string_lossy(),
            rank,
            std::process::id()
        );

        Ok(Resources {
            properties_file_name: path.to_string(),
            unique_id,
            rank,
            num_tasks,
            workers_per_node,
            chunk_size,
            logsheet_url: props
                .get("logsheet_url")
                .cloned()
                .unwrap_or_default(),
            input_path: props.get("input").unwrap().clone(),
            input_kind,
            delimiter,
            listen: props
                .get("listen")
                .cloned()
                .unwrap_or_else(|| DEFAULT_LISTEN.to_string()),
        })
    }

    /// Validates the properties file at `path` without building a
    /// `Resources`: all required keys must be present, and keys outside
    /// the required/optional sets are logged as warnings.
    pub fn check(path: &str) -> Result<(), Error> {
        let props = read_properties(path)?;
        for key in REQUIRED_KEYS {
            if !props.contains_key(*key) {
                return Err(Error::Config(format!(
                    "required property '{}' is missing from {}",
                    key, path
                )));
            }
        }
        for key in props.keys() {
            if !REQUIRED_KEYS.contains(&key.as_str())
                && !OPTIONAL_KEYS.contains(&key.as_str())
            {
                warn!("{}: unknown property '{}'", path, key);
            }
        }
        Ok(())
    }

    /// The path of the properties file this configuration was read from.
    pub fn properties_file_name(&self) -> &str {
        &self.properties_file_name
    }

    /// The `hostname-rank-pid` identity of this process, computed once.
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// This process's rank; rank 0 is the distributor.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// The total number of processes in the job.
    pub fn num_tasks(&self) -> usize {
        self.num_tasks
    }

    /// The number of pool workers each receiver spawns.
    pub fn workers_per_node(&self) -> usize {
        self.workers_per_node
    }

    /// The maximum number of elements placed into one `WorkPackage`.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// The logsheet destination URL; an empty string means none is
    /// configured.
    pub fn logsheet_url(&self) -> &str {
        &self.logsheet_url
    }

    /// The path of the input source.
    pub fn input_path(&self) -> &str {
        &self.input_path
    }

    /// How the input source should be read.
    pub fn input_kind(&self) -> InputKind {
        self.input_kind
    }

    /// CSV mode only: the byte that splits each line into a key/value
    /// record, if one was configured.
    pub fn delimiter(&self) -> Option<u8> {
        self.delimiter
    }

    /// The `IP:Port` the distributor binds and receivers connect to.
    pub fn listen_addr(&self) -> &str {
        &self.listen
    }
}

/// Parses a line-oriented `key = value` file. Blank lines and lines
/// starting with `#` are skipped; later occurrences of a key win.
fn read_properties(path: &str) -> Result<HashMap<String, String>, Error> {
    let file = File::open(Path::new(path))?;
    let reader = BufReader::new(file);
    let mut props = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match trimmed.split_once('=') {
            Some((key, value)) => {
                props.insert(
                    key.trim().to_string(),
                    value.trim().to_string(),
                );
            }
            None => {
                return Err(Error::Config(format!(
                    "{}: line '{}' is not in 'key = value' form",
                    path, trimmed
                )))
            }
        }
    }
    Ok(props)
}

fn parse_count(
    props: &HashMap<String, String>,
    key: &str,
    path: &str,
) -> Result<usize, Error> {
    let raw = props.get(key).unwrap();
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::Config(format!(
            "{}: property '{}' must be a positive integer, got '{}'",
            path, key, raw
        ))),
    }
}
