//! Process entry point: wires resources, signal handling, and role
//! selection together, then runs this process's side of the job.

use crate::distributor::Distributor;
use crate::error::Error;
use crate::input::{InputSource, LineSource};
use crate::pool::Params;
use crate::processor::ProcessorFactory;
use crate::receiver::Receiver;
use crate::resources::{InputKind, Resources};
use crate::shutdown::{install_signal_handlers, Shutdown, ShutdownToken};
use crate::work_package::Scheme;
use log::{error, info};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

/// Clean shutdown: end-of-input, or a graceful signal- or
/// application-driven drain that completed the protocol.
pub const EXIT_OK: i32 = 0;
/// The process could not initialize: bad configuration or an
/// unreadable input source.
pub const EXIT_STARTUP_FAILURE: i32 = 2;
/// A `TermExit` forced an abort without waiting for the drain.
pub const EXIT_ABORTED: i32 = 3;

/// The element scheme a job uses, derived from its input
/// configuration: key/value records whenever a record source or a
/// delimiter is configured, plain lines otherwise.
pub fn scheme_for(resources: &Resources) -> Scheme {
    match resources.input_kind() {
        InputKind::Records => Scheme::Record,
        InputKind::Csv if resources.delimiter().is_some() => {
            Scheme::Record
        }
        InputKind::Csv => Scheme::Line,
    }
}

/// Drives one process of a distributed job: rank 0 becomes the
/// distributor, every other rank a receiver.
pub struct Runtime<F: ProcessorFactory> {
    resources: Arc<Resources>,
    token: ShutdownToken,
    factory: F,
}

impl<F: ProcessorFactory> Runtime<F> {
    /// Builds the runtime from a properties file. Fails before any
    /// network activity on a bad configuration.
    pub fn new(
        properties: &str,
        rank: usize,
        num_tasks: usize,
        factory: F,
    ) -> Result<Self, Error> {
        if num_tasks < 2 {
            return Err(Error::Config(
                "a job needs at least one distributor and one receiver"
                    .to_string(),
            ));
        }
        if rank >= num_tasks {
            return Err(Error::Config(format!(
                "rank {} is out of range for {} tasks",
                rank, num_tasks
            )));
        }
        let resources = Arc::new(Resources::new(properties, rank, num_tasks)?);
        Ok(Runtime { resources, token: ShutdownToken::new(), factory })
    }

    /// The shutdown token shared with every component this runtime
    /// starts; tests raise it directly instead of sending signals.
    pub fn token(&self) -> ShutdownToken {
        self.token.clone()
    }

    pub fn resources(&self) -> Arc<Resources> {
        self.resources.clone()
    }

    /// Runs this process's role to completion and returns the process
    /// exit code.
    pub async fn run(self) -> Result<i32, Error> {
        install_signal_handlers(&self.token)?;
        info!(
            "{}: starting as {}",
            self.resources.unique_id(),
            if self.resources.rank() == 0 {
                "distributor"
            } else {
                "receiver"
            }
        );

        if self.resources.rank() == 0 {
            let source = open_input(&self.resources)?;
            let mut distributor = Distributor::new(
                self.resources.clone(),
                source,
                self.token.clone(),
            );
            distributor.start().await?;
        } else {
            let scheme = scheme_for(&self.resources);
            let mut receiver = Receiver::new(
                self.resources.clone(),
                params_for(&self.resources),
                self.factory,
                scheme,
                self.token.clone(),
            );
            let summary = receiver.start().await?;
            if let Some(reason) = summary.terminated {
                info!("job terminated by application logic: {}", reason);
            }
        }

        if self.token.state() == Shutdown::TermExit {
            error!("{}: job aborted", self.resources.unique_id());
            Ok(EXIT_ABORTED)
        } else {
            info!("{}: clean shutdown", self.resources.unique_id());
            Ok(EXIT_OK)
        }
    }
}

/// The parameter snapshot handed to every pool worker at spawn time.
fn params_for(resources: &Resources) -> Params {
    let mut params = Params::new();
    params.set_str("properties", resources.properties_file_name());
    params.set_str("unique_id", resources.unique_id());
    params.set_str("logsheet_url", resources.logsheet_url());
    params.set_int("rank", resources.rank() as i64);
    params.set_int("chunk_size", resources.chunk_size() as i64);
    params
}

/// Opens the configured input source. A record-store path is read as
/// tab-delimited key/value lines; the real store formats are external
/// collaborators.
fn open_input(
    resources: &Resources,
) -> Result<Box<dyn InputSource>, Error> {
    let file = File::open(resources.input_path())?;
    let reader = BufReader::new(file);
    match resources.input_kind() {
        InputKind::Csv => Ok(Box::new(LineSource::new(
            reader,
            resources.delimiter(),
        ))),
        InputKind::Records => {
            let delimiter = resources.delimiter().unwrap_or(b'\t');
            Ok(Box::new(LineSource::new(reader, Some(delimiter))))
        }
    }
}
