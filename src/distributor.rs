//! The single process that owns the input source and issues
//! `WorkPackage`s on request.

use crate::error::Error;
use crate::input::{Chunk, InputSource};
use crate::network::{
    read_msg, send_msg, Connection, Message, MessageCodec, WorkMsg,
};
use crate::resources::Resources;
use crate::shutdown::{Shutdown, ShutdownToken};
use crate::work_package::WorkPackage;
use futures::stream::SelectAll;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io;
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, FramedWrite};

/// The distributor's lifecycle. It only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributorState {
    /// Constructed, not yet started
    Idle,
    /// Serving work requests from the input source
    Running,
    /// The input is exhausted or a shutdown/termination arrived; every
    /// further request is answered with `NoMoreWork`
    Draining,
    /// Every receiver acknowledged; the job is over
    Terminated,
}

/// Totals for one finished job, reported by [`Distributor::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSummary {
    /// How many packages were issued
    pub packages_issued: u64,
    /// The sum of `num_elements` across all issued packages
    pub elements_issued: u64,
}

/// The rank-0 process: pulls chunks from the input source, encodes them
/// into packages, and serves them to receivers on request, in request
/// arrival order.
pub struct Distributor<S: InputSource> {
    resources: Arc<Resources>,
    source: S,
    token: ShutdownToken,
    state: DistributorState,
    msg_id: usize,
}

impl<S: InputSource> Distributor<S> {
    /// Creates an idle distributor over an already-opened input source.
    /// Opening the source is the caller's job so that an unreadable
    /// input fails before any receiver is contacted.
    pub fn new(
        resources: Arc<Resources>,
        source: S,
        token: ShutdownToken,
    ) -> Self {
        Distributor {
            resources,
            source,
            token,
            state: DistributorState::Idle,
            msg_id: 0,
        }
    }

    pub fn state(&self) -> DistributorState {
        self.state
    }

    /// Pulls the next chunk from the input source and encodes it, or
    /// returns `None` once the input is exhausted.
    fn next_package(&mut self) -> Result<Option<WorkPackage>, Error> {
        match self.source.next_chunk(self.resources.chunk_size())? {
            Chunk::Elements(elements) => {
                Ok(Some(WorkPackage::encode(&elements)?))
            }
            Chunk::EndOfInput => Ok(None),
        }
    }

    /// Runs the job to completion: waits for every receiver to
    /// introduce itself, serves work requests until the input is
    /// exhausted (or the job is cut short), then drains and waits for
    /// all acknowledgments.
    ///
    /// Returns normally for clean end-of-input and for graceful drains;
    /// the caller distinguishes a `TermExit` abort via the token.
    pub async fn start(&mut self) -> Result<JobSummary, Error> {
        let listener =
            TcpListener::bind(self.resources.listen_addr()).await?;
        info!(
            "{}: distributor listening on {}",
            self.resources.unique_id(),
            self.resources.listen_addr()
        );
        self.state = DistributorState::Running;

        let expected = self.resources.num_tasks() - 1;
        let mut directory: HashMap<usize, Connection<WorkMsg>> =
            HashMap::new();
        let mut streams = SelectAll::new();
        let mut reg_shutdown_handled = self.token.is_raised();
        if self.token.state() == Shutdown::TermExit {
            self.state = DistributorState::Draining;
            return Ok(JobSummary { packages_issued: 0, elements_issued: 0 });
        }
        while directory.len() < expected {
            let accepted = tokio::select! {
                conn = listener.accept() => Some(conn?),
                _ = self.token.wait(), if !reg_shutdown_handled => {
                    reg_shutdown_handled = true;
                    None
                }
            };
            let (socket, addr) = match accepted {
                Some(pair) => pair,
                None => {
                    if self.token.state() == Shutdown::TermExit {
                        warn!("TermExit during registration, aborting");
                        self.state = DistributorState::Draining;
                        return Ok(JobSummary {
                            packages_issued: 0,
                            elements_issued: 0,
                        });
                    }
                    // graceful shutdown: keep registering so every
                    // receiver can be told there is no work
                    self.state = DistributorState::Draining;
                    continue;
                }
            };
            let (reader, writer) = io::split(socket);
            let mut stream = FramedRead::new(reader, MessageCodec::new());
            let sink = FramedWrite::new(writer, MessageCodec::new());
            let intro = read_msg(&mut stream).await?;
            let rank = match intro.msg {
                WorkMsg::Introduction { rank } => rank,
                _ => return Err(Error::UnexpectedMessage),
            };
            info!("receiver rank {} registered from {}", rank, addr);
            if directory
                .insert(rank, Connection { address: addr, sink })
                .is_some()
            {
                return Err(Error::UnknownId);
            }
            streams.push(stream);
        }

        let mut summary =
            JobSummary { packages_issued: 0, elements_issued: 0 };
        let mut acks = 0usize;
        let mut shutdown_handled = self.token.is_raised();
        if shutdown_handled {
            self.state = DistributorState::Draining;
        }

        use futures::StreamExt;
        while acks < expected {
            let next = tokio::select! {
                msg = streams.next() => msg,
                _ = self.token.wait(), if !shutdown_handled => {
                    shutdown_handled = true;
                    match self.token.state() {
                        Shutdown::TermExit => {
                            warn!("TermExit: aborting without waiting \
                                   for acknowledgments");
                            self.state = DistributorState::Draining;
                            return Ok(summary);
                        }
                        level => {
                            info!("{:?}: draining", level);
                            self.state = DistributorState::Draining;
                            continue;
                        }
                    }
                }
            };
            let message = match next {
                None => return Err(Error::StreamClosed),
                Some(msg) => msg?,
            };
            match message.msg {
                WorkMsg::RequestWork => {
                    let response =
                        if self.state == DistributorState::Draining {
                            WorkMsg::NoMoreWork
                        } else {
                            match self.next_package()? {
                                Some(pkg) => {
                                    summary.packages_issued += 1;
                                    summary.elements_issued +=
                                        pkg.num_elements();
                                    WorkMsg::Work(pkg)
                                }
                                None => {
                                    info!("input exhausted, draining");
                                    self.state =
                                        DistributorState::Draining;
                                    WorkMsg::NoMoreWork
                                }
                            }
                        };
                    self.respond(
                        message.sender_id,
                        response,
                        &mut directory,
                    )
                    .await?;
                }
                WorkMsg::TerminateJob { reason } => {
                    warn!(
                        "receiver {} requested job termination: {}",
                        message.sender_id, reason
                    );
                    self.state = DistributorState::Draining;
                }
                WorkMsg::Acknowledge => {
                    acks += 1;
                    info!(
                        "receiver {} acknowledged ({}/{})",
                        message.sender_id, acks, expected
                    );
                }
                _ => return Err(Error::UnexpectedMessage),
            }
        }

        self.state = DistributorState::Terminated;
        info!(
            "{}: job complete, {} packages / {} elements issued",
            self.resources.unique_id(),
            summary.packages_issued,
            summary.elements_issued
        );
        Ok(summary)
    }

    async fn respond(
        &mut self,
        target: usize,
        msg: WorkMsg,
        directory: &mut HashMap<usize, Connection<WorkMsg>>,
    ) -> Result<(), Error> {
        let envelope = Message::new(self.msg_id, 0, target, msg);
        send_msg(target, envelope, directory).await?;
        self.msg_id += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::LineSource;
    use crate::work_package::{Element, Scheme};
    use std::io::Cursor;
    use tempfile::NamedTempFile;

    fn test_resources(chunk_size: usize) -> Arc<Resources> {
        use std::io::Write;
        let mut f = NamedTempFile::new().unwrap();
        write!(
            f,
            "input = unused\nworkers_per_node = 1\nchunk_size = {}\n",
            chunk_size
        )
        .unwrap();
        Arc::new(
            Resources::new(f.path().to_str().unwrap(), 0, 2).unwrap(),
        )
    }

    #[test]
    fn packages_partition_the_input() {
        let source =
            LineSource::new(Cursor::new("a\nb\nc\nd\ne\n"), None);
        let mut distributor = Distributor::new(
            test_resources(2),
            source,
            ShutdownToken::new(),
        );
        let mut sizes = Vec::new();
        let mut lines_seen = Vec::new();
        while let Some(pkg) = distributor.next_package().unwrap() {
            sizes.push(pkg.num_elements());
            for element in pkg.decode(Scheme::Line).unwrap() {
                match element {
                    Element::Line { number, .. } => {
                        lines_seen.push(number)
                    }
                    other => panic!("unexpected element {:?}", other),
                }
            }
        }
        // 5 elements at chunk size 2 partition as [2, 2, 1]
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(sizes.iter().sum::<u64>(), 5);
        // every element exactly once, none in two packages
        assert_eq!(lines_seen, vec![1, 2, 3, 4, 5]);
        // exhausted source keeps answering end-of-input
        assert!(distributor.next_package().unwrap().is_none());
    }
}
