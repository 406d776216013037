//! A rank >= 1 process: requests packages from the distributor and fans
//! them out to its local worker pool.

use crate::error::Error;
use crate::network::{
    read_msg, FramedSink, FramedStream, Message, MessageCodec, WorkMsg,
};
use crate::pool::{
    MessageTag, Params, TaskCommand, TaskStatus, WorkerEvent,
    WorkerEventKind, WorkerPool,
};
use crate::processor::ProcessorFactory;
use crate::resources::Resources;
use crate::shutdown::{Shutdown, ShutdownToken};
use crate::work_package::Scheme;
use futures::SinkExt;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};

/// The receiver's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Requesting,
    Dispatching,
    Waiting,
    ShuttingDown,
    Terminated,
}

/// Totals for one receiver's run.
#[derive(Debug, Clone)]
pub struct ReceiverSummary {
    /// Packages this receiver dispatched to its pool
    pub packages_dispatched: u64,
    /// The reason a processor gave for terminating the job, if any
    pub terminated: Option<String>,
}

/// Requests `WorkPackage`s from the distributor and routes them to idle
/// pool workers, handling completions, per-record failures, worker
/// deaths, and the three shutdown levels.
pub struct Receiver<F: ProcessorFactory> {
    resources: Arc<Resources>,
    params: Params,
    factory: F,
    scheme: Scheme,
    token: ShutdownToken,
    state: ReceiverState,
    msg_id: usize,
}

/// How long to keep retrying the initial connection while the
/// distributor is still binding its listener.
const CONNECT_RETRY_WINDOW: Duration = Duration::from_secs(30);
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(200);

impl<F: ProcessorFactory> Receiver<F> {
    pub fn new(
        resources: Arc<Resources>,
        params: Params,
        factory: F,
        scheme: Scheme,
        token: ShutdownToken,
    ) -> Self {
        Receiver {
            resources,
            params,
            factory,
            scheme,
            token,
            state: ReceiverState::Idle,
            msg_id: 0,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Connects to the distributor, spawns the local pool, and works
    /// until there is no more work or the job is cut short.
    pub async fn start(&mut self) -> Result<ReceiverSummary, Error> {
        let (mut stream, mut sink) = self.connect().await?;

        let mut pool = WorkerPool::spawn(
            self.resources.workers_per_node(),
            self.params.clone(),
            &self.factory,
            self.scheme,
            self.token.clone(),
        )?;
        info!(
            "{}: pool of {} workers ready",
            self.resources.unique_id(),
            self.resources.workers_per_node()
        );
        if self.resources.workers_per_node() > num_cpus::get() {
            warn!(
                "{}: {} workers oversubscribe {} cpus",
                self.resources.unique_id(),
                self.resources.workers_per_node(),
                num_cpus::get()
            );
        }

        let mut summary = ReceiverSummary {
            packages_dispatched: 0,
            terminated: None,
        };
        let mut outstanding = 0usize;
        let mut no_more_work = false;

        loop {
            // shutdown flags are consulted at loop boundaries only
            if self.token.is_raised()
                || summary.terminated.is_some()
                || no_more_work
            {
                break;
            }
            // handle completions that have already arrived
            while let Some(event) =
                pool.next_event(Some(Duration::ZERO)).await?
            {
                handle_event(event, &mut outstanding, &mut summary);
            }
            if summary.terminated.is_some() {
                continue;
            }
            if pool.num_alive() == 0 {
                // a dying worker enqueues its last completion before it
                // drops off num_alive; pick that up before giving up
                while let Some(event) =
                    pool.next_event(Some(Duration::ZERO)).await?
                {
                    handle_event(event, &mut outstanding, &mut summary);
                }
                if summary.terminated.is_some() {
                    continue;
                }
                self.shut_down_pool(pool, outstanding, &mut summary)
                    .await?;
                self.report(&mut sink, &summary).await?;
                return Err(Error::WorkerGone(0));
            }

            // a worker only counts as idle once its completion for the
            // previous package has been handled, so judge by the
            // outstanding count rather than the per-worker flags
            let has_idle = pool.num_alive() > outstanding;
            if has_idle {
                self.state = ReceiverState::Requesting;
                self.send(&mut sink, WorkMsg::RequestWork).await?;
                let reply = read_msg(&mut stream).await?;
                match reply.msg {
                    WorkMsg::Work(package) => {
                        self.state = ReceiverState::Dispatching;
                        summary.packages_dispatched += 1;
                        let (_, events) = pool.dispatch(package).await?;
                        outstanding += 1;
                        for event in events {
                            handle_event(
                                event,
                                &mut outstanding,
                                &mut summary,
                            );
                        }
                    }
                    WorkMsg::NoMoreWork => no_more_work = true,
                    _ => return Err(Error::UnexpectedMessage),
                }
            } else {
                // pool saturated: block until some worker reports
                self.state = ReceiverState::Waiting;
                if let Some(event) = pool.next_event(None).await? {
                    handle_event(event, &mut outstanding, &mut summary);
                }
            }
        }

        self.shut_down_pool(pool, outstanding, &mut summary).await?;
        self.report(&mut sink, &summary).await?;
        self.state = ReceiverState::Terminated;
        Ok(summary)
    }

    /// Drains or kills the local pool according to the shutdown level.
    async fn shut_down_pool(
        &mut self,
        mut pool: WorkerPool,
        mut outstanding: usize,
        summary: &mut ReceiverSummary,
    ) -> Result<(), Error> {
        self.state = ReceiverState::ShuttingDown;
        match self.token.state() {
            Shutdown::TermExit => {
                pool.broadcast(TaskCommand::TermExit).await?;
                pool.abort();
            }
            Shutdown::QuickExit => {
                pool.broadcast(TaskCommand::QuickExit).await?;
                // workers stop after their in-progress record; give
                // their final completions a bounded window
                while outstanding > 0 && pool.num_alive() > 0 {
                    match pool
                        .next_event(Some(Duration::from_secs(5)))
                        .await?
                    {
                        Some(event) => {
                            handle_event(event, &mut outstanding, summary)
                        }
                        None => break,
                    }
                }
                pool.shutdown();
            }
            _ => {
                // graceful: let in-flight packages finish
                while outstanding > 0 && pool.num_alive() > 0 {
                    match pool.next_event(None).await? {
                        Some(event) => {
                            handle_event(event, &mut outstanding, summary)
                        }
                        None => break,
                    }
                }
                pool.broadcast(TaskCommand::Exit).await?;
                pool.shutdown();
            }
        }
        Ok(())
    }

    /// Propagates a termination request if one happened, then
    /// acknowledges the distributor.
    async fn report(
        &mut self,
        sink: &mut FramedSink<WorkMsg>,
        summary: &ReceiverSummary,
    ) -> Result<(), Error> {
        if let Some(reason) = &summary.terminated {
            self.send(
                sink,
                WorkMsg::TerminateJob { reason: reason.clone() },
            )
            .await?;
        }
        self.send(sink, WorkMsg::Acknowledge).await?;
        Ok(())
    }

    async fn send(
        &mut self,
        sink: &mut FramedSink<WorkMsg>,
        msg: WorkMsg,
    ) -> Result<(), Error> {
        let envelope =
            Message::new(self.msg_id, self.resources.rank(), 0, msg);
        sink.send(envelope).await?;
        self.msg_id += 1;
        Ok(())
    }

    /// Connects to the distributor, retrying briefly since receivers
    /// may come up before the distributor has bound its listener, then
    /// introduces this receiver's rank.
    async fn connect(
        &mut self,
    ) -> Result<(FramedStream<WorkMsg>, FramedSink<WorkMsg>), Error> {
        let addr = self.resources.listen_addr().to_string();
        let deadline = tokio::time::Instant::now() + CONNECT_RETRY_WINDOW;
        let socket = loop {
            match TcpStream::connect(&addr).await {
                Ok(socket) => break socket,
                Err(e) => {
                    if self.token.is_raised()
                        || tokio::time::Instant::now() >= deadline
                    {
                        return Err(Error::Io(e));
                    }
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        };
        let (reader, writer) = io::split(socket);
        let stream = FramedRead::new(reader, MessageCodec::new());
        let mut sink = FramedWrite::new(writer, MessageCodec::new());
        sink.send(Message::new(
            0,
            self.resources.rank(),
            0,
            WorkMsg::Introduction { rank: self.resources.rank() },
        ))
        .await?;
        self.msg_id = 1;
        info!(
            "{}: connected to distributor at {}",
            self.resources.unique_id(),
            addr
        );
        Ok((stream, sink))
    }
}

/// Applies one pool event to the receiver's bookkeeping. Only
/// data-tagged completions count against outstanding packages;
/// control-tagged completions are workers answering exit signals.
fn handle_event(
    event: WorkerEvent,
    outstanding: &mut usize,
    summary: &mut ReceiverSummary,
) {
    match event.kind {
        WorkerEventKind::Completion { status, error, terminate } => {
            if event.tag == MessageTag::Data && *outstanding > 0 {
                *outstanding -= 1;
            }
            if terminate {
                let reason = error
                    .clone()
                    .unwrap_or_else(|| "unspecified".to_string());
                warn!(
                    "worker {} requested job termination: {}",
                    event.worker_id, reason
                );
                summary.terminated = Some(reason);
            } else if status == TaskStatus::Failed {
                // a bad record does not abort the job
                warn!(
                    "worker {} reported a package failure: {}",
                    event.worker_id,
                    error.as_deref().unwrap_or("unknown")
                );
            }
        }
        WorkerEventKind::Exited => {
            warn!("worker {} exited; pool shrinks", event.worker_id);
        }
    }
}
