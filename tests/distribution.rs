//! End-to-end jobs over localhost TCP: one distributor task, N
//! receiver tasks, real pools and real processors.

use std::fs::File;
use std::io::{BufReader, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use workmill::distributor::Distributor;
use workmill::error::Error;
use workmill::input::LineSource;
use workmill::pool::Params;
use workmill::processor::WorkPackageProcessor;
use workmill::receiver::Receiver;
use workmill::resources::Resources;
use workmill::shutdown::{Shutdown, ShutdownToken};
use workmill::work_package::{Element, Scheme};

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Writes an input file with `lines` numbered lines and a matching
/// properties file, returning both guards plus the properties path.
fn job_files(
    lines: usize,
    chunk_size: usize,
    workers: usize,
    port: u16,
) -> (NamedTempFile, NamedTempFile, String) {
    let mut input = NamedTempFile::new().unwrap();
    for i in 1..=lines {
        writeln!(input, "line-{}", i).unwrap();
    }
    let mut props = NamedTempFile::new().unwrap();
    write!(
        props,
        "input = {}\nworkers_per_node = {}\nchunk_size = {}\n\
         listen = 127.0.0.1:{}\n",
        input.path().display(),
        workers,
        chunk_size,
        port
    )
    .unwrap();
    let path = props.path().to_str().unwrap().to_string();
    (input, props, path)
}

struct Counting {
    seen: Arc<AtomicU64>,
}

impl WorkPackageProcessor for Counting {
    fn process_element(&mut self, _: &Element) -> Result<(), Error> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn spawn_distributor(
    props: String,
    num_tasks: usize,
    token: ShutdownToken,
) -> tokio::task::JoinHandle<workmill::distributor::JobSummary> {
    tokio::spawn(async move {
        let resources =
            Arc::new(Resources::new(&props, 0, num_tasks).unwrap());
        let file = File::open(resources.input_path()).unwrap();
        let source = LineSource::new(BufReader::new(file), None);
        let mut distributor =
            Distributor::new(resources, source, token);
        distributor.start().await.unwrap()
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn five_lines_chunk_two_partition_across_two_receivers() {
    let port = free_port();
    let (_input, _props, props_path) = job_files(5, 2, 2, port);
    let token = ShutdownToken::new();
    let seen = Arc::new(AtomicU64::new(0));

    let distributor = spawn_distributor(props_path.clone(), 3, token.clone());
    let mut receivers = Vec::new();
    for rank in 1..=2 {
        let props_path = props_path.clone();
        let token = token.clone();
        let seen = seen.clone();
        receivers.push(tokio::spawn(async move {
            let resources =
                Arc::new(Resources::new(&props_path, rank, 3).unwrap());
            let factory = move |_: &Params| -> Result<Counting, Error> {
                Ok(Counting { seen: seen.clone() })
            };
            let mut receiver = Receiver::new(
                resources,
                Params::new(),
                factory,
                Scheme::Line,
                token,
            );
            receiver.start().await.unwrap()
        }));
    }

    let summary = tokio::time::timeout(Duration::from_secs(30), distributor)
        .await
        .expect("distributor should finish")
        .unwrap();
    // 5 elements at chunk size 2 make packages of [2, 2, 1]
    assert_eq!(summary.packages_issued, 3);
    assert_eq!(summary.elements_issued, 5);

    let mut dispatched = 0;
    for receiver in receivers {
        let summary = tokio::time::timeout(Duration::from_secs(30), receiver)
            .await
            .expect("receiver should finish")
            .unwrap();
        assert!(summary.terminated.is_none());
        dispatched += summary.packages_dispatched;
    }
    assert_eq!(dispatched, 3);
    // every element was processed exactly once
    assert_eq!(seen.load(Ordering::SeqCst), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn record_errors_do_not_abort_the_job() {
    struct OddHater {
        seen: Arc<AtomicU64>,
    }
    impl WorkPackageProcessor for OddHater {
        fn process_element(&mut self, element: &Element) -> Result<(), Error> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            match element {
                Element::Line { number, .. } if number % 2 == 1 => {
                    Err(Error::Record(format!("line {} is odd", number)))
                }
                _ => Ok(()),
            }
        }
    }

    let port = free_port();
    let (_input, _props, props_path) = job_files(6, 2, 1, port);
    let token = ShutdownToken::new();
    let seen = Arc::new(AtomicU64::new(0));

    let distributor = spawn_distributor(props_path.clone(), 2, token.clone());
    let receiver = {
        let seen = seen.clone();
        tokio::spawn(async move {
            let resources =
                Arc::new(Resources::new(&props_path, 1, 2).unwrap());
            let factory = move |_: &Params| -> Result<OddHater, Error> {
                Ok(OddHater { seen: seen.clone() })
            };
            let mut receiver = Receiver::new(
                resources,
                Params::new(),
                factory,
                Scheme::Line,
                token,
            );
            receiver.start().await.unwrap()
        })
    };

    let summary = tokio::time::timeout(Duration::from_secs(30), distributor)
        .await
        .expect("distributor should finish")
        .unwrap();
    let receiver_summary =
        tokio::time::timeout(Duration::from_secs(30), receiver)
            .await
            .expect("receiver should finish")
            .unwrap();
    assert_eq!(summary.elements_issued, 6);
    // the three odd-line failures were logged and swallowed
    assert_eq!(seen.load(Ordering::SeqCst), 6);
    assert!(receiver_summary.terminated.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn terminate_job_stops_requesting_and_drains_the_distributor() {
    struct Quitter;
    impl WorkPackageProcessor for Quitter {
        fn process_element(&mut self, element: &Element) -> Result<(), Error> {
            match element {
                Element::Line { number: 1, .. } => Err(Error::TerminateJob(
                    "first line is poison".to_string(),
                )),
                _ => Ok(()),
            }
        }
    }

    let port = free_port();
    // plenty of remaining input that must never be requested
    let (_input, _props, props_path) = job_files(100, 5, 1, port);
    let token = ShutdownToken::new();

    let distributor = spawn_distributor(props_path.clone(), 2, token.clone());
    let receiver = tokio::spawn(async move {
        let resources =
            Arc::new(Resources::new(&props_path, 1, 2).unwrap());
        let factory = |_: &Params| -> Result<Quitter, Error> { Ok(Quitter) };
        let mut receiver = Receiver::new(
            resources,
            Params::new(),
            factory,
            Scheme::Line,
            token,
        );
        receiver.start().await.unwrap()
    });

    let receiver_summary =
        tokio::time::timeout(Duration::from_secs(30), receiver)
            .await
            .expect("receiver should finish")
            .unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(30), distributor)
        .await
        .expect("distributor should drain, not hang")
        .unwrap();

    assert_eq!(
        receiver_summary.terminated.as_deref(),
        Some("first line is poison")
    );
    // the lone receiver stopped after its first package, so only one
    // was ever issued
    assert_eq!(receiver_summary.packages_dispatched, 1);
    assert_eq!(summary.packages_issued, 1);
    assert_eq!(summary.elements_issued, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn graceful_exit_drains_in_flight_work() {
    let port = free_port();
    let (_input, _props, props_path) = job_files(1000, 10, 2, port);
    let token = ShutdownToken::new();
    let seen = Arc::new(AtomicU64::new(0));

    let distributor = spawn_distributor(props_path.clone(), 2, token.clone());
    let receiver = {
        let token = token.clone();
        let seen = seen.clone();
        tokio::spawn(async move {
            let resources =
                Arc::new(Resources::new(&props_path, 1, 2).unwrap());
            let factory = move |_: &Params| -> Result<Counting, Error> {
                Ok(Counting { seen: seen.clone() })
            };
            let mut receiver = Receiver::new(
                resources,
                Params::new(),
                factory,
                Scheme::Line,
                token,
            );
            receiver.start().await.unwrap()
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.raise(Shutdown::Exit);

    let summary = tokio::time::timeout(Duration::from_secs(30), distributor)
        .await
        .expect("distributor should drain after Exit")
        .unwrap();
    let receiver_summary =
        tokio::time::timeout(Duration::from_secs(30), receiver)
            .await
            .expect("receiver should drain after Exit")
            .unwrap();

    assert!(receiver_summary.terminated.is_none());
    // whatever was issued before the flag was raised got processed
    assert!(summary.elements_issued <= 1000);
    assert_eq!(seen.load(Ordering::SeqCst), summary.elements_issued);
}
