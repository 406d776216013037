use clap::Parser;
use log::{error, Level};
use workmill::error::Error;
use workmill::pool::Params;
use workmill::processor::WorkPackageProcessor;
use workmill::runtime::{Runtime, EXIT_STARTUP_FAILURE};
use workmill::work_package::Element;

/// Runs one process of a distributed job with a built-in
/// line/record-counting processor; real deployments swap in their own
/// `WorkPackageProcessor` and launch one process per rank.
#[derive(Parser)]
#[command(version, about = "workmill distributed batch runner")]
struct Opts {
    /// The properties file describing the job
    #[arg(short = 'p', long = "properties", default_value = "workmill.props")]
    properties: String,
    /// This process's rank: 0 is the distributor, 1..num_tasks are
    /// receivers
    #[arg(short = 'r', long = "rank")]
    rank: usize,
    /// The total number of processes in the job
    #[arg(short = 'n', long = "num_tasks")]
    num_tasks: usize,
    /// Validate the properties file and exit
    #[arg(long = "check", default_value_t = false)]
    check: bool,
}

/// The demonstration payload: counts elements and logs a sample.
struct Counter {
    unique_id: String,
    seen: u64,
}

impl WorkPackageProcessor for Counter {
    fn process_element(&mut self, element: &Element) -> Result<(), Error> {
        self.seen += 1;
        if self.seen % 10_000 == 0 {
            match element {
                Element::Line { number, .. } => log::info!(
                    "{}: {} elements so far (at line {})",
                    self.unique_id,
                    self.seen,
                    number
                ),
                Element::Record { key, .. } => log::info!(
                    "{}: {} elements so far (at key {})",
                    self.unique_id,
                    self.seen,
                    String::from_utf8_lossy(key)
                ),
            }
        }
        Ok(())
    }

    fn package_finished(&mut self) -> Result<(), Error> {
        log::debug!("{}: package done, {} total", self.unique_id, self.seen);
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let opts = Opts::parse();
    simple_logger::init_with_level(Level::Info).unwrap();

    if opts.check {
        match workmill::resources::Resources::check(&opts.properties) {
            Ok(()) => {
                println!("{}: ok", opts.properties);
                return;
            }
            Err(e) => {
                error!("{}", e);
                std::process::exit(EXIT_STARTUP_FAILURE);
            }
        }
    }

    let factory = |params: &Params| -> Result<Counter, Error> {
        Ok(Counter {
            unique_id: params
                .get_str("unique_id")
                .unwrap_or("worker")
                .to_string(),
            seen: 0,
        })
    };

    let runtime =
        match Runtime::new(&opts.properties, opts.rank, opts.num_tasks, factory)
        {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("startup failed: {}", e);
                std::process::exit(EXIT_STARTUP_FAILURE);
            }
        };

    match runtime.run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("job failed: {}", e);
            std::process::exit(EXIT_STARTUP_FAILURE);
        }
    }
}
