//! The output boundary of the core: pluggable per-element application
//! logic, executed inside a pool worker.

use crate::error::Error;
use crate::pool::Params;
use crate::work_package::Element;

/// Per-element business logic run by a pool worker.
///
/// One instance is constructed per worker from the pool's parameter
/// snapshot and lives for the worker's lifetime. Error contract:
/// - `Err(Error::Record(_))`: this element failed; the worker logs it
///   and continues with the next element of the same package
/// - `Err(Error::TerminateJob(_))`: the entire distributed job must
///   stop; the worker reports it and the receiver propagates it to the
///   distributor
/// Any other error is treated as fatal for the worker.
pub trait WorkPackageProcessor: Send + 'static {
    /// Acts on one decoded element.
    fn process_element(&mut self, element: &Element) -> Result<(), Error>;

    /// Called once after the last element of each package; a hook for
    /// per-package flushing. The default does nothing.
    fn package_finished(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Builds one processor instance per worker from the spawn-time
/// parameter snapshot.
pub trait ProcessorFactory: Send + Sync + 'static {
    type Processor: WorkPackageProcessor;

    fn make(&self, params: &Params) -> Result<Self::Processor, Error>;
}

impl<P, F> ProcessorFactory for F
where
    P: WorkPackageProcessor,
    F: Fn(&Params) -> Result<P, Error> + Send + Sync + 'static,
{
    type Processor = P;

    fn make(&self, params: &Params) -> Result<P, Error> {
        self(params)
    }
}
