//! # workmill
//!
//! The distributed work-distribution core of a batch-evaluation
//! framework. One distributor process partitions a large input into
//! bounded [`WorkPackage`]s and serves them over TCP to receiver
//! processes; each receiver fans packages out to a local pool of
//! isolated workers that drive a pluggable [`WorkPackageProcessor`]
//! element by element, all under a three-level cooperative shutdown
//! protocol (`Exit`, `QuickExit`, `TermExit`).
//!
//! What the elements mean is the application's business: implement
//! [`WorkPackageProcessor`], hand a factory for it to the [`Runtime`],
//! and launch one process per rank.
//!
//! [`WorkPackage`]: work_package/struct.WorkPackage.html
//! [`WorkPackageProcessor`]: processor/trait.WorkPackageProcessor.html
//! [`Runtime`]: runtime/struct.Runtime.html

pub mod distributor;
pub mod error;
pub mod input;
pub mod message_center;
pub mod network;
pub mod pool;
pub mod processor;
pub mod receiver;
pub mod resources;
pub mod runtime;
pub mod shutdown;
pub mod work_package;
