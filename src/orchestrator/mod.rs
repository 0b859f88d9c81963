pub mod runner;

pub use runner::{PassSummary, WorkerLoop};
