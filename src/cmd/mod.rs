//! CLI command implementations.
//!
//! | Module   | Behaviour                                      |
//! |----------|------------------------------------------------|
//! | `worker` | build the worker, then one pass or watch mode  |

pub mod worker;

pub use worker::cmd_worker;
