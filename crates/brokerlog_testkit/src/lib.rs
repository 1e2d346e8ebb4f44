//! # brokerlog testkit
//!
//! Test utilities for the broker transaction log.
//!
//! This crate provides:
//! - [`CrashableBackend`]: a log backend that simulates a power cut
//! - [`TestBroker`]: a broker directory that can be crashed and restarted
//! - proptest strategies for broker workloads
//! - [`OpDriver`]: runs workloads against a manager and a model store
//!
//! ## Usage
//!
//! ```rust,ignore
//! use brokerlog_testkit::prelude::*;
//!
//! let mut broker = TestBroker::new();
//! let manager = broker.open()?;
//! broker.log.crash_after(64);
//! let mut driver = OpDriver::new();
//! driver.run(&manager, &broker.messages, &ops);
//! let manager = broker.restart(manager)?;
//! driver.assert_recovered(&manager, &broker.messages);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod integration;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
}

pub use crash::CrashableBackend;
pub use fixtures::TestBroker;
pub use integration::OpDriver;
