//! Client lifecycle manager and application multiplexer built on top of the
//! `linkframe` wire protocol.
//!
//! See `DESIGN.md` at the repository root for how each module here is
//! grounded and for the resolution of this protocol's open design
//! questions.

pub mod app;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod framer;
pub mod registry;

pub use app::{dispatch, mqtt_bridge, AppFactory, AppFactoryRegistry, AppInstance};
pub use client::{ClientObject, LifecycleState};
pub use config::NetworkConfig;
pub use error::{Error, Result};
pub use registry::Registry;
