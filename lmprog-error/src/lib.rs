//! # lmprog-error
//!
//! The one error type shared by every lmprog crate.
//!
//! An [`Error`] carries an [`ErrorKind`] (what went wrong), an
//! [`ErrorStatus`] (whether repeating the call can help), the operation that
//! raised it, a list of key/value context pairs and an optional source.
//!
//! ```rust
//! use lmprog_error::{Error, ErrorKind};
//!
//! fn bind() -> lmprog_error::Result<()> {
//!     Err(Error::synthesis_binding("get_total")
//!         .with_operation("synth::materialize")
//!         .with_context("unit", "tabletop_ui"))
//! }
//!
//! assert_eq!(bind().unwrap_err().kind(), ErrorKind::SynthesisBinding);
//! ```
//!
//! Foreign errors are attached with [`Error::set_source`] at the point they
//! are first handled; callers further up only add context.

mod error;
mod kind;
mod status;

pub use error::Error;
pub use kind::ErrorKind;
pub use status::ErrorStatus;

pub type Result<T> = std::result::Result<T, Error>;
