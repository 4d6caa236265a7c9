//! Core domain types for the gum-boards dashboard transport.
//!
//! This crate provides the types shared by the transport and the bridge:
//! - `Endpoint`: address of an ExEn (execution environment), compared loosely
//! - `Action`: Une protocol action names (`List`, `Read`, `Changed`, ...)
//! - `ActuatorValue`, `ValueType`: typed values for `Change` requests

pub mod action;
pub mod endpoint;
pub mod error;
pub mod value;

pub use action::Action;
pub use endpoint::{loose_eq, Endpoint, IntoEndpoint};
pub use error::{GumError, Result};
pub use value::{coerce_value, infer_type, parse_float, ActuatorValue, ValueType};
