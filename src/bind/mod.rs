//! Bind spec parsing.
//!
//! # Data Flow
//! ```text
//! config / command line strings
//!     → spec.rs (parse, validate, de-duplicate)
//!     → BindSpec (canonical, printable)
//!     → to_requests(ctx) (wildcard expansion)
//!     → ListenerRequest → net::listener
//! ```

pub mod kind;
pub mod spec;

pub use kind::TransportKind;
pub use spec::{
    is_true, parse_bind_spec, parse_bind_specs, BindAddress, BindOptions, BindSpec, ListenerRequest, CID_ANY,
};
