//! Stateright Model Checking for coalesce-stream
//!
//! Exhaustive state-space exploration of the buffer protocol, complementing
//! the randomized DST harness in `coalesce::dst`.
//!
//! ## Available Models
//!
//! - `admission`: hysteresis bound, pending accounting, drain barrier soundness
//!
//! ## Running Model Checks
//!
//! ```bash
//! # Larger configurations are marked #[ignore] for CI speed
//! cargo test stateright -- --ignored --nocapture
//! ```

pub mod admission;

pub use admission::{AdmissionModel, BarrierKind};
