//! Petek: epoch-based memory reclamation for concurrent data structures.
//!
//! Petek implements a three-generation epoch scheme. Readers enter a critical
//! section by pinning an [`EpochManager`]; writers detach objects from their
//! structure and [`retire`](EpochManager::retire) them. An object retired at
//! global epoch `N` is destroyed only once the global epoch has reached
//! `N + 2`, at which point every reader that could still observe it has left
//! its critical section.
//!
//! # Key Features
//!
//! - **Cheap read path**: pinning is a thread-local counter bump plus two
//!   atomic stores on the outermost guard.
//! - **Transparent registration**: a thread is registered with a manager the
//!   first time it pins, and deregistered when it exits.
//! - **Heterogeneous retirement**: retired objects carry a type-erased
//!   destructor, so tables, nodes, and arrays share the same retire lists.
//! - **Amortised reclamation**: epoch advancement is attempted on retire and
//!   every 64th outermost unpin, never on the pin path.
//!
//! # Example
//!
//! ```rust
//! use petek::EpochManager;
//!
//! let manager = EpochManager::new();
//!
//! // Enter a critical section. While the guard lives, nothing retired to
//! // this manager is destroyed.
//! let guard = manager.pin();
//!
//! // ... traverse shared state published by writers ...
//!
//! drop(guard);
//! ```

#![warn(missing_docs)]

mod epoch;
mod guard;
mod retired;
mod ttas;

pub use epoch::EpochManager;
pub use guard::EpochGuard;
pub use retired::RetiredNode;
pub use ttas::{TTas, TTasGuard};
