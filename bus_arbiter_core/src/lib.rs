//! Admission control for a shared, capacity-bounded, bidirectional bus.
//!
//! At most `capacity` tasks hold the bus at once, and all of them move data in
//! the same [`Direction`]. Elevated requests go before normal ones within a
//! direction; an idle bus alternates between directions so neither side waits
//! forever.

pub mod types;
pub mod error;
pub mod cfg;
pub mod state;
pub mod decide;
pub mod arbiter;

pub use types::{Direction, Priority, Ticket};
pub use error::ArbiterError;
pub use cfg::{ArbiterCfg, FairnessPolicy, DEFAULT_CAPACITY};
pub use state::{ArbiterSnapshot, ArbiterState, ArbiterStats, CellCounts, Request, Withdrawal};
pub use decide::{is_admissible, next_direction, ChoiceReason};
pub use arbiter::{Admission, BusArbiter, BusSlot};
