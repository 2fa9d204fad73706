use std::fmt;

use serde::{Deserialize, Serialize};

/// Which way data moves across the bus.
///
/// All tasks holding a slot at the same time share one direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Sending data to the device.
    Outbound,
    /// Reading data/results back from the device.
    Inbound,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Outbound, Direction::Inbound];

    #[inline]
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Outbound => Direction::Inbound,
            Direction::Inbound => Direction::Outbound,
        }
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        match self {
            Direction::Outbound => 0,
            Direction::Inbound => 1,
        }
    }

    /// Decode the `0`/`1` wire form used by the C ABI.
    pub fn from_u8(v: u8) -> Option<Direction> {
        match v {
            0 => Some(Direction::Outbound),
            1 => Some(Direction::Inbound),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self.index() as u8
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
        })
    }
}

/// Priority class of a request. Elevated requests are served first within
/// their direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Elevated,
    Normal,
}

impl Priority {
    /// Service order: elevated before normal.
    pub const ALL: [Priority; 2] = [Priority::Elevated, Priority::Normal];

    #[inline]
    pub(crate) fn index(self) -> usize {
        match self {
            Priority::Elevated => 0,
            Priority::Normal => 1,
        }
    }

    /// Decode the `0` normal / `1` elevated wire form used by the C ABI.
    pub fn from_u8(v: u8) -> Option<Priority> {
        match v {
            0 => Some(Priority::Normal),
            1 => Some(Priority::Elevated),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Priority::Normal => 0,
            Priority::Elevated => 1,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Priority::Elevated => "elevated",
            Priority::Normal => "normal",
        })
    }
}

/// Arrival number of one `acquire` call. Tickets are handed out in strictly
/// increasing order, so comparing two tickets compares arrival times.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ticket(pub u64);

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
