//! # Rooms
//!
//! Authoritative in-process bookkeeping of classroom rooms, plus the best-effort
//! durable shadow copy kept in an external key-value store.
//!
//! ## Key Components:
//! - **Room**: host slot, ordered students, capped transcript
//! - **RoomRegistry**: code → room map and unique code generation
//! - **DurableRooms**: availability-gated wrapper over a `RoomStore`
//! - **RejectedCodes**: bounded cache of codes recently found not to exist

pub mod registry;
pub mod rejected;
pub mod room;
pub mod store;

pub use registry::RoomRegistry;
pub use rejected::RejectedCodes;
pub use room::{Room, RoomSnapshot, TranscriptEntry};
pub use store::{DurableRooms, MemoryRoomStore, RedisRoomStore, RoomStore, StoreError};

use std::fmt;

/// Lowest and highest 5-digit room codes.
pub const CODE_MIN: u32 = 10_000;
pub const CODE_MAX: u32 = 99_999;

/// Returns true when `code` is exactly five ASCII digits.
pub fn is_valid_code(code: &str) -> bool {
    code.len() == 5 && code.bytes().all(|b| b.is_ascii_digit())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    InvalidCode(String),
    AlreadyExists(String),
    CodeSpaceExhausted,
}

impl fmt::Display for RoomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomError::InvalidCode(code) => {
                write!(f, "Invalid room code '{}': must be exactly 5 digits", code)
            }
            RoomError::AlreadyExists(code) => write!(f, "Room {} already exists", code),
            RoomError::CodeSpaceExhausted => write!(f, "No unused room codes remain"),
        }
    }
}

impl std::error::Error for RoomError {}
