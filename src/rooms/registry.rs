//! # Room Registry
//!
//! In-process map of room code → room. While the process is alive this is the single
//! source of truth; the durable store only shadows it.
//!
//! ## Code Generation:
//! 1. Up to `attempts` random draws from the 5-digit space
//! 2. Then a linear scan of the whole space, lowest code first
//! 3. A candidate is used only if it is free both here and in the durable store

use super::room::{Room, RoomSnapshot};
use super::store::DurableRooms;
use super::{is_valid_code, RoomError, CODE_MAX, CODE_MIN};
use rand::Rng;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    transcript_limit: usize,
}

impl RoomRegistry {
    pub fn new(transcript_limit: usize) -> Self {
        Self {
            rooms: HashMap::new(),
            transcript_limit,
        }
    }

    /// Register a fresh room under `code`.
    pub fn create_room(&mut self, code: &str) -> Result<&mut Room, RoomError> {
        if !is_valid_code(code) {
            return Err(RoomError::InvalidCode(code.to_string()));
        }
        if self.rooms.contains_key(code) {
            return Err(RoomError::AlreadyExists(code.to_string()));
        }

        debug!(room_code = %code, "Room created");
        let limit = self.transcript_limit;
        Ok(self
            .rooms
            .entry(code.to_string())
            .or_insert_with(|| Room::new(code, limit)))
    }

    /// Register a shadow room rebuilt from the durable store.
    ///
    /// If the room appeared locally while the snapshot was being fetched, the local
    /// room wins and the snapshot is discarded.
    pub fn hydrate(&mut self, code: &str, snapshot: RoomSnapshot) -> &mut Room {
        let limit = self.transcript_limit;
        self.rooms.entry(code.to_string()).or_insert_with(|| {
            debug!(room_code = %code, "Room hydrated from durable store");
            Room::from_snapshot(code, snapshot, limit)
        })
    }

    pub fn contains(&self, code: &str) -> bool {
        self.rooms.contains_key(code)
    }

    pub fn get(&self, code: &str) -> Option<&Room> {
        self.rooms.get(code)
    }

    pub fn get_mut(&mut self, code: &str) -> Option<&mut Room> {
        self.rooms.get_mut(code)
    }

    pub fn remove(&mut self, code: &str) -> Option<Room> {
        self.rooms.remove(code)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn rooms(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }
}

/// Draw a random code from the 5-digit space.
pub fn random_code() -> String {
    rand::thread_rng().gen_range(CODE_MIN..=CODE_MAX).to_string()
}

/// Find a code that is free in-process and in the durable store, then claim it.
///
/// `taken_locally` is consulted before the (slower) durable check; `claim` performs the
/// final check-and-register atomically and returns false if someone else got there
/// first, in which case the search moves on.
pub async fn generate_unique_code<L, C>(
    attempts: u32,
    durable: &DurableRooms,
    mut taken_locally: L,
    mut claim: C,
) -> Result<String, RoomError>
where
    L: FnMut(&str) -> bool,
    C: FnMut(&str) -> bool,
{
    for attempt in 1..=attempts {
        let candidate = random_code();
        if taken_locally(&candidate) || durable.exists(&candidate).await {
            debug!(attempt, room_code = %candidate, "Random room code collided");
            continue;
        }
        if claim(&candidate) {
            return Ok(candidate);
        }
    }

    warn!(attempts, "Random room code draws exhausted, scanning code space");
    for n in CODE_MIN..=CODE_MAX {
        let candidate = n.to_string();
        if taken_locally(&candidate) || durable.exists(&candidate).await {
            continue;
        }
        if claim(&candidate) {
            return Ok(candidate);
        }
    }

    Err(RoomError::CodeSpaceExhausted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::store::MemoryRoomStore;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_create_room_rejects_duplicates_and_bad_codes() {
        let mut registry = RoomRegistry::new(50);
        assert!(registry.create_room("12345").is_ok());
        assert_eq!(
            registry.create_room("12345").unwrap_err(),
            RoomError::AlreadyExists("12345".to_string())
        );
        assert!(matches!(registry.create_room("abc"), Err(RoomError::InvalidCode(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_hydrate_prefers_local_room() {
        let mut registry = RoomRegistry::new(50);
        registry.create_room("12345").unwrap().append_transcript("local");

        let mut other = Room::new("12345", 50);
        other.append_transcript("stored");
        registry.hydrate("12345", other.snapshot());

        let texts: Vec<_> = registry.get("12345").unwrap().transcript().into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["local"]);
    }

    #[test]
    fn test_random_code_is_five_digits() {
        for _ in 0..1000 {
            let code = random_code();
            assert!(is_valid_code(&code), "bad code {}", code);
            assert!(!code.starts_with('0'));
        }
    }

    #[tokio::test]
    async fn test_generated_codes_are_unique() {
        let durable = DurableRooms::disabled();
        let mut registry = RoomRegistry::new(50);
        let mut seen = HashSet::new();

        for _ in 0..500 {
            let taken: HashSet<String> = registry.rooms().map(|r| r.code().to_string()).collect();
            let code = generate_unique_code(5, &durable, |c| taken.contains(c), |_| true)
                .await
                .unwrap();
            registry.create_room(&code).unwrap();
            assert!(seen.insert(code));
        }
    }

    #[tokio::test]
    async fn test_linear_scan_after_random_attempts_fail() {
        let durable = DurableRooms::disabled();
        // Everything below 10003 is taken; random draws always "collide".
        let mut draws = 0;
        let code = generate_unique_code(
            5,
            &durable,
            |c| {
                draws += 1;
                draws <= 5 || c < "10003"
            },
            |_| true,
        )
        .await
        .unwrap();
        assert_eq!(code, "10003");
    }

    #[tokio::test]
    async fn test_durable_store_codes_are_skipped() {
        let store = Arc::new(MemoryRoomStore::new());
        let durable = DurableRooms::new(store.clone(), Duration::from_secs(60));
        durable.save_snapshot("10000", &Room::new("10000", 50).snapshot()).await;

        let code = generate_unique_code(0, &durable, |_| false, |_| true).await.unwrap();
        assert_eq!(code, "10001");
    }

    #[tokio::test]
    async fn test_exhausted_code_space() {
        let durable = DurableRooms::disabled();
        let result = generate_unique_code(2, &durable, |_| true, |_| true).await;
        assert_eq!(result, Err(RoomError::CodeSpaceExhausted));
    }

    #[tokio::test]
    async fn test_lost_claim_moves_on() {
        let durable = DurableRooms::disabled();
        let mut claims = 0;
        let code = generate_unique_code(0, &durable, |_| false, |_| {
            claims += 1;
            claims > 1
        })
        .await
        .unwrap();
        assert_eq!(code, "10001");
    }
}
