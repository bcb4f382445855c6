//! `QueueEntry` and composite priority computation (§4.3).

use std::time::{Duration, SystemTime};

use crate::model::ItemId;

/// Points added or subtracted from `userPriority*10` based on expected size.
fn size_boost(expected_bytes: Option<u64>) -> i64 {
    const MIB: u64 = 1024 * 1024;
    match expected_bytes {
        Some(b) if b < 10 * MIB => 2,
        Some(b) if b <= 100 * MIB => 0,
        Some(_) => -1,
        None => 0,
    }
}

/// One point per hour of age, capped at 24.
fn age_boost(age: Duration) -> i64 {
    (age.as_secs() / 3600).min(24) as i64
}

/// `composite = userPriority*10 + sizeBoost(expectedBytes) + ageBoost(age)`.
#[must_use]
pub fn composite_priority(user_priority: u8, expected_bytes: Option<u64>, created_at: SystemTime) -> i64 {
    let age = SystemTime::now().duration_since(created_at).unwrap_or_default();
    i64::from(user_priority) * 10 + size_boost(expected_bytes) + age_boost(age)
}

/// A queued reference to a [`crate::model::DownloadItem`] plus its heap key.
///
/// Lives only inside [`crate::queue::PriorityQueue`]; the full item is owned
/// by the scheduler's item index.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub item_id: ItemId,
    pub composite_priority: i64,
    pub enqueued_at: SystemTime,
    pub estimated_seconds: Option<u64>,
}

impl QueueEntry {
    #[must_use]
    pub fn new(item_id: ItemId, composite_priority: i64, estimated_seconds: Option<u64>) -> Self {
        Self {
            item_id,
            composite_priority,
            enqueued_at: SystemTime::now(),
            estimated_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_file_gets_positive_size_boost() {
        assert_eq!(size_boost(Some(1024 * 1024)), 2);
    }

    #[test]
    fn mid_size_file_gets_no_boost() {
        assert_eq!(size_boost(Some(50 * 1024 * 1024)), 0);
    }

    #[test]
    fn large_file_gets_penalty() {
        assert_eq!(size_boost(Some(200 * 1024 * 1024)), -1);
    }

    #[test]
    fn unknown_size_gets_no_boost() {
        assert_eq!(size_boost(None), 0);
    }

    #[test]
    fn age_boost_caps_at_twenty_four() {
        assert_eq!(age_boost(Duration::from_secs(3600 * 100)), 24);
        assert_eq!(age_boost(Duration::from_secs(3600 * 3)), 3);
        assert_eq!(age_boost(Duration::from_secs(0)), 0);
    }

    #[test]
    fn composite_combines_all_three_terms() {
        let created = SystemTime::now();
        let p = composite_priority(5, Some(1024), created);
        assert_eq!(p, 5 * 10 + 2 + 0);
    }
}
