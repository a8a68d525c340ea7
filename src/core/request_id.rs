use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique request identifier, `<unix-millis hex>-<counter>`.
///
/// Only used for log correlation and the forwarded `x-request-id` header.
pub fn next_request_id() -> String {
    let sequence = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{sequence}", Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| next_request_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_request_id_format() {
        let id = next_request_id();
        let (millis, counter) = id.split_once('-').unwrap();
        assert!(u64::from_str_radix(millis, 16).is_ok());
        assert!(counter.parse::<u64>().is_ok());
    }
}
