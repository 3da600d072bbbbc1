//! Identifiers the IM gateway expects on the wire.

/// Trailing marker the gateway expects on every message id.
const MID_SUFFIX: &str = " 0";

/// Message id: random `0..=999` prefix, millisecond timestamp, literal `" 0"`.
pub fn generate_mid(now_millis: i64) -> String {
    let prefix = rand::random::<u64>() % 1000;
    format!("{prefix}{now_millis}{MID_SUFFIX}")
}

/// Local dedup id attached to outbound text messages: `-{millis}1`.
pub fn generate_send_uuid(now_millis: i64) -> String {
    format!("-{now_millis}1")
}

/// Device id: UUID-shaped random string followed by `-<user id>`.
///
/// The gateway ties registration to this value, so it should be generated
/// once per account and reused across reconnects.
pub fn generate_device_id(user_id: &str) -> String {
    let raw = uuid::Uuid::new_v4().to_string().to_uppercase();
    format!("{raw}-{user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mid_has_prefix_timestamp_and_marker() {
        let mid = generate_mid(1_717_000_000_123);
        assert!(mid.ends_with(" 0"), "missing marker: {mid}");
        let digits = mid.trim_end_matches(" 0");
        assert!(digits.ends_with("1717000000123"));
        let prefix = &digits[..digits.len() - "1717000000123".len()];
        assert!(prefix.is_empty() || prefix.parse::<u32>().unwrap() < 1000);
        assert!(digits.len() <= 13 + 3);
    }

    #[test]
    fn send_uuid_is_negated_timestamp() {
        assert_eq!(generate_send_uuid(1_717_000_000_123), "-17170000001231");
    }

    #[test]
    fn device_id_ends_with_user_id() {
        let id = generate_device_id("2201");
        assert!(id.ends_with("-2201"));
        assert_eq!(id.len(), 36 + 5);
    }
}
