//! Small helpers shared across the crate
//!
//! - message id generation (short alphanumeric or UUID)
//! - human-readable byte sizes

use rand::Rng;

const ID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 8;

/// Generate a random 8 character alphanumeric message id
pub fn make_id() -> String {
    let mut rng = rand::thread_rng();

    (0..ID_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..ID_CHARSET.len());
            ID_CHARSET[idx] as char
        })
        .collect()
}

pub fn make_uuid_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a message id in the configured style
pub fn new_message_id(use_uuid: bool) -> String {
    if use_uuid {
        make_uuid_id()
    } else {
        make_id()
    }
}

pub fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_make_id_shape() {
        let id = make_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_make_id_unique() {
        let ids: HashSet<String> = (0..200).map(|_| make_id()).collect();
        assert_eq!(ids.len(), 200);
    }

    #[test]
    fn test_uuid_id() {
        let id = new_message_id(true);
        assert_eq!(id.len(), 36);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() || c == '-'));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert!(format_size(2048).contains("KiB"));
        assert!(format_size(3 * 1024 * 1024).contains("MiB"));
    }
}
