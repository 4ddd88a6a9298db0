//! Record content hashing.
//!
//! A record's `hash` is the MD5 digest of its raw values, comma-joined —
//! used by the Uploader for cross-record duplicate suppression.

/// Hash the raw values of one record as they were read off disk.
pub fn hash_raw_columns(columns: &[String]) -> String {
    hash_bytes(columns.join(",").as_bytes())
}

/// Hash a raw fixed-width line directly.
pub fn hash_raw_line(line: &str) -> String {
    hash_bytes(line.as_bytes())
}

fn hash_bytes(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_columns_with_commas_before_hashing() {
        let columns = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(hash_raw_columns(&columns), hash_bytes(b"a,b,c"));
    }

    #[test]
    fn single_column_matches_plain_md5() {
        let columns = vec!["hello".to_string()];
        assert_eq!(hash_raw_columns(&columns), format!("{:x}", md5::compute(b"hello")));
    }

    #[test]
    fn raw_line_hash_is_order_sensitive() {
        assert_ne!(hash_raw_line("ab"), hash_raw_line("ba"));
    }
}
