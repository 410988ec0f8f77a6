use xxhash_rust::xxh3::xxh3_64;

/// Fan-out width of the bucketed secondary indexes.
pub const NUM_INDEX_BUCKETS: u8 = 10;

/// Stable 64-bit digest of concatenated fields. Both the write and the read
/// side derive index keys through this, so the function must never change
/// between releases.
pub fn hash_data(parts: &[&str]) -> u64 {
    let mut buf = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for part in parts {
        buf.extend_from_slice(part.as_bytes());
    }
    xxh3_64(&buf)
}

/// Bucketed variant: the bucket byte is appended to the payload, keeping the
/// bucket-space distinct from the data-space.
pub fn hash_bucket_data(bucket: u8, parts: &[&str]) -> u64 {
    let mut buf = Vec::with_capacity(parts.iter().map(|p| p.len()).sum::<usize>() + 1);
    for part in parts {
        buf.extend_from_slice(part.as_bytes());
    }
    buf.push(bucket);
    xxh3_64(&buf)
}

pub fn hash_raw(buf: &[u8]) -> u64 {
    xxh3_64(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(hash_data(&["svc", "op"]), hash_data(&["svc", "op"]));
        assert_eq!(
            hash_bucket_data(3, &["svc"]),
            hash_bucket_data(3, &["svc"])
        );
    }

    #[test]
    fn buckets_diverge() {
        let mut seen = std::collections::HashSet::new();
        for bucket in 0..NUM_INDEX_BUCKETS {
            assert!(seen.insert(hash_bucket_data(bucket, &["svc", "op"])));
        }
    }

    #[test]
    fn bucket_is_appended_not_mixed_in() {
        // hash("ab" + [0x01]) must equal the bucketed hash of ["a", "b"].
        assert_eq!(hash_bucket_data(1, &["a", "b"]), hash_raw(b"ab\x01"));
    }
}
