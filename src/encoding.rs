//! Key and value encoding for segment stores.
//!
//! Keys are laid out so that a plain byte-wise comparison orders them by feed
//! id first and timestamp second:
//!
//! ```text
//! +----------------+-------------------+------------------------------+
//! | feed len (u16) | feed id (utf-8)   | timestamp ^ sign bit (u64)   |
//! |   big endian   |                   |   big endian                 |
//! +----------------+-------------------+------------------------------+
//! ```
//!
//! All samples of one feed are therefore contiguous and sorted, which turns a
//! time range query into a single ordered range scan.

use crate::{Attributes, Result, TelebufError};

/// Longest feed id that fits in a key.
pub const MAX_FEED_ID_LEN: usize = u16::MAX as usize;

const TIMESTAMP_LEN: usize = 8;
const SIGN_BIT: u64 = 1 << 63;

/// Rejects feed ids that cannot be encoded into a key.
pub fn validate_feed_id(feed_id: &str) -> Result<()> {
    if feed_id.is_empty() {
        return Err(TelebufError::InvalidFeedId);
    }
    if feed_id.len() > MAX_FEED_ID_LEN {
        return Err(TelebufError::FeedIdTooLong {
            len: feed_id.len(),
            max: MAX_FEED_ID_LEN,
        });
    }
    Ok(())
}

/// Encodes a `(feed_id, timestamp_ns)` key.
pub fn encode_key(feed_id: &str, timestamp: i64) -> Result<Vec<u8>> {
    validate_feed_id(feed_id)?;
    let feed = feed_id.as_bytes();

    let mut key = Vec::with_capacity(2 + feed.len() + TIMESTAMP_LEN);
    key.extend_from_slice(&(feed.len() as u16).to_be_bytes());
    key.extend_from_slice(feed);
    key.extend_from_slice(&((timestamp as u64) ^ SIGN_BIT).to_be_bytes());
    Ok(key)
}

/// Decodes a key produced by [`encode_key`].
pub fn decode_key(key: &[u8]) -> Result<(String, i64)> {
    if key.len() < 2 + TIMESTAMP_LEN {
        return Err(TelebufError::DataCorruption(format!(
            "segment key too short: {} bytes",
            key.len()
        )));
    }

    let feed_len = u16::from_be_bytes([key[0], key[1]]) as usize;
    if key.len() != 2 + feed_len + TIMESTAMP_LEN {
        return Err(TelebufError::DataCorruption(format!(
            "segment key length {} does not match feed length {}",
            key.len(),
            feed_len
        )));
    }

    let feed = std::str::from_utf8(&key[2..2 + feed_len])
        .map_err(|e| TelebufError::DataCorruption(format!("feed id is not utf-8: {e}")))?;
    Ok((feed.to_string(), decode_timestamp(key)?))
}

/// Extracts the timestamp from the tail of an encoded key.
pub fn decode_timestamp(key: &[u8]) -> Result<i64> {
    let tail: [u8; TIMESTAMP_LEN] = key
        .len()
        .checked_sub(TIMESTAMP_LEN)
        .and_then(|start| key[start..].try_into().ok())
        .ok_or_else(|| {
            TelebufError::DataCorruption(format!("segment key too short: {} bytes", key.len()))
        })?;
    Ok((u64::from_be_bytes(tail) ^ SIGN_BIT) as i64)
}

/// Serializes an attribute map.
pub fn encode_attributes(attributes: &Attributes) -> Result<Vec<u8>> {
    Ok(bincode::serialize(attributes)?)
}

/// Deserializes an attribute map.
pub fn decode_attributes(bytes: &[u8]) -> Result<Attributes> {
    Ok(bincode::deserialize(bytes)?)
}
