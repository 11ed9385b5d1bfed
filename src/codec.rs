//! Baseline compression codec.
//!
//! Three profiles trade compression ratio against CPU: `Fast` (baselines
//! read back on every comparison), `Balanced` (the default), `Portable`
//! (archival — gzip is decodable by essentially anything). `decode` never
//! needs to be told which profile was used: every payload carries a magic
//! byte that names it, so a policy change never orphans an existing
//! baseline written under a different profile.

use std::io::{Read, Write};

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
use flate2::Compression;

use crate::error::{ErrorKind, Result};

const MAGIC_FAST: u8 = 0xF1;
const MAGIC_BALANCED: u8 = 0xF2;
const MAGIC_PORTABLE: u8 = 0xF3;

/// Header size: 1 magic byte + 8-byte original size + 8-byte encode wall-clock (ns).
const HEADER_LEN: usize = 1 + 8 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Raw deflate, fastest, no container overhead.
    Fast,
    /// Zlib-wrapped deflate, default.
    Balanced,
    /// Gzip, widely decodable by anything with a `.gz` library.
    Portable,
}

impl Profile {
    fn magic(self) -> u8 {
        match self {
            Profile::Fast => MAGIC_FAST,
            Profile::Balanced => MAGIC_BALANCED,
            Profile::Portable => MAGIC_PORTABLE,
        }
    }

    fn from_magic(byte: u8) -> Result<Self> {
        match byte {
            MAGIC_FAST => Ok(Profile::Fast),
            MAGIC_BALANCED => Ok(Profile::Balanced),
            MAGIC_PORTABLE => Ok(Profile::Portable),
            other => Err(ErrorKind::UnknownCodec(other)),
        }
    }

    /// Filename extension used by the baseline store to let multiple
    /// compression profiles coexist on disk during a migration.
    pub fn extension(self) -> &'static str {
        match self {
            Profile::Fast => "lz4f",
            Profile::Balanced => "zbal",
            Profile::Portable => "gz",
        }
    }
}

/// Ratio-reporting summary returned alongside `encode`'s payload by callers
/// that want it (the payload itself is self-describing; this is optional).
#[derive(Debug, Clone, Copy)]
pub struct EncodeStats {
    pub profile: Profile,
    pub original_len: usize,
    pub encoded_len: usize,
    pub wall_clock_nanos: u64,
}

/// Encodes `data` under `profile`, prefixed with a small header carrying
/// the profile, original size, and encode wall-clock — enough to report
/// compression ratio without decoding.
pub fn encode(data: &[u8], profile: Profile, wall_clock_nanos: u64) -> Result<Vec<u8>> {
    let compressed = match profile {
        Profile::Fast => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::fast());
            encoder.write_all(data).map_err(io_err)?;
            encoder.finish().map_err(io_err)?
        }
        Profile::Balanced => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data).map_err(io_err)?;
            encoder.finish().map_err(io_err)?
        }
        Profile::Portable => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
            encoder.write_all(data).map_err(io_err)?;
            encoder.finish().map_err(io_err)?
        }
    };

    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.push(profile.magic());
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    out.extend_from_slice(&wall_clock_nanos.to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Decodes a payload produced by `encode` under any profile, auto-detected
/// from the magic byte.
pub fn decode(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() < HEADER_LEN {
        return Err(ErrorKind::CorruptPayload("payload shorter than header".to_string()));
    }
    let profile = Profile::from_magic(payload[0])?;
    let original_len = u64::from_le_bytes(payload[1..9].try_into().unwrap()) as usize;
    let body = &payload[HEADER_LEN..];

    let mut out = Vec::with_capacity(original_len);
    let result = match profile {
        Profile::Fast => DeflateDecoder::new(body).read_to_end(&mut out),
        Profile::Balanced => ZlibDecoder::new(body).read_to_end(&mut out),
        Profile::Portable => GzDecoder::new(body).read_to_end(&mut out),
    };
    result.map_err(|e| ErrorKind::CorruptPayload(e.to_string()))?;
    Ok(out)
}

/// Reads stats out of an already-encoded payload without decompressing it.
pub fn peek_stats(payload: &[u8]) -> Result<EncodeStats> {
    if payload.len() < HEADER_LEN {
        return Err(ErrorKind::CorruptPayload("payload shorter than header".to_string()));
    }
    let profile = Profile::from_magic(payload[0])?;
    let original_len = u64::from_le_bytes(payload[1..9].try_into().unwrap()) as usize;
    let wall_clock_nanos = u64::from_le_bytes(payload[9..17].try_into().unwrap());
    Ok(EncodeStats { profile, original_len, encoded_len: payload.len(), wall_clock_nanos })
}

fn io_err(e: std::io::Error) -> ErrorKind {
    ErrorKind::CorruptPayload(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_profile() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(50);
        for profile in [Profile::Fast, Profile::Balanced, Profile::Portable] {
            let encoded = encode(&data, profile, 0).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(decoded, data, "profile {profile:?} failed to round-trip");
        }
    }

    #[test]
    fn decode_auto_detects_profile_from_magic() {
        let data = b"hello world".to_vec();
        let encoded = encode(&data, Profile::Portable, 0).unwrap();
        assert_eq!(encoded[0], MAGIC_PORTABLE);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn unknown_profile_byte_errors() {
        let mut payload = vec![0xAB];
        payload.extend_from_slice(&0u64.to_le_bytes());
        payload.extend_from_slice(&0u64.to_le_bytes());
        match decode(&payload) {
            Err(ErrorKind::UnknownCodec(0xAB)) => {}
            other => panic!("expected UnknownCodec, got {other:?}"),
        }
    }

    #[test]
    fn corrupt_payload_errors() {
        let data = b"some data to compress".to_vec();
        let mut encoded = encode(&data, Profile::Balanced, 0).unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(decode(&encoded).is_err());
    }

    #[test]
    fn peek_stats_does_not_decompress() {
        let data = b"x".repeat(1000);
        let encoded = encode(&data, Profile::Fast, 1234).unwrap();
        let stats = peek_stats(&encoded).unwrap();
        assert_eq!(stats.profile, Profile::Fast);
        assert_eq!(stats.original_len, 1000);
        assert_eq!(stats.wall_clock_nanos, 1234);
    }
}
