//! Payload compression.
//!
//! Every PUBLISH body and the CONNECT identity are zlib streams. Inbound
//! bodies that are not valid zlib are rejected rather than passed through.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

/// Upper bound on an inflated payload (4 MB).
pub const MAX_INFLATED_SIZE: u64 = 4 * 1024 * 1024;

/// Deflate `data` into a zlib stream.
pub fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::best());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Inflate a zlib stream.
pub fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 4);
    let read = ZlibDecoder::new(data)
        .take(MAX_INFLATED_SIZE + 1)
        .read_to_end(&mut out)?;
    if read as u64 > MAX_INFLATED_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("inflated payload exceeds {MAX_INFLATED_SIZE} bytes"),
        ));
    }
    Ok(out)
}

/// Serialize `value` as JSON and deflate it.
pub fn encode_json<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, crate::Error> {
    let json = serde_json::to_vec(value)?;
    Ok(compress(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_json_inflates_back() {
        let body = br#"{"thread_id":"340282366841710300949128","action":"send_item"}"#;
        let packed = compress(body).unwrap();
        assert_ne!(packed.as_slice(), body.as_slice());
        assert_eq!(decompress(&packed).unwrap(), body.to_vec());
    }

    #[test]
    fn zlib_header_present() {
        let packed = compress(b"x").unwrap();
        assert_eq!(packed.first(), Some(&0x78));
    }

    #[test]
    fn garbage_fails_to_inflate() {
        assert!(decompress(b"\"dc2\"").is_err());
        assert!(decompress(&[0x78, 0xda, 0xff, 0x00]).is_err());
    }

    #[test]
    fn encode_json_is_compressed_json() {
        let packed = encode_json(&serde_json::json!({"sub": ["a"]})).unwrap();
        let raw = decompress(&packed).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value, serde_json::json!({"sub": ["a"]}));
    }
}
