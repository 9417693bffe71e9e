//! Host-backed streaming effect contexts: incremental digests and
//! compression. The VM only ever holds numeric handles to these; the
//! contexts themselves live in request state and die with it.

use std::io::Write;

use flate2::write::{DeflateDecoder, DeflateEncoder, GzDecoder, GzEncoder, ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

pub enum DigestContext {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl DigestContext {
    /// Accepts the WebCrypto algorithm names, case-insensitively.
    pub fn new(algorithm: &str) -> Option<Self> {
        match algorithm.to_ascii_uppercase().as_str() {
            "SHA-1" | "SHA1" => Some(Self::Sha1(Sha1::new())),
            "SHA-256" | "SHA256" => Some(Self::Sha256(Sha256::new())),
            "SHA-384" | "SHA384" => Some(Self::Sha384(Sha384::new())),
            "SHA-512" | "SHA512" => Some(Self::Sha512(Sha512::new())),
            _ => None,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
            Self::Sha384(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    pub fn finish(self) -> Vec<u8> {
        match self {
            Self::Sha1(h) => h.finalize().to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Sha384(h) => h.finalize().to_vec(),
            Self::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// One-shot digest.
pub fn digest(algorithm: &str, data: &[u8]) -> Option<Vec<u8>> {
    let mut ctx = DigestContext::new(algorithm)?;
    ctx.update(data);
    Some(ctx.finish())
}

pub enum CompressionContext {
    Gzip(GzEncoder<Vec<u8>>),
    Gunzip(GzDecoder<Vec<u8>>),
    Deflate(ZlibEncoder<Vec<u8>>),
    Inflate(ZlibDecoder<Vec<u8>>),
    DeflateRaw(DeflateEncoder<Vec<u8>>),
    InflateRaw(DeflateDecoder<Vec<u8>>),
}

impl CompressionContext {
    /// `format` uses the CompressionStream names: `gzip`, `deflate`
    /// (zlib-wrapped), `deflate-raw`.
    pub fn new(format: &str, decompress: bool) -> Option<Self> {
        let level = Compression::default();
        match (format, decompress) {
            ("gzip", false) => Some(Self::Gzip(GzEncoder::new(Vec::new(), level))),
            ("gzip", true) => Some(Self::Gunzip(GzDecoder::new(Vec::new()))),
            ("deflate", false) => Some(Self::Deflate(ZlibEncoder::new(Vec::new(), level))),
            ("deflate", true) => Some(Self::Inflate(ZlibDecoder::new(Vec::new()))),
            ("deflate-raw", false) => Some(Self::DeflateRaw(DeflateEncoder::new(Vec::new(), level))),
            ("deflate-raw", true) => Some(Self::InflateRaw(DeflateDecoder::new(Vec::new()))),
            _ => None,
        }
    }

    pub fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Gzip(w) => w.write_all(data),
            Self::Gunzip(w) => w.write_all(data),
            Self::Deflate(w) => w.write_all(data),
            Self::Inflate(w) => w.write_all(data),
            Self::DeflateRaw(w) => w.write_all(data),
            Self::InflateRaw(w) => w.write_all(data),
        }
    }

    pub fn finish(self) -> std::io::Result<Vec<u8>> {
        match self {
            Self::Gzip(w) => w.finish(),
            Self::Gunzip(w) => w.finish(),
            Self::Deflate(w) => w.finish(),
            Self::Inflate(w) => w.finish(),
            Self::DeflateRaw(w) => w.finish(),
            Self::InflateRaw(w) => w.finish(),
        }
    }
}

/// One-shot transform in either direction.
pub fn transform(format: &str, decompress: bool, data: &[u8]) -> Option<std::io::Result<Vec<u8>>> {
    let mut ctx = CompressionContext::new(format, decompress)?;
    Some(ctx.write(data).and_then(|_| ctx.finish()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        let out = digest("SHA-256", b"abc").unwrap();
        assert_eq!(
            out[..4],
            [0xba, 0x78, 0x16, 0xbf],
            "SHA-256(\"abc\") prefix mismatch"
        );
        assert_eq!(out.len(), 32);
    }

    #[test]
    fn digest_sizes() {
        assert_eq!(digest("sha-1", b"x").unwrap().len(), 20);
        assert_eq!(digest("SHA-384", b"x").unwrap().len(), 48);
        assert_eq!(digest("SHA-512", b"x").unwrap().len(), 64);
        assert!(digest("MD5", b"x").is_none());
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut ctx = DigestContext::new("SHA-256").unwrap();
        ctx.update(b"hello ");
        ctx.update(b"world");
        assert_eq!(ctx.finish(), digest("SHA-256", b"hello world").unwrap());
    }

    #[test]
    fn gzip_round_trip() {
        let payload = b"the same bytes out as went in, eventually".repeat(20);
        let packed = transform("gzip", false, &payload).unwrap().unwrap();
        assert!(packed.len() < payload.len());
        let unpacked = transform("gzip", true, &packed).unwrap().unwrap();
        assert_eq!(unpacked, payload);
    }

    #[test]
    fn deflate_variants_round_trip() {
        for format in ["deflate", "deflate-raw"] {
            let payload = b"abcabcabcabc".repeat(50);
            let packed = transform(format, false, &payload).unwrap().unwrap();
            let unpacked = transform(format, true, &packed).unwrap().unwrap();
            assert_eq!(unpacked, payload, "format {format}");
        }
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!(transform("brotli", false, b"x").is_none());
    }
}
