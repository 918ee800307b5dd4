//! Response compression (spec §4.12): content negotiation plus
//! synchronous, full-buffer gzip/brotli/deflate.
//!
//! Bodies are already fully buffered by the time this stage runs (streaming
//! compression is an explicit non-goal), so this operates on `&[u8]` in and
//! `Vec<u8>` out rather than wrapping an async reader/writer — a natural fit
//! for the monoio worker's synchronous, CPU-bound compression step.
//!
//! Grounded on `hermes-gateway`'s use of compression crates in a gateway
//! data plane; `globset` likewise follows that repo's content-type glob
//! matching for `should_compress`.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::io::{Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Gzip,
    Brotli,
    Deflate,
    Identity,
}

impl Encoding {
    pub fn as_header_value(&self) -> Option<&'static str> {
        match self {
            Encoding::Gzip => Some("gzip"),
            Encoding::Brotli => Some("br"),
            Encoding::Deflate => Some("deflate"),
            Encoding::Identity => None,
        }
    }
}

struct AcceptedEncoding {
    name: String,
    q: f32,
}

impl Encoding {
    fn wire_name(&self) -> &'static str {
        match self {
            Encoding::Gzip => "gzip",
            Encoding::Brotli => "br",
            Encoding::Deflate => "deflate",
            Encoding::Identity => "identity",
        }
    }
}

/// Parse an `Accept-Encoding` header and pick the first encoding, in
/// `preference` order, that the client accepts (q > 0 and not explicitly
/// excluded). Per spec, the *configured* preference order wins over
/// q-value ranking among accepted candidates — q is only used to accept or
/// reject a candidate, not to rank it above a higher-priority one.
pub fn negotiate_with_preference(accept_encoding: &str, preference: &[Encoding]) -> Encoding {
    if accept_encoding.trim().is_empty() {
        return Encoding::Identity;
    }

    let mut accepted: Vec<AcceptedEncoding> = Vec::new();
    for part in accept_encoding.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let mut segs = part.split(';');
        let name = segs.next().unwrap_or("").trim().to_ascii_lowercase();
        let mut q = 1.0f32;
        for param in segs {
            let param = param.trim();
            if let Some(v) = param.strip_prefix("q=") {
                q = v.parse().unwrap_or(1.0);
            }
        }
        accepted.push(AcceptedEncoding { name, q });
    }

    let accepts = |name: &str| -> bool {
        if accepted.iter().any(|a| a.name == name && a.q == 0.0) {
            return false;
        }
        accepted
            .iter()
            .any(|a| (a.name == name || a.name == "*") && a.q > 0.0)
    };

    for enc in preference {
        if accepts(enc.wire_name()) {
            return *enc;
        }
    }

    Encoding::Identity
}

/// `negotiate_with_preference` with this gateway's default preference
/// order (brotli > gzip > deflate — smallest output first).
pub fn negotiate(accept_encoding: &str) -> Encoding {
    negotiate_with_preference(
        accept_encoding,
        &[Encoding::Brotli, Encoding::Gzip, Encoding::Deflate],
    )
}

pub struct CompressionConfig {
    pub min_size_bytes: usize,
    content_types: GlobSet,
}

impl CompressionConfig {
    pub fn new(min_size_bytes: usize, content_type_patterns: &[&str]) -> Self {
        let mut builder = GlobSetBuilder::new();
        for pattern in content_type_patterns {
            if let Ok(glob) = Glob::new(pattern) {
                builder.add(glob);
            }
        }
        let content_types = builder.build().unwrap_or_else(|_| GlobSetBuilder::new().build().unwrap());
        Self {
            min_size_bytes,
            content_types,
        }
    }

    pub fn default_patterns() -> Self {
        Self::new(
            256,
            &[
                "text/*",
                "application/json",
                "application/javascript",
                "application/xml",
                "image/svg+xml",
            ],
        )
    }
}

/// Whether a response body is worth compressing: big enough to matter, and
/// a content type that isn't already compressed (images, video, archives
/// are excluded by simply not matching any configured pattern).
pub fn should_compress(config: &CompressionConfig, content_type: &str, body_len: usize) -> bool {
    if body_len < config.min_size_bytes {
        return false;
    }
    let bare_type = content_type.split(';').next().unwrap_or(content_type).trim();
    config.content_types.is_match(bare_type)
}

pub fn compress(encoding: Encoding, data: &[u8]) -> std::io::Result<Vec<u8>> {
    match encoding {
        Encoding::Identity => Ok(data.to_vec()),
        Encoding::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        Encoding::Deflate => {
            let mut encoder = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        Encoding::Brotli => {
            let mut out = Vec::new();
            let params = brotli::enc::BrotliEncoderParams::default();
            brotli::BrotliCompress(&mut std::io::Cursor::new(data), &mut out, &params)?;
            Ok(out)
        }
    }
}

pub fn decompress(encoding: Encoding, data: &[u8]) -> std::io::Result<Vec<u8>> {
    match encoding {
        Encoding::Identity => Ok(data.to_vec()),
        Encoding::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
        Encoding::Deflate => {
            let mut decoder = flate2::read::DeflateDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
        Encoding::Brotli => {
            let mut out = Vec::new();
            let mut reader = brotli::Decompressor::new(data, 4096);
            reader.read_to_end(&mut out)?;
            Ok(out)
        }
    }
}
