//! Fragment compression codecs.
//!
//! The codec names a fragment's on-store encoding and the extension carried
//! by its content name. The broker pipeline replicates raw bytes; encoding
//! and transcoding happen at the store boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionCodec {
    #[default]
    None,
    Gzip,
    Snappy,
    Zstd,
}

impl CompressionCodec {
    /// The content-name extension, including the leading dot (empty for
    /// uncompressed fragments).
    pub fn ext(self) -> &'static str {
        match self {
            CompressionCodec::None => "",
            CompressionCodec::Gzip => ".gz",
            CompressionCodec::Snappy => ".sz",
            CompressionCodec::Zstd => ".zst",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompressionCodec::None => "none",
            CompressionCodec::Gzip => "gzip",
            CompressionCodec::Snappy => "snappy",
            CompressionCodec::Zstd => "zstd",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "none" => Some(CompressionCodec::None),
            "gzip" => Some(CompressionCodec::Gzip),
            "snappy" => Some(CompressionCodec::Snappy),
            "zstd" => Some(CompressionCodec::Zstd),
            _ => None,
        }
    }

    /// Split a content-name suffix into (stem, codec). Unknown suffixes are
    /// treated as part of the stem (codec None).
    pub fn split_ext(name: &str) -> (&str, Self) {
        for codec in [
            CompressionCodec::Gzip,
            CompressionCodec::Snappy,
            CompressionCodec::Zstd,
        ] {
            if let Some(stem) = name.strip_suffix(codec.ext()) {
                return (stem, codec);
            }
        }
        (name, CompressionCodec::None)
    }
}

impl fmt::Display for CompressionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
