// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to read image {0}: {1}")]
    Io(String, #[source] std::io::Error),

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to decode image {0}: {1}")]
    Decode(String, String),

    #[error("failed to encode image: {0}")]
    Encode(String),

    #[error("image too large to attach without recompression: {0} bytes")]
    TooLarge(usize),
}
