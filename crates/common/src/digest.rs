//! Digest decoding and validation at the front-end boundary.
//!
//! Clients submit 32-byte message digests encoded as hex (case-insensitive)
//! or standard padded base64. Anything that does not decode to exactly
//! 32 bytes is an [`ErrorKind::InvalidArgument`].

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{ApiError, ErrorKind};

/// Byte length every digest must decode to.
pub const DIGEST_LEN: usize = 32;

/// Encoding of a digest string submitted by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestEncoding {
    Hex,
    Base64,
}

impl DigestEncoding {
    /// Normalize a client-supplied encoding label. An empty string selects
    /// hex, the historical default.
    pub fn parse(raw: &str) -> Result<Self, ApiError> {
        match raw.to_ascii_lowercase().as_str() {
            "" | "hex" => Ok(DigestEncoding::Hex),
            "base64" => Ok(DigestEncoding::Base64),
            other => Err(ApiError::new(
                ErrorKind::InvalidArgument,
                format!("unsupported encoding {other:?}"),
            )),
        }
    }
}

/// Decode a digest string and verify it is exactly [`DIGEST_LEN`] bytes.
pub fn decode_digest(digest: &str, enc: DigestEncoding) -> Result<[u8; DIGEST_LEN], ApiError> {
    let decoded = match enc {
        DigestEncoding::Hex => hex::decode(digest)
            .map_err(|e| ApiError::new(ErrorKind::InvalidArgument, format!("invalid hex digest: {e}")))?,
        DigestEncoding::Base64 => STANDARD.decode(digest).map_err(|e| {
            ApiError::new(ErrorKind::InvalidArgument, format!("invalid base64 digest: {e}"))
        })?,
    };
    let len = decoded.len();
    decoded.try_into().map_err(|_| {
        ApiError::new(
            ErrorKind::InvalidArgument,
            format!("digest must decode to {DIGEST_LEN} bytes, got {len}"),
        )
    })
}

/// Validate a digest string without keeping the decoded bytes.
pub fn validate_digest(digest: &str, enc: DigestEncoding) -> Result<(), ApiError> {
    decode_digest(digest, enc).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_encoding_defaults_to_hex() {
        assert_eq!(DigestEncoding::parse("").unwrap(), DigestEncoding::Hex);
        assert_eq!(DigestEncoding::parse("hex").unwrap(), DigestEncoding::Hex);
        assert_eq!(DigestEncoding::parse("HEX").unwrap(), DigestEncoding::Hex);
        assert_eq!(
            DigestEncoding::parse("base64").unwrap(),
            DigestEncoding::Base64
        );
        assert!(DigestEncoding::parse("base58").is_err());
    }

    #[test]
    fn wrong_length_rejected() {
        let short = hex::encode([0u8; 16]);
        let err = decode_digest(&short, DigestEncoding::Hex).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let long = STANDARD.encode([0u8; 48]);
        let err = decode_digest(&long, DigestEncoding::Base64).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn illegal_characters_rejected() {
        let err = decode_digest("zzz", DigestEncoding::Hex).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = decode_digest("!!!not-base64!!!", DigestEncoding::Base64).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn validate_digest_passes_through() {
        assert!(validate_digest(&hex::encode([1u8; 32]), DigestEncoding::Hex).is_ok());
        assert!(validate_digest("0011", DigestEncoding::Hex).is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn hex_round_trips_any_digest(bytes in proptest::array::uniform32(any::<u8>())) {
                let decoded = decode_digest(&hex::encode(bytes), DigestEncoding::Hex).unwrap();
                prop_assert_eq!(decoded, bytes);
                // Case-insensitive: uppercase hex decodes to the same bytes.
                let decoded = decode_digest(&hex::encode_upper(bytes), DigestEncoding::Hex).unwrap();
                prop_assert_eq!(decoded, bytes);
            }

            #[test]
            fn base64_round_trips_any_digest(bytes in proptest::array::uniform32(any::<u8>())) {
                let decoded = decode_digest(&STANDARD.encode(bytes), DigestEncoding::Base64).unwrap();
                prop_assert_eq!(decoded, bytes);
            }

            #[test]
            fn wrong_length_is_always_invalid_argument(
                bytes in proptest::collection::vec(any::<u8>(), 0..64),
            ) {
                prop_assume!(bytes.len() != DIGEST_LEN);
                let err = decode_digest(&hex::encode(&bytes), DigestEncoding::Hex).unwrap_err();
                prop_assert_eq!(err.kind(), ErrorKind::InvalidArgument);
                let err = decode_digest(&STANDARD.encode(&bytes), DigestEncoding::Base64).unwrap_err();
                prop_assert_eq!(err.kind(), ErrorKind::InvalidArgument);
            }
        }
    }
}
