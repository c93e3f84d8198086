//! Block protocol: blob naming, MD5 recomputation, and the hash chain.
//!
//! Pure, transport-independent logic so the invariants in spec.md §8 (1, 7,
//! 8) are unit-testable without spinning up an HTTP server. `server` and
//! `client` are both thin callers of this module.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};

/// Seed chain value for block 0, per spec.md §4.B ("Chain of block 0 uses a
/// zeroed seed").
pub const CHAIN_SEED: [u8; 16] = [0u8; 16];

/// A blob name is either a numbered block or one of the two control blobs
/// that bracket the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobName {
    Start,
    Block(u64),
    End,
}

impl BlobName {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            ".start" => Some(Self::Start),
            ".end" => Some(Self::End),
            n => n.parse::<u64>().ok().map(Self::Block),
        }
    }
}

impl std::fmt::Display for BlobName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, ".start"),
            Self::Block(n) => write!(f, "{n}"),
            Self::End => write!(f, ".end"),
        }
    }
}

pub fn md5_of(bytes: &[u8]) -> [u8; 16] {
    Md5::digest(bytes).into()
}

pub fn md5_base64(bytes: &[u8]) -> String {
    BASE64.encode(md5_of(bytes))
}

/// `chain(N) = MD5(chain(N-1) || MD5(block N))`, per spec.md's glossary.
pub fn chain_next(previous_chain: &[u8; 16], current_block_md5: &[u8; 16]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(previous_chain);
    hasher.update(current_block_md5);
    hasher.finalize().into()
}

pub fn chain_base64(chain: &[u8; 16]) -> String {
    BASE64.encode(chain)
}

pub fn decode_base64_16(s: &str) -> Option<[u8; 16]> {
    let bytes = BASE64.decode(s).ok()?;
    bytes.try_into().ok()
}

/// Verifies a just-received block against the headers the writer supplied,
/// and against the chain value carried forward from the previous block.
/// Returns the new chain value to persist alongside this block.
pub fn verify_block(
    body: &[u8],
    claimed_content_md5_b64: &str,
    claimed_chain_b64: &str,
    previous_chain: &[u8; 16],
) -> Result<[u8; 16], BlockVerifyError> {
    let claimed_md5 = decode_base64_16(claimed_content_md5_b64).ok_or(BlockVerifyError::Md5Mismatch)?;
    let computed_md5 = md5_of(body);
    if claimed_md5 != computed_md5 {
        return Err(BlockVerifyError::Md5Mismatch);
    }

    let claimed_chain = decode_base64_16(claimed_chain_b64).ok_or(BlockVerifyError::HashChainMismatch)?;
    let computed_chain = chain_next(previous_chain, &computed_md5);
    if claimed_chain != computed_chain {
        return Err(BlockVerifyError::HashChainMismatch);
    }

    Ok(computed_chain)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockVerifyError {
    Md5Mismatch,
    HashChainMismatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_name_round_trips() {
        assert_eq!(BlobName::parse(".start"), Some(BlobName::Start));
        assert_eq!(BlobName::parse(".end"), Some(BlobName::End));
        assert_eq!(BlobName::parse("42"), Some(BlobName::Block(42)));
        assert_eq!(BlobName::parse("not-a-block"), None);
        assert_eq!(BlobName::Block(7).to_string(), "7");
    }

    #[test]
    fn chain_of_block_zero_uses_zero_seed() {
        let body = b"Paul";
        let md5 = md5_of(body);
        let chain0 = chain_next(&CHAIN_SEED, &md5);
        // Same body produces the same chain only when seeded from CHAIN_SEED.
        assert_ne!(chain0, md5);
    }

    #[test]
    fn verify_block_accepts_matching_md5_and_chain() {
        let body = b"hello world";
        let md5_b64 = md5_base64(body);
        let chain = chain_next(&CHAIN_SEED, &md5_of(body));
        let chain_b64 = chain_base64(&chain);

        let result = verify_block(body, &md5_b64, &chain_b64, &CHAIN_SEED).unwrap();
        assert_eq!(result, chain);
    }

    #[test]
    fn verify_block_rejects_tampered_md5() {
        let body = b"hello world";
        let wrong_md5_b64 = md5_base64(b"goodbye world");
        let chain_b64 = chain_base64(&chain_next(&CHAIN_SEED, &md5_of(b"goodbye world")));
        let err = verify_block(body, &wrong_md5_b64, &chain_b64, &CHAIN_SEED).unwrap_err();
        assert_eq!(err, BlockVerifyError::Md5Mismatch);
    }

    #[test]
    fn verify_block_rejects_tampered_chain_with_correct_md5() {
        // Invariant 8 (spec.md §8): a corrupted X-Hash-Chain is rejected even
        // when Content-MD5 matches the body.
        let body = b"hello world";
        let md5_b64 = md5_base64(body);
        let tampered_chain_b64 = chain_base64(&CHAIN_SEED); // wrong: didn't fold in this block's md5
        let err = verify_block(body, &md5_b64, &tampered_chain_b64, &CHAIN_SEED).unwrap_err();
        assert_eq!(err, BlockVerifyError::HashChainMismatch);
    }

    #[test]
    fn sequential_chain_matches_two_block_stream() {
        let block0 = b"Pa";
        let block1 = b"ul";
        let chain0 = chain_next(&CHAIN_SEED, &md5_of(block0));
        let chain1 = chain_next(&chain0, &md5_of(block1));

        let verified0 = verify_block(block0, &md5_base64(block0), &chain_base64(&chain0), &CHAIN_SEED).unwrap();
        let verified1 = verify_block(block1, &md5_base64(block1), &chain_base64(&chain1), &verified0).unwrap();
        assert_eq!(verified1, chain1);
    }
}
