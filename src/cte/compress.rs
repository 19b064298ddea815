//! Compression seam for chunk transforms.
//!
//! Real codecs are external wrappers; the core only depends on this
//! interface and ships the identity transform.

use crate::error::Result;

pub trait Compressor: Send + Sync {
    fn compress(&self, input: &[u8], output: &mut Vec<u8>) -> Result<()>;
    fn decompress(&self, input: &[u8], output: &mut Vec<u8>) -> Result<()>;
}

/// Pass-through transform used unless a codec wrapper is registered.
pub struct Identity;

impl Compressor for Identity {
    fn compress(&self, input: &[u8], output: &mut Vec<u8>) -> Result<()> {
        output.clear();
        output.extend_from_slice(input);
        Ok(())
    }

    fn decompress(&self, input: &[u8], output: &mut Vec<u8>) -> Result<()> {
        output.clear();
        output.extend_from_slice(input);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trips() {
        let codec = Identity;
        let mut packed = Vec::new();
        codec.compress(b"chunk bytes", &mut packed).unwrap();
        let mut unpacked = Vec::new();
        codec.decompress(&packed, &mut unpacked).unwrap();
        assert_eq!(unpacked, b"chunk bytes");
    }
}
