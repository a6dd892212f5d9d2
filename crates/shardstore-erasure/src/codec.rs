//! Reed-Solomon encoder/decoder
//!
//! `encode` splits a payload into k equal data shards plus m parity
//! shards; `decode` reverses it while tolerating up to m missing shards
//! and verifying the parity equations over whatever survived.

use reed_solomon_simd::{ReedSolomonDecoder, ReedSolomonEncoder};
use shardstore_common::ErasureParams;
use thiserror::Error;

/// Errors specific to erasure coding operations
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("decoding failed: {0}")]
    DecodingFailed(String),

    #[error("insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("shard set failed parity verification")]
    VerificationFailed,
}

impl From<CodecError> for shardstore_common::Error {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::InsufficientShards {
                available,
                required,
            } => Self::InsufficientShards {
                available,
                required,
            },
            CodecError::VerificationFailed => {
                Self::IntegrityFailure("erasure parity verification failed".into())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Stateless (k, m) Reed-Solomon codec
///
/// The same parameters are used fleet-wide, so a single codec instance
/// can be shared freely.
pub struct ShardCodec {
    params: ErasureParams,
}

impl ShardCodec {
    /// Create a new codec with the given parameters
    pub fn new(params: ErasureParams) -> Result<Self, CodecError> {
        if params.data_shards == 0 {
            return Err(CodecError::InvalidConfig("data_shards must be > 0".into()));
        }
        if params.parity_shards == 0 {
            return Err(CodecError::InvalidConfig(
                "parity_shards must be > 0".into(),
            ));
        }
        if params.total_shards() > 255 {
            return Err(CodecError::InvalidConfig(
                "total shards must be <= 255".into(),
            ));
        }
        Ok(Self { params })
    }

    /// Get the codec parameters
    #[must_use]
    pub const fn params(&self) -> ErasureParams {
        self.params
    }

    /// Number of data shards (k)
    #[must_use]
    pub const fn data_shards(&self) -> usize {
        self.params.data_shards as usize
    }

    /// Number of parity shards (m)
    #[must_use]
    pub const fn parity_shards(&self) -> usize {
        self.params.parity_shards as usize
    }

    /// Total shards (k + m)
    #[must_use]
    pub const fn total_shards(&self) -> usize {
        self.params.total_shards()
    }

    /// Shard size used for a payload of `len` bytes
    ///
    /// Padded so every shard is the same size; 64-byte aligned for the
    /// SIMD kernels.
    #[must_use]
    pub fn shard_size_for(&self, len: usize) -> usize {
        len.div_ceil(self.data_shards()).next_multiple_of(64).max(64)
    }

    /// Encode a payload into k data shards and m parity shards
    ///
    /// The payload is zero-padded to k equal chunks; parity shards are a
    /// deterministic function of the data shards.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
        let k = self.data_shards();
        let m = self.parity_shards();
        let shard_size = self.shard_size_for(data.len());

        let mut padded = vec![0u8; shard_size * k];
        padded[..data.len()].copy_from_slice(data);

        let data_shards: Vec<&[u8]> = (0..k)
            .map(|i| &padded[i * shard_size..(i + 1) * shard_size])
            .collect();

        let parity = self.compute_parity(&data_shards, shard_size)?;

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(k + m);
        for shard in data_shards {
            shards.push(shard.to_vec());
        }
        shards.extend(parity);

        Ok(shards)
    }

    /// Decode shards back to the original payload
    ///
    /// `shards` must hold exactly k+m slots in index order, with `None`
    /// for missing shards. At least k present shards are required;
    /// missing data shards are reconstructed, then the full set is
    /// checked against the parity equations before the first k shards
    /// are concatenated and truncated to `original_size`.
    pub fn decode(
        &self,
        shards: &[Option<Vec<u8>>],
        original_size: usize,
    ) -> Result<Vec<u8>, CodecError> {
        let k = self.data_shards();
        let m = self.parity_shards();

        if shards.len() != k + m {
            return Err(CodecError::DecodingFailed(format!(
                "expected {} shard slots, got {}",
                k + m,
                shards.len()
            )));
        }

        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < k {
            return Err(CodecError::InsufficientShards {
                available,
                required: k,
            });
        }

        let shard_size = shards
            .iter()
            .find_map(|s| s.as_ref().map(Vec::len))
            .expect("at least k shards present");
        if shards
            .iter()
            .flatten()
            .any(|s| s.len() != shard_size)
        {
            return Err(CodecError::DecodingFailed(
                "present shards have differing sizes".into(),
            ));
        }

        // Restore any missing data shards.
        let mut data: Vec<Vec<u8>> = Vec::with_capacity(k);
        let data_missing = shards[..k].iter().any(Option::is_none);
        if data_missing {
            let restored = self.reconstruct(shards, shard_size)?;
            for (i, slot) in shards.iter().enumerate().take(k) {
                match slot {
                    Some(s) => data.push(s.clone()),
                    None => data.push(restored[i].clone().ok_or_else(|| {
                        CodecError::DecodingFailed(format!("failed to restore data shard {i}"))
                    })?),
                }
            }
        } else {
            for slot in shards.iter().take(k) {
                data.push(slot.as_ref().unwrap().clone());
            }
        }

        // Verify the parity equations over every parity shard that was
        // actually present. A tampered shard anywhere in the set shows
        // up here as a mismatch.
        let data_refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        let expected_parity = self.compute_parity(&data_refs, shard_size)?;
        for (j, expected) in expected_parity.iter().enumerate() {
            if let Some(present) = &shards[k + j] {
                if present != expected {
                    return Err(CodecError::VerificationFailed);
                }
            }
        }

        let mut output = Vec::with_capacity(k * shard_size);
        for shard in &data {
            output.extend_from_slice(shard);
        }
        output.truncate(original_size);
        Ok(output)
    }

    /// Verify that a complete shard set is internally consistent
    ///
    /// Re-encodes the data shards and compares the parity.
    pub fn verify(&self, shards: &[Vec<u8>]) -> Result<bool, CodecError> {
        let k = self.data_shards();

        if shards.len() != self.total_shards() {
            return Ok(false);
        }
        let Some(shard_size) = shards.first().map(Vec::len) else {
            return Ok(false);
        };
        if !shards.iter().all(|s| s.len() == shard_size) {
            return Ok(false);
        }

        let data_refs: Vec<&[u8]> = shards[..k].iter().map(Vec::as_slice).collect();
        let expected = self.compute_parity(&data_refs, shard_size)?;
        Ok(expected
            .iter()
            .zip(&shards[k..])
            .all(|(want, got)| want == got))
    }

    /// Compute the m parity shards for a full set of data shards
    fn compute_parity(
        &self,
        data_shards: &[&[u8]],
        shard_size: usize,
    ) -> Result<Vec<Vec<u8>>, CodecError> {
        let k = self.data_shards();
        let m = self.parity_shards();

        debug_assert_eq!(data_shards.len(), k);

        let mut encoder = ReedSolomonEncoder::new(k, m, shard_size)
            .map_err(|e| CodecError::InvalidConfig(e.to_string()))?;
        for shard in data_shards {
            encoder
                .add_original_shard(shard)
                .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;
        }
        let result = encoder
            .encode()
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        Ok(result.recovery_iter().map(<[u8]>::to_vec).collect())
    }

    /// Run the RS decoder over the present shards, returning restored
    /// data shards by index.
    fn reconstruct(
        &self,
        shards: &[Option<Vec<u8>>],
        shard_size: usize,
    ) -> Result<Vec<Option<Vec<u8>>>, CodecError> {
        let k = self.data_shards();
        let m = self.parity_shards();

        let mut decoder = ReedSolomonDecoder::new(k, m, shard_size)
            .map_err(|e| CodecError::InvalidConfig(e.to_string()))?;

        for (i, slot) in shards.iter().enumerate().take(k) {
            if let Some(data) = slot {
                decoder
                    .add_original_shard(i, data)
                    .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;
            }
        }
        for j in 0..m {
            if let Some(data) = &shards[k + j] {
                decoder
                    .add_recovery_shard(j, data)
                    .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;
            }
        }

        let result = decoder
            .decode()
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        let mut restored: Vec<Option<Vec<u8>>> = vec![None; k];
        for (i, slot) in restored.iter_mut().enumerate() {
            if shards[i].is_none() {
                *slot = result.restored_original(i).map(<[u8]>::to_vec);
            }
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> ShardCodec {
        ShardCodec::new(ErasureParams::default()).unwrap()
    }

    fn as_slots(shards: Vec<Vec<u8>>) -> Vec<Option<Vec<u8>>> {
        shards.into_iter().map(Some).collect()
    }

    #[test]
    fn test_encode_shape() {
        let codec = codec();
        let shards = codec.encode(b"hello world").unwrap();
        assert_eq!(shards.len(), 9); // 6 data + 3 parity
        let size = shards[0].len();
        assert!(size >= 64 && size % 64 == 0);
        assert!(shards.iter().all(|s| s.len() == size));
    }

    #[test]
    fn test_round_trip() {
        let codec = codec();
        for data in [
            b"x".to_vec(),
            b"hello world".to_vec(),
            vec![0u8; 1000],
            (0..=255u8).cycle().take(10_000).collect::<Vec<_>>(),
        ] {
            let shards = codec.encode(&data).unwrap();
            let decoded = codec.decode(&as_slots(shards), data.len()).unwrap();
            assert_eq!(decoded, data);
        }
    }

    #[test]
    fn test_loss_tolerance_all_subsets() {
        // Any combination of up to m=3 losses must still reconstruct.
        let codec = codec();
        let data: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
        let shards = codec.encode(&data).unwrap();
        let total = shards.len();

        let mut losses: Vec<Vec<usize>> = Vec::new();
        for a in 0..total {
            losses.push(vec![a]);
            for b in (a + 1)..total {
                losses.push(vec![a, b]);
                for c in (b + 1)..total {
                    losses.push(vec![a, b, c]);
                }
            }
        }

        for loss in losses {
            let mut slots = as_slots(shards.clone());
            for &i in &loss {
                slots[i] = None;
            }
            let decoded = codec.decode(&slots, data.len()).unwrap();
            assert_eq!(decoded, data, "failed with losses {loss:?}");
        }
    }

    #[test]
    fn test_too_many_losses() {
        let codec = codec();
        let data = b"hello world";
        let shards = codec.encode(data).unwrap();

        let mut slots = as_slots(shards);
        for i in [2, 4, 5, 7] {
            slots[i] = None; // m + 1 losses
        }
        match codec.decode(&slots, data.len()) {
            Err(CodecError::InsufficientShards {
                available,
                required,
            }) => {
                assert_eq!(available, 5);
                assert_eq!(required, 6);
            }
            other => panic!("expected InsufficientShards, got {other:?}"),
        }
    }

    #[test]
    fn test_tampered_shard_fails_verification() {
        let codec = codec();
        let data = b"the quick brown fox jumps over the lazy dog";
        let shards = codec.encode(data).unwrap();

        // Tamper with a data shard while all shards are present.
        let mut slots = as_slots(shards.clone());
        slots[1].as_mut().unwrap()[0] ^= 0xFF;
        assert!(matches!(
            codec.decode(&slots, data.len()),
            Err(CodecError::VerificationFailed)
        ));

        // Tamper with a parity shard.
        let mut slots = as_slots(shards);
        slots[8].as_mut().unwrap()[3] ^= 0x01;
        assert!(matches!(
            codec.decode(&slots, data.len()),
            Err(CodecError::VerificationFailed)
        ));
    }

    #[test]
    fn test_verify() {
        let codec = ShardCodec::new(ErasureParams::new(4, 2)).unwrap();
        let shards = codec.encode(b"data to verify").unwrap();
        assert!(codec.verify(&shards).unwrap());

        let mut corrupted = shards;
        corrupted[0][0] ^= 0xFF;
        assert!(!codec.verify(&corrupted).unwrap());
    }

    #[test]
    fn test_invalid_config() {
        assert!(ShardCodec::new(ErasureParams::new(0, 3)).is_err());
        assert!(ShardCodec::new(ErasureParams::new(6, 0)).is_err());
    }
}
