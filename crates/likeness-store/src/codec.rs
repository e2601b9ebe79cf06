//! Signature vectors as little-endian f32 BLOBs.

const COMPONENT_BYTES: usize = std::mem::size_of::<f32>();

pub(crate) fn encode(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Returns `None` if the blob is not a whole number of components.
pub(crate) fn decode(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % COMPONENT_BYTES != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(COMPONENT_BYTES)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        assert_eq!(encode(&[1.0]), 1.0f32.to_le_bytes().to_vec());
        assert_eq!(encode(&[0.5, -2.0]).len(), 8);
    }

    #[test]
    fn test_decode_rejects_ragged_blob() {
        assert_eq!(decode(&[0, 0, 128]), None);
    }

    #[test]
    fn test_decode_preserves_special_values() {
        let values = [f32::MIN_POSITIVE, -0.0, 123.456];
        assert_eq!(decode(&encode(&values)).unwrap(), values.to_vec());
    }
}
