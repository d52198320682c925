//! Embedding quantization policy (§4.1): when `embeddings.quantization_enabled`
//! is set, float-32 vectors are stored as 8-bit integers via min-max scaling,
//! with the scale/offset stored alongside. Transparent to callers — only the
//! semantic-tier driver's storage path sees quantized bytes.
//!
//! Grounded on the numeric-transform style of `embeddings::Embedding`
//! (`to_bytes`/`from_bytes`, `cosine_similarity`, `normalize`).

/// An embedding quantized to 8-bit integers, with the min-max parameters
/// needed to dequantize.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedEmbedding {
    pub values: Vec<i8>,
    pub scale: f32,
    pub offset: f32,
}

/// Quantize a float-32 vector via min-max scaling to `[-127, 127]`.
pub fn quantize(vector: &[f32]) -> QuantizedEmbedding {
    let min = vector.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = vector.iter().cloned().fold(f32::NEG_INFINITY, f32::max);

    if !(max > min) {
        return QuantizedEmbedding {
            values: vec![0; vector.len()],
            scale: 1.0,
            offset: min,
        };
    }

    let scale = (max - min) / 254.0;
    let offset = min;

    let values = vector
        .iter()
        .map(|&v| (((v - offset) / scale) - 127.0).round().clamp(-127.0, 127.0) as i8)
        .collect();

    QuantizedEmbedding {
        values,
        scale,
        offset,
    }
}

/// Invert [`quantize`]; round-trip mean absolute error must stay <= 0.01 for
/// unit-norm inputs (§4.1, §8).
pub fn dequantize(q: &QuantizedEmbedding) -> Vec<f32> {
    q.values
        .iter()
        .map(|&v| (v as f32 + 127.0) * q.scale + q.offset)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::cosine_similarity;

    fn unit_norm(v: &[f32]) -> Vec<f32> {
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter().map(|x| x / norm).collect()
    }

    #[test]
    fn round_trip_mean_absolute_error_is_small() {
        let original = unit_norm(&[0.1, 0.5, -0.3, 0.9, -0.8, 0.2, 0.05, -0.6]);
        let q = quantize(&original);
        let restored = dequantize(&q);

        let mae: f32 = original
            .iter()
            .zip(restored.iter())
            .map(|(a, b)| (a - b).abs())
            .sum::<f32>()
            / original.len() as f32;

        assert!(mae <= 0.01, "mae was {mae}");
    }

    #[test]
    fn cosine_similarity_preserved_within_tolerance() {
        let a = unit_norm(&[0.2, 0.4, -0.1, 0.9, -0.3, 0.6, 0.15, -0.45]);
        let b = unit_norm(&[0.25, 0.35, -0.2, 0.8, -0.25, 0.5, 0.1, -0.5]);

        let qa = dequantize(&quantize(&a));
        let qb = dequantize(&quantize(&b));

        let original_sim = cosine_similarity(&a, &b);
        let quantized_sim = cosine_similarity(&qa, &qb);

        let relative_error = ((original_sim - quantized_sim) / original_sim).abs();
        assert!(relative_error <= 0.10, "relative error was {relative_error}");
    }

    #[test]
    fn unit_norm_round_trip_cosine_at_least_0_97() {
        let v = unit_norm(&[0.3, -0.1, 0.8, 0.2, -0.4, 0.1, 0.05, -0.2]);
        let restored = dequantize(&quantize(&v));
        let sim = cosine_similarity(&v, &restored);
        assert!(sim >= 0.97, "cosine similarity was {sim}");
    }

    #[test]
    fn constant_vector_does_not_panic() {
        let v = vec![0.5_f32; 8];
        let q = quantize(&v);
        let restored = dequantize(&q);
        assert_eq!(restored.len(), 8);
    }
}
