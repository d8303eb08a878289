//! Token sampling for the ONNX decode loop
//!
//! Temperature-scaled softmax over the last position's logits, optional
//! nucleus (top-p) filtering, then a categorical draw.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

/// Sample a token index from raw logits. Returns `None` when the logits are
/// empty or degenerate (all-zero mass), which callers treat as end-of-stream.
pub(crate) fn sample_token<R: Rng>(
    logits: &[f32],
    temperature: f32,
    top_p: f32,
    rng: &mut R,
) -> Option<usize> {
    if logits.is_empty() {
        return None;
    }

    // Softmax with max-shift for numeric stability; temperature of 0 or 1
    // leaves the distribution unscaled.
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let scale = if temperature > 0.0 && temperature != 1.0 {
        temperature
    } else {
        1.0
    };

    let mut probs: Vec<f32> = logits
        .iter()
        .map(|&logit| ((logit - max_logit) / scale).exp())
        .collect();

    let sum: f32 = probs.iter().sum();
    if !sum.is_finite() || sum <= 0.0 {
        return None;
    }
    for p in &mut probs {
        *p /= sum;
    }

    if top_p > 0.0 && top_p < 1.0 {
        apply_nucleus_filter(&mut probs, top_p);
    }

    let dist = WeightedIndex::new(&probs).ok()?;
    Some(dist.sample(rng))
}

/// Keep the minimal descending-probability prefix whose cumulative mass
/// reaches `top_p`; zero out the rest. The categorical draw renormalizes.
fn apply_nucleus_filter(probs: &mut [f32], top_p: f32) {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| {
        probs[b]
            .partial_cmp(&probs[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut cumulative = 0.0f32;
    let mut cutoff = probs.len();
    for (rank, &idx) in order.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative >= top_p {
            cutoff = rank + 1;
            break;
        }
    }

    for &idx in &order[cutoff..] {
        probs[idx] = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn empty_logits_yield_none() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(sample_token(&[], 1.0, 0.9, &mut rng), None);
    }

    #[test]
    fn tight_nucleus_selects_argmax() {
        let mut rng = StdRng::seed_from_u64(7);
        let logits = vec![0.0, 10.0, 0.5, -2.0];
        for _ in 0..50 {
            assert_eq!(sample_token(&logits, 1.0, 0.01, &mut rng), Some(1));
        }
    }

    #[test]
    fn full_nucleus_still_prefers_dominant_logit() {
        let mut rng = StdRng::seed_from_u64(42);
        let logits = vec![-5.0, 12.0, -5.0];
        let mut hits = 0;
        for _ in 0..100 {
            if sample_token(&logits, 1.0, 1.0, &mut rng) == Some(1) {
                hits += 1;
            }
        }
        assert!(hits > 95);
    }

    #[test]
    fn low_temperature_sharpens_distribution() {
        let mut rng = StdRng::seed_from_u64(3);
        let logits = vec![1.0, 1.5, 0.5];
        let mut hits = 0;
        for _ in 0..200 {
            if sample_token(&logits, 0.05, 1.0, &mut rng) == Some(1) {
                hits += 1;
            }
        }
        assert!(hits > 195);
    }

    #[test]
    fn nucleus_filter_zeroes_tail_mass() {
        let mut probs = vec![0.5, 0.3, 0.15, 0.05];
        apply_nucleus_filter(&mut probs, 0.75);
        assert!(probs[0] > 0.0);
        assert!(probs[1] > 0.0);
        assert_eq!(probs[2], 0.0);
        assert_eq!(probs[3], 0.0);
    }
}
