//! Property-based tests for normalization and batch assembly.
//!
//! Invariants checked for arbitrary documents:
//! - Kept entity count never exceeds the cap
//! - Kept weights sum to one
//! - Masks have exactly as many ones as the true length
//! - Kept entities are the most frequent ones

use proptest::prelude::*;
use salix_core::{
    BatchAssembler, Field, InputGroup, Normalized, NormalizedDocument, NormalizerConfig,
    RecordNormalizer,
};
use serde_json::json;

/// Raw id-list spot with repeats, ids drawn from a small range so counts vary.
fn arb_spot() -> impl Strategy<Value = Vec<u32>> {
    prop::collection::vec(0u32..30, 0..60)
}

/// Packed spot: distinct ids with frequency features.
fn arb_packed() -> impl Strategy<Value = (Vec<u32>, Vec<f32>)> {
    prop::collection::btree_set(1u32..500, 1..40).prop_flat_map(|ids| {
        let n = ids.len();
        (
            Just(ids.into_iter().collect::<Vec<_>>()),
            prop::collection::vec(1u32..10, n).prop_map(|v| v.into_iter().map(|x| x as f32).collect::<Vec<f32>>()),
        )
    })
}

fn normalize(config: NormalizerConfig, line: serde_json::Value) -> Normalized {
    RecordNormalizer::new(config).unwrap().normalize_value(&line)
}

mod normalizer_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn kept_count_respects_cap(spot in arb_spot(), cap in 1usize..15) {
            let config = NormalizerConfig::default().with_max_entities(cap);
            let line = json!({"docno": "d", "spot": {"bodyText": spot}});
            if let Normalized::Document(doc) = normalize(config, line) {
                prop_assert!(doc.entities.len() <= cap);
                prop_assert!(doc.entities.iter().all(|n| n.id != 0));
            }
        }

        #[test]
        fn weights_sum_to_one(spot in arb_spot(), cap in 1usize..15) {
            let config = NormalizerConfig::default().with_max_entities(cap);
            let line = json!({"docno": "d", "spot": {"bodyText": spot}});
            match normalize(config, line) {
                Normalized::Document(doc) => {
                    let total: f32 = doc.entities.iter().map(|n| n.weight).sum();
                    prop_assert!((total - 1.0).abs() < 1e-5, "sum = {}", total);
                }
                Normalized::Skipped(_) => {
                    prop_assert!(spot.iter().all(|&id| id == 0));
                }
            }
        }

        #[test]
        fn kept_entities_are_most_frequent((ids, freqs) in arb_packed(), cap in 1usize..10) {
            let config = NormalizerConfig::default()
                .with_input(InputGroup::EntityFeature)
                .with_entity_feature_dim(1)
                .with_max_entities(cap);
            let features: Vec<Vec<f32>> = freqs.iter().map(|&f| vec![f]).collect();
            let line = json!({"docno": "d", "spot": {"bodyText": {"entities": ids, "features": features}}});
            let doc = normalize(config, line).document().unwrap();

            let kept_min = doc.entities.iter().map(|n| n.features[0]).fold(f32::INFINITY, f32::min);
            let dropped_max = ids
                .iter()
                .zip(&freqs)
                .filter(|(id, _)| !doc.entities.iter().any(|n| n.id == **id))
                .map(|(_, &f)| f)
                .fold(f32::NEG_INFINITY, f32::max);
            prop_assert!(kept_min >= dropped_max);
            prop_assert_eq!(doc.entities.len(), cap.min(ids.len()));
        }
    }
}

mod assembler_props {
    use super::*;

    fn docs_from(spots: &[Vec<u32>]) -> Vec<NormalizedDocument> {
        let normalizer = RecordNormalizer::new(NormalizerConfig::default()).unwrap();
        spots
            .iter()
            .filter_map(|spot| {
                normalizer
                    .normalize_value(&json!({"docno": "d", "spot": {"bodyText": spot}}))
                    .document()
            })
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn mask_ones_match_lengths(spots in prop::collection::vec(arb_spot(), 1..8)) {
            let docs = docs_from(&spots);
            prop_assume!(!docs.is_empty());

            let batch = BatchAssembler::new(InputGroup::EntityRaw, 0).assemble(&docs).unwrap();
            let mask = batch.mask(Field::Nodes).unwrap();
            let weights = batch.floats(Field::Weights).unwrap();
            for (i, doc) in docs.iter().enumerate() {
                let ones = mask.row(i).iter().filter(|&&m| m == 1.0).count();
                prop_assert_eq!(ones, doc.entities.len());
                let zeros = mask.row(i).iter().filter(|&&m| m == 0.0).count();
                prop_assert_eq!(ones + zeros, mask.ncols());
                let masked: f32 = weights.row(i).iter().zip(mask.row(i)).map(|(w, m)| w * m).sum();
                prop_assert!((masked - 1.0).abs() < 1e-5);
            }
        }
    }
}
