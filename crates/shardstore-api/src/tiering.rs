//! Tiering event record
//!
//! Produced by the ML subsystem onto the event log; field names follow
//! the broker contract exactly (snake_case, epoch-seconds float).

use serde::{Deserialize, Serialize};
use shardstore_common::Tier;

/// One tiering recommendation from the event stream
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TieringRequest {
    /// Epoch seconds, as emitted by the producer
    pub timestamp: f64,
    pub bucket_name: String,
    pub object_key: String,
    pub current_tier: Tier,
    pub recommended_tier: Tier,
    /// Model confidence in the recommendation, in [0, 1]
    pub confidence: f64,
    /// Model's probability that the object belongs in the hot tier
    pub probability_hot: f64,
    pub model_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let json = r#"{
            "timestamp": 1700000000.25,
            "bucket_name": "b1",
            "object_key": "logs/2024/01.gz",
            "current_tier": "cold",
            "recommended_tier": "hot",
            "confidence": 0.9,
            "probability_hot": 0.87,
            "model_version": "tiering-v3"
        }"#;
        let event: TieringRequest = serde_json::from_str(json).unwrap();
        assert_eq!(event.current_tier, Tier::Cold);
        assert_eq!(event.recommended_tier, Tier::Hot);
        assert!((event.confidence - 0.9).abs() < f64::EPSILON);
    }
}
