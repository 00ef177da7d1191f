#![no_main]

//! Fuzz target for request resolution.
//!
//! Any client-supplied request must resolve or fail with `InvalidRequest`;
//! resolved parameters must always produce a `tts:`-prefixed key, and a
//! watermark-required lane must always resolve with the watermark on.

use arbitrary::Arbitrary;
use lanegate::cache::{CacheKey, KEY_PREFIX};
use lanegate::config::{GatewayConfig, LaneConfig};
use lanegate::params::{SynthesisParams, SynthesisRequest};
use lanegate::{GatewayError, Lane};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    text: String,
    voice_id: Option<String>,
    quality: Option<String>,
    sampler: Option<String>,
    watermark: Option<bool>,
    free_lane: bool,
}

fuzz_target!(|input: Input| {
    let config = GatewayConfig::default();
    let (lane, lane_config) = if input.free_lane {
        (Lane::Free, LaneConfig::free())
    } else {
        (Lane::Priority, LaneConfig::priority())
    };

    let request = SynthesisRequest {
        text: input.text,
        voice_id: input.voice_id,
        quality: input.quality,
        sampler: input.sampler,
        watermark: input.watermark,
    };

    match SynthesisParams::resolve(&request, &lane_config, &config) {
        Ok(params) => {
            assert!(params.watermark || !lane_config.watermark_required);
            assert!(params.char_len() <= config.max_text_chars);
            let key = CacheKey::derive(&params, lane);
            assert!(key.as_str().starts_with(KEY_PREFIX));
        }
        Err(GatewayError::InvalidRequest { .. }) => {}
        Err(other) => panic!("unexpected error: {other:?}"),
    }
});
