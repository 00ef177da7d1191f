#![no_main]

//! Fuzz target for YAML configuration loading.
//!
//! Arbitrary documents must either parse or return a `ConfigError`; parsed
//! documents must survive validation and a JSON round trip without panicking.

use lanegate::config::GatewayConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(yaml) = std::str::from_utf8(data) else {
        return;
    };
    if yaml.len() > 64 * 1024 {
        return;
    }

    if let Ok(config) = GatewayConfig::from_yaml_str(yaml) {
        let _ = config.validate();
        let _ = serde_json::to_string(&config);
    }
});
