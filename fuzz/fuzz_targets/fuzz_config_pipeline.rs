//! Fuzz target for pipeline config parsing and validation.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tq_config::PipelineConfig;

fuzz_target!(|data: &str| {
    if let Ok(config) = PipelineConfig::from_json_str(data) {
        // Validated configs always satisfy the batch/queue relation
        assert!(config.batch_size >= 1 && config.batch_size <= config.max_queue_size);
    }
});
