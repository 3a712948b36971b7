//! Generation collaborators that feed tokens into the bridge.

mod mock;
mod openai;
mod traits;

pub use mock::MockGenerator;
pub use openai::OpenAIGenerator;
pub use traits::{GenerationRequest, Generator};

use std::sync::Arc;
use std::time::Duration;

use crate::config::GeneratorConfig;
use crate::error::GenerationError;

/// Create a generator from configuration.
pub fn create_generator(config: &GeneratorConfig) -> Result<Arc<dyn Generator>, GenerationError> {
    match config.provider.as_str() {
        "mock" => Ok(Arc::new(MockGenerator::with_delay(Duration::from_millis(
            config.mock.token_delay_ms,
        )))),
        "openai" => Ok(Arc::new(OpenAIGenerator::from_config(config)?)),
        other => Err(GenerationError::Config(format!(
            "Unknown generator provider: {}. Available: mock, openai",
            other
        ))),
    }
}
