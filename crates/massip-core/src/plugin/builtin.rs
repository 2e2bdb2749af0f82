use super::{Plugin, PluginCall, PluginMetadata, PluginOutcome, PluginOutput, PluginResult};

/// Returns the entity unchanged. Touches neither the network nor processes.
pub struct EchoPlugin {
    metadata: PluginMetadata,
}

impl EchoPlugin {
    pub const NAME: &'static str = "echo";

    #[must_use]
    pub fn new() -> Self {
        Self {
            metadata: PluginMetadata::new("Echo the entity back").with_network_facing(false),
        }
    }
}

impl Default for EchoPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Plugin for EchoPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    async fn invoke(&self, call: &PluginCall) -> PluginOutcome {
        Ok(PluginOutput::Structured(PluginResult::success(
            call.entity.clone(),
        )))
    }
}
