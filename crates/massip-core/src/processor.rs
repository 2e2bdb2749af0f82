use std::collections::HashMap;
use std::sync::Arc;

use crate::address;
use crate::entity::Entity;
use crate::extract::EntityExtractor;
use crate::invoker::{private_skip_message, Invocation, PluginInvoker};
use crate::progress::{InvocationKind, ProgressEvent, ProgressSender};
use crate::registry::PluginSelection;

/// An output row plus how many of its cells came from failed invocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowOutcome {
    pub row: Vec<String>,
    pub failed_invocations: usize,
}

/// Turns one input row into one output row: the original cells followed by
/// one cell per (entity, plugin) pair, entity-major.
#[derive(Clone)]
pub struct RowProcessor {
    extractor: EntityExtractor,
    selection: PluginSelection,
    parameters: HashMap<String, String>,
    invoker: Arc<PluginInvoker>,
    progress: ProgressSender,
    batch: Arc<str>,
}

impl RowProcessor {
    pub fn new(
        batch: impl Into<Arc<str>>,
        extractor: EntityExtractor,
        selection: PluginSelection,
        invoker: Arc<PluginInvoker>,
    ) -> Self {
        Self {
            extractor,
            selection,
            parameters: HashMap::new(),
            invoker,
            progress: ProgressSender::disabled(),
            batch: batch.into(),
        }
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: HashMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = progress;
        self
    }

    pub async fn process(
        &self,
        row: &[String],
        row_index: usize,
        total_rows: Option<usize>,
    ) -> RowOutcome {
        let entities = self.extractor.extract(row, row_index);
        let mut output = row.to_vec();
        output.reserve(entities.len() * self.selection.len());
        let mut failed_invocations = 0;

        for entity in &entities {
            let legacy_skip =
                self.extractor.is_whole_cell() && address::is_private_entity(entity.value());

            for plugin in self.selection.iter() {
                let name = plugin.name();

                if legacy_skip || self.invoker.screens(plugin.as_ref(), entity.value()) {
                    self.announce(InvocationKind::Skipping, name, entity, total_rows);
                    output.push(private_skip_message(entity.value()));
                    continue;
                }

                self.announce(InvocationKind::Invoking, name, entity, total_rows);
                let parameter = self.parameters.get(name).map_or("", String::as_str);
                let invocation = self.invoker.invoke(plugin, entity.value(), parameter).await;

                if let Invocation::Failed(result) = &invocation {
                    failed_invocations += 1;
                    self.progress.emit(ProgressEvent::InvocationFailed {
                        batch: Arc::clone(&self.batch),
                        plugin_name: name.to_string(),
                        entity: entity.value().to_string(),
                        row_index,
                        message: result.output.clone(),
                    });
                }
                output.push(invocation.into_result().output);
            }
        }

        RowOutcome {
            row: output,
            failed_invocations,
        }
    }

    fn announce(
        &self,
        kind: InvocationKind,
        plugin: &str,
        entity: &Entity,
        total_rows: Option<usize>,
    ) {
        self.progress.emit(ProgressEvent::Invocation {
            batch: Arc::clone(&self.batch),
            kind,
            plugin_name: plugin.to_string(),
            entity: entity.value().to_string(),
            row_index: entity.location().row,
            total_rows,
        });
    }
}
