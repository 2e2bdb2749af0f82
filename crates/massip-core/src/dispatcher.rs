//! Drives a [`RowProcessor`] over one input source.
//!
//! Rows are processed strictly in order and each output row reaches the sink
//! before the next input row is read. Exactly one terminal progress event
//! (`BatchComplete` or `BatchFailed`) is emitted per run.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::extract::EntityExtractor;
use crate::invoker::PluginInvoker;
use crate::parser::ParserDefinition;
use crate::processor::RowProcessor;
use crate::progress::{ProgressEvent, ProgressSender};
use crate::registry::PluginSelection;
use crate::rows::{BatchIoError, CsvRowSink, CsvRowSource, RowRead, RowSink, RowSource};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub rows_read: usize,
    pub rows_written: usize,
    pub row_errors: usize,
    pub failed_invocations: usize,
    pub cancelled: bool,
}

/// Shared cancellation switch, checked between rows.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct BatchDispatcher {
    label: Arc<str>,
    selection: PluginSelection,
    invoker: Arc<PluginInvoker>,
    parser: Option<ParserDefinition>,
    parameters: HashMap<String, String>,
    progress: ProgressSender,
    header: bool,
}

impl BatchDispatcher {
    pub fn new(
        label: impl Into<Arc<str>>,
        selection: PluginSelection,
        invoker: Arc<PluginInvoker>,
    ) -> Self {
        Self {
            label: label.into(),
            selection,
            invoker,
            parser: None,
            parameters: HashMap::new(),
            progress: ProgressSender::disabled(),
            header: false,
        }
    }

    #[must_use]
    pub fn with_parser(mut self, parser: Option<ParserDefinition>) -> Self {
        self.parser = parser;
        self
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

    /// Treat the first record as a header and extend it with result columns.
    #[must_use]
    pub const fn with_header(mut self, header: bool) -> Self {
        self.header = header;
        self
    }

    /// One `<entity_type>:<plugin>` column per selected plugin.
    pub fn header_columns(&self) -> Vec<String> {
        let extractor = EntityExtractor::new(self.parser.clone());
        let entity_type = extractor.entity_type();
        self.selection
            .names()
            .into_iter()
            .map(|plugin| format!("{entity_type}:{plugin}"))
            .collect()
    }

    /// Open `input`, create `output` and run. Open/create failures end the
    /// batch with `BatchFailed` like any other I/O failure.
    pub async fn run_csv(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancelFlag,
    ) -> Result<BatchSummary, BatchIoError> {
        let opened = match CsvRowSource::open(input).await {
            Ok(source) => CsvRowSink::create(output).await.map(|sink| (source, sink)),
            Err(error) => Err(error),
        };
        match opened {
            Ok((mut source, mut sink)) => self.run(&mut source, &mut sink, cancel).await,
            Err(error) => Err(self.fail(error).await),
        }
    }

    pub async fn run(
        &self,
        source: &mut dyn RowSource,
        sink: &mut dyn RowSink,
        cancel: &CancelFlag,
    ) -> Result<BatchSummary, BatchIoError> {
        tracing::info!(batch = %self.label, plugins = ?self.selection.names(), "batch started");

        match self.drive(source, sink, cancel).await {
            Ok(summary) => {
                tracing::info!(
                    batch = %self.label,
                    rows = summary.rows_written,
                    row_errors = summary.row_errors,
                    failed_invocations = summary.failed_invocations,
                    cancelled = summary.cancelled,
                    "batch finished"
                );
                self.progress
                    .finish(ProgressEvent::BatchComplete {
                        batch: Arc::clone(&self.label),
                        rows_written: summary.rows_written,
                        cancelled: summary.cancelled,
                    })
                    .await;
                Ok(summary)
            }
            Err(error) => Err(self.fail(error).await),
        }
    }

    async fn fail(&self, error: BatchIoError) -> BatchIoError {
        tracing::warn!(batch = %self.label, %error, "batch failed");
        self.progress
            .finish(ProgressEvent::BatchFailed {
                batch: Arc::clone(&self.label),
                error: error.to_string(),
            })
            .await;
        error
    }

    /// Row 0 is the header record.
    fn row_failed(&self, row_index: usize, message: String) {
        tracing::warn!(batch = %self.label, row = row_index, %message, "skipping malformed row");
        self.progress.emit(ProgressEvent::RowFailed {
            batch: Arc::clone(&self.label),
            row_index,
            message,
        });
    }

    async fn drive(
        &self,
        source: &mut dyn RowSource,
        sink: &mut dyn RowSink,
        cancel: &CancelFlag,
    ) -> Result<BatchSummary, BatchIoError> {
        let processor = RowProcessor::new(
            Arc::clone(&self.label),
            EntityExtractor::new(self.parser.clone()),
            self.selection.clone(),
            Arc::clone(&self.invoker),
        )
        .with_parameters(self.parameters.clone())
        .with_progress(self.progress.clone());

        let mut summary = BatchSummary::default();
        let mut total_rows = source.total_rows();

        let mut row_index = 0;

        if self.header {
            total_rows = total_rows.map(|n| n.saturating_sub(1));
            match source.next_row().await? {
                RowRead::Row(mut header) => {
                    header.extend(self.header_columns());
                    sink.write_row(&header).await?;
                }
                RowRead::Malformed(message) => {
                    summary.row_errors += 1;
                    self.row_failed(row_index, message);
                    sink.write_row(&self.header_columns()).await?;
                }
                RowRead::End => {}
            }
        }

        loop {
            if cancel.is_cancelled() {
                tracing::info!(batch = %self.label, after = row_index, "batch cancelled");
                summary.cancelled = true;
                break;
            }

            let row = match source.next_row().await? {
                RowRead::End => break,
                RowRead::Malformed(message) => {
                    row_index += 1;
                    summary.rows_read += 1;
                    summary.row_errors += 1;
                    self.row_failed(row_index, message);
                    continue;
                }
                RowRead::Row(row) => row,
            };
            row_index += 1;
            summary.rows_read += 1;

            let outcome = processor.process(&row, row_index, total_rows).await;
            summary.failed_invocations += outcome.failed_invocations;
            sink.write_row(&outcome.row).await?;
            summary.rows_written += 1;
        }

        sink.finish().await?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{EchoPlugin, Plugin, PluginCall, PluginError, PluginMetadata, PluginOutcome};
    use crate::retry::{RetryPolicy, RetrySettings};
    use crate::rows::{VecRowSink, VecRowSource};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct AlwaysFails(PluginMetadata);

    #[async_trait::async_trait]
    impl Plugin for AlwaysFails {
        fn name(&self) -> &str {
            "broken"
        }

        fn metadata(&self) -> &PluginMetadata {
            &self.0
        }

        async fn invoke(&self, _call: &PluginCall) -> PluginOutcome {
            Err(PluginError::Failed("boom".into()))
        }
    }

    struct CancelOnFirst(PluginMetadata, CancelFlag);

    #[async_trait::async_trait]
    impl Plugin for CancelOnFirst {
        fn name(&self) -> &str {
            "cancel"
        }

        fn metadata(&self) -> &PluginMetadata {
            &self.0
        }

        async fn invoke(&self, call: &PluginCall) -> PluginOutcome {
            self.1.cancel();
            Ok(crate::plugin::PluginOutput::Text(call.entity.clone()))
        }
    }

    fn invoker() -> Arc<PluginInvoker> {
        Arc::new(PluginInvoker::new(
            Duration::from_secs(5),
            RetryPolicy::new(RetrySettings::default()),
        ))
    }

    fn ipv4() -> ParserDefinition {
        ParserDefinition::new("ipv4", r"\b\d{1,3}(?:\.\d{1,3}){3}\b", "ipv4").unwrap()
    }

    fn echo() -> PluginSelection {
        PluginSelection::new(vec![Arc::new(EchoPlugin::new()) as Arc<dyn Plugin>])
    }

    fn drain(rx: &mut mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn test_every_row_written_when_plugin_always_fails() {
        let offline = PluginMetadata::new("broken").with_network_facing(false);
        let plugin: Arc<dyn Plugin> = Arc::new(AlwaysFails(offline));
        let selection = PluginSelection::new(vec![plugin]);
        let dispatcher =
            BatchDispatcher::new("five", selection, invoker()).with_parser(Some(ipv4()));

        let mut source = VecRowSource::new((1..=5).map(|i| vec![format!("10.0.0.{i}")]));
        let mut sink = VecRowSink::new();
        let summary = dispatcher
            .run(&mut source, &mut sink, &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(sink.rows.len(), 5);
        assert!(sink.rows.iter().all(|row| row[1] == "boom"));
        assert_eq!(summary.rows_written, 5);
        assert_eq!(summary.failed_invocations, 5);
        assert!(!summary.cancelled);
    }

    #[tokio::test]
    async fn test_header_columns_named_by_type_and_plugin() {
        let (progress, mut rx) = ProgressSender::channel(64);
        let dispatcher = BatchDispatcher::new("hdr", echo(), invoker())
            .with_parser(Some(ipv4()))
            .with_header(true)
            .with_progress(progress);

        let mut source =
            VecRowSource::new(vec![vec!["address", "note"], vec!["1.2.3.4", "Comment"]]);
        let mut sink = VecRowSink::new();
        dispatcher
            .run(&mut source, &mut sink, &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(sink.rows[0], vec!["address", "note", "ipv4:echo"]);
        assert_eq!(sink.rows[1], vec!["1.2.3.4", "Comment", "1.2.3.4"]);

        let events = drain(&mut rx);
        assert_eq!(events[0].to_string(), "Processing echo on 1.2.3.4 (Line 1 of 1)");
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_malformed_header_reported_and_replaced() {
        let (progress, mut rx) = ProgressSender::channel(64);
        let dispatcher = BatchDispatcher::new("hdr", echo(), invoker())
            .with_parser(Some(ipv4()))
            .with_header(true)
            .with_progress(progress);

        let mut source = VecRowSource::from_records(vec![
            Err("invalid utf-8".to_string()),
            Ok(vec!["1.2.3.4".to_string()]),
        ]);
        let mut sink = VecRowSink::new();
        let summary = dispatcher
            .run(&mut source, &mut sink, &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(summary.row_errors, 1);
        assert_eq!(summary.rows_written, 1);
        assert_eq!(sink.rows, vec![vec!["ipv4:echo"], vec!["1.2.3.4", "1.2.3.4"]]);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ProgressEvent::RowFailed { row_index: 0, .. })));
    }

    #[tokio::test]
    async fn test_legacy_header_uses_cell_type() {
        let dispatcher = BatchDispatcher::new("legacy", echo(), invoker());
        assert_eq!(dispatcher.header_columns(), vec!["cell:echo"]);
    }

    #[tokio::test]
    async fn test_malformed_rows_reported_and_skipped() {
        let (progress, mut rx) = ProgressSender::channel(64);
        let dispatcher = BatchDispatcher::new("bad", echo(), invoker())
            .with_parser(Some(ipv4()))
            .with_progress(progress);

        let mut source = VecRowSource::from_records(vec![
            Ok(vec!["1.1.1.1".to_string()]),
            Err("invalid utf-8".to_string()),
            Ok(vec!["2.2.2.2".to_string()]),
        ]);
        let mut sink = VecRowSink::new();
        let summary = dispatcher
            .run(&mut source, &mut sink, &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(summary.rows_read, 3);
        assert_eq!(summary.rows_written, 2);
        assert_eq!(summary.row_errors, 1);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ProgressEvent::RowFailed { row_index: 2, .. })));
    }

    #[tokio::test]
    async fn test_cancellation_finishes_row_in_flight() {
        let cancel = CancelFlag::new();
        let offline = PluginMetadata::new("cancel").with_network_facing(false);
        let selection = PluginSelection::new(vec![
            Arc::new(CancelOnFirst(offline, cancel.clone())) as Arc<dyn Plugin>
        ]);
        let (progress, mut rx) = ProgressSender::channel(64);
        let dispatcher = BatchDispatcher::new("stop", selection, invoker())
            .with_parser(Some(ipv4()))
            .with_progress(progress);

        let mut source = VecRowSource::new(vec![vec!["1.1.1.1"], vec!["2.2.2.2"], vec!["3.3.3.3"]]);
        let mut sink = VecRowSink::new();
        let summary = dispatcher.run(&mut source, &mut sink, &cancel).await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(sink.rows, vec![vec!["1.1.1.1", "1.1.1.1"]]);
        assert_eq!(
            drain(&mut rx).last(),
            Some(&ProgressEvent::BatchComplete {
                batch: Arc::from("stop"),
                rows_written: 1,
                cancelled: true,
            })
        );
    }

    #[tokio::test]
    async fn test_sink_failure_fails_batch() {
        let (progress, mut rx) = ProgressSender::channel(64);
        let dispatcher = BatchDispatcher::new("full", echo(), invoker()).with_progress(progress);

        let mut source = VecRowSource::new(vec![vec!["a"], vec!["b"]]);
        let mut sink = VecRowSink::failing_after(1);
        let result = dispatcher.run(&mut source, &mut sink, &CancelFlag::new()).await;

        assert!(matches!(result, Err(BatchIoError::Write(_))));
        assert!(matches!(
            drain(&mut rx).last(),
            Some(ProgressEvent::BatchFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_csv_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = BatchDispatcher::new("missing", echo(), invoker());

        let result = dispatcher
            .run_csv(
                &dir.path().join("missing.csv"),
                &dir.path().join("out.csv"),
                &CancelFlag::new(),
            )
            .await;

        assert!(matches!(result, Err(BatchIoError::Open { .. })));
        assert!(!dir.path().join("out.csv").exists());
    }
}
