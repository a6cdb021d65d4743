//! Flow-graph configuration service
//!
//! Stores the textual description of the processing graph and forwards every
//! description that parses to the acquisition worker. A description that
//! fails to parse is reported to the caller and changes nothing.

use crate::engine::Graph;
use crate::error::{AcqError, Result, ResultExt};
use crate::worker::AcquisitionWorker;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Receiver of validated graphs
pub trait GraphSink: Send + Sync {
    fn set_graph(&self, graph: Graph);
}

impl GraphSink for AcquisitionWorker {
    fn set_graph(&self, graph: Graph) {
        AcquisitionWorker::set_graph(self, graph);
    }
}

impl<T: GraphSink + ?Sized> GraphSink for Arc<T> {
    fn set_graph(&self, graph: Graph) {
        (**self).set_graph(graph);
    }
}

/// Holds the current graph description
pub struct FlowGraphService<S: GraphSink> {
    sink: S,
    description: Mutex<String>,
}

impl<S: GraphSink> FlowGraphService<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            description: Mutex::new(String::new()),
        }
    }

    /// Create the service and install `description` right away
    pub fn with_initial(sink: S, description: &str) -> Result<Self> {
        let service = Self::new(sink);
        service.set_description(description)?;
        Ok(service)
    }

    /// Parse `description` and forward it to the worker
    ///
    /// The lock is held until the worker has the graph, so the stored text
    /// always names the graph forwarded last.
    pub fn set_description(&self, description: &str) -> Result<()> {
        let mut current = self
            .description
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let graph = Graph::from_description(description)?;
        *current = description.to_string();
        tracing::info!("Flow graph updated ({} blocks)", graph.blocks().len());
        self.sink.set_graph(graph);
        Ok(())
    }

    /// Text of the last accepted description
    pub fn description(&self) -> String {
        self.description
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Read a description from `path` and install it
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            AcqError::GraphDescription(format!("Failed to read {:?}: {}", path, e))
        })?;
        self.set_description(&text)
            .with_context(|| format!("Invalid flow graph in {:?}", path))
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Default)]
    struct RecordingSink {
        graphs: Mutex<Vec<Graph>>,
    }

    impl GraphSink for RecordingSink {
        fn set_graph(&self, graph: Graph) {
            self.graphs.lock().unwrap().push(graph);
        }
    }

    const GRAPH: &str = r#"
[[blocks]]
name = "sink"
type = "DataSink<float>"

[blocks.settings]
signal_name = "A"
"#;

    #[test]
    fn test_valid_description_forwarded() {
        let service = FlowGraphService::new(RecordingSink::default());
        service.set_description(GRAPH).unwrap();
        assert_eq!(service.description(), GRAPH);
        assert_eq!(service.sink().graphs.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_description_changes_nothing() {
        let service = FlowGraphService::with_initial(RecordingSink::default(), GRAPH).unwrap();
        let err = service.set_description("[[blocks]]\nname = 3").unwrap_err();
        assert!(err.is_graph_description());
        assert_eq!(service.description(), GRAPH);
        assert_eq!(service.sink().graphs.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_with_initial_rejects_invalid() {
        assert!(FlowGraphService::with_initial(RecordingSink::default(), "not toml [").is_err());
    }

    #[test]
    fn test_shared_sink() {
        let sink = Arc::new(RecordingSink::default());
        let service = FlowGraphService::new(Arc::clone(&sink));
        service.set_description(GRAPH).unwrap();
        assert_eq!(sink.graphs.lock().unwrap().len(), 1);
    }

    /// Records the description stored at the time each graph arrives
    struct SnoopingSink {
        service: Mutex<Option<Arc<FlowGraphService<Arc<SnoopingSink>>>>>,
        forwarded: Mutex<Vec<(usize, bool)>>,
    }

    impl GraphSink for SnoopingSink {
        fn set_graph(&self, graph: Graph) {
            // another setter must not be able to store in between
            let locked = self
                .service
                .lock()
                .unwrap()
                .as_ref()
                .map(|service| service.description.try_lock().is_err())
                .unwrap_or(false);
            std::thread::sleep(std::time::Duration::from_millis(2));
            self.forwarded
                .lock()
                .unwrap()
                .push((graph.blocks().len(), locked));
        }
    }

    fn blocks(n: usize) -> String {
        (0..n)
            .map(|i| format!("[[blocks]]\nname = \"s{}\"\ntype = \"DataSink<float>\"\n", i))
            .collect()
    }

    #[test]
    fn test_concurrent_setters_keep_description_and_graph_in_step() {
        let sink = Arc::new(SnoopingSink {
            service: Mutex::new(None),
            forwarded: Mutex::new(Vec::new()),
        });
        let service = Arc::new(FlowGraphService::new(Arc::clone(&sink)));
        *sink.service.lock().unwrap() = Some(Arc::clone(&service));

        let threads: Vec<_> = (1..=8)
            .map(|n| {
                let service = Arc::clone(&service);
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        service.set_description(&blocks(n)).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let forwarded = sink.forwarded.lock().unwrap();
        assert_eq!(forwarded.len(), 40);
        assert!(forwarded.iter().all(|(_, locked)| *locked));
        let last = forwarded.last().unwrap().0;
        assert_eq!(service.description(), blocks(last));
        *sink.service.lock().unwrap() = None;
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(GRAPH.as_bytes()).unwrap();

        let service = FlowGraphService::new(RecordingSink::default());
        service.load_file(file.path()).unwrap();
        assert_eq!(service.description(), GRAPH);

        let err = service.load_file("/nonexistent/graph.toml").unwrap_err();
        assert!(err.is_graph_description());
    }
}
