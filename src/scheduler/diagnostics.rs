use std::collections::HashMap;
use std::fmt::Write;

use petgraph::graph::{DiGraph, NodeIndex};

use super::{RunInfo, TaskExecution};
use crate::task::TaskKey;

impl RunInfo {
    /// Renders the recomputed tasks as a Mermaid diagram, color-coded by
    /// execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    pub fn render_mermaid(&self) -> String {
        let mut graph = DiGraph::<(&TaskKey, &TaskExecution), ()>::new();
        let mut indices: HashMap<&TaskKey, NodeIndex> = HashMap::new();

        let mut nodes: Vec<_> = self.executions.iter().collect();
        nodes.sort_by_key(|(key, _)| *key);
        for (key, exec) in nodes {
            indices.insert(key, graph.add_node((key, exec)));
        }
        for (source, target) in &self.edges {
            if let (Some(&a), Some(&b)) = (indices.get(source), indices.get(target)) {
                graph.add_edge(a, b, ());
            }
        }

        let mut f = String::new();
        writeln!(f, "graph LR").unwrap();

        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for t in self.executions.values() {
            let secs = t.duration.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            min_time = 0.0;
            max_time = 0.0;
        }

        // Avoid divide by zero if all tasks took same time
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for index in graph.node_indices() {
            let (key, exec) = graph[index];
            let name = key.store.file_name().unwrap_or(key.store.as_str());
            let args = key.key.as_str().replace('"', "#quot;");

            let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);

            // 0.0 (Green) -> 0.5 (Yellow) -> 1.0 (Red)
            let (r, g, b) = if t < 0.5 {
                ((255.0 * t * 2.0) as u8, 255, 0)
            } else {
                (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
            };

            writeln!(
                f,
                "    {}[\"{}\\n{}\\n{:.2?}\"]",
                index.index(),
                name,
                args,
                exec.duration
            )
            .unwrap();
            writeln!(f, "    style {} fill:#{r:02X}{g:02X}{b:02X}", index.index()).unwrap();
        }

        for edge in graph.edge_indices() {
            if let Some((source, target)) = graph.edge_endpoints(edge) {
                writeln!(f, "    {} --> {}", source.index(), target.index()).unwrap();
            }
        }

        f
    }
}
