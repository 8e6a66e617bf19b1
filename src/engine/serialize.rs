use super::Engine;
use crate::{cell::CellKind, types::CellIndex};
use serde::Serialize;

/// One node of the structural dump produced by [`Engine::to_json`].
#[derive(Debug, Serialize)]
struct NodeRecord {
    index: CellIndex,
    #[serde(rename = "type")]
    kind: CellKind,
    value: serde_json::Value,
    dependencies: Vec<CellIndex>,
}

impl Engine {
    /// Render the graph structure as JSON: one record per node with its
    /// index, kind, current value (the last computed value for function
    /// cells, `null` if none yet), and dependency indices.
    ///
    /// Function closures are not serialized; the format is for inspection
    /// and testing, not for reconstruction.
    #[must_use]
    pub fn to_json(&self) -> String {
        let mut records: Vec<NodeRecord> = self
            .inner
            .nodes
            .iter()
            .map(|entry| {
                let node = entry.value();
                NodeRecord {
                    index: node.index(),
                    kind: node.kind(),
                    value: node.value_json().unwrap_or(serde_json::Value::Null),
                    dependencies: node.dependencies(),
                }
            })
            .collect();
        records.sort_by_key(|record| record.index);
        serde_json::to_string(&records).expect("Engine::to_json: record serialization")
    }
}

#[cfg(test)]
mod tests {
    use crate::{engine::Engine, types::BoxError};

    #[tokio::test]
    async fn to_json_renders_structure_and_input_values() {
        let engine = Engine::new();
        let a = engine.add_input(2_i64).unwrap();
        let b = engine.add_input(3_i64).unwrap();
        let s = engine
            .add_function(&[a, b], |v: Vec<i64>| async move {
                Ok::<_, BoxError>(v[0] * v[1])
            })
            .unwrap();

        let dump: serde_json::Value = serde_json::from_str(&engine.to_json()).unwrap();
        let records = dump.as_array().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["type"], "Input");
        assert_eq!(records[0]["value"], 2);
        assert_eq!(records[2]["type"], "Function");
        // Not computed yet: function value serializes as null.
        assert_eq!(records[2]["value"], serde_json::Value::Null);
        assert_eq!(records[2]["dependencies"], serde_json::json!([0, 1]));

        assert_eq!(engine.get_result(s).await.unwrap(), 6);
        let dump: serde_json::Value = serde_json::from_str(&engine.to_json()).unwrap();
        assert_eq!(dump[2]["value"], 6);
    }
}
