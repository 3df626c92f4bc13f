//! Graph representation, construction and validation.
//!
//! A [`Graph`] is an ordered list of [`OpNode`]s over a table of typed values.
//! Node order is the execution order: every node input must be a graph input or
//! the output of an earlier node. [`GraphBuilder`] is the only way to build one
//! by hand; graphs that arrive through serde are re-validated by
//! [`Graph::validate`] when a session loads them.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::types::{AttributeValue, DataType, NodeId, Shape, ValueId};

/// Module attribute naming an embedded native-code module.
pub const NATIVE_MODULE_ATTR: &str = "tessera.native_module";

/// Op type bound to a symbol of the native-code module.
pub const NATIVE_KERNEL_OP: &str = "NativeKernel";

/// A typed value flowing between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueInfo {
    /// Index into the value table.
    pub id: ValueId,
    /// Unique name.
    pub name: String,
    /// Element type.
    pub dtype: DataType,
    /// Declared shape.
    pub shape: Shape,
}

/// One operation in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpNode {
    /// Position in the node list.
    pub index: NodeId,
    /// Node name.
    pub name: String,
    /// Operation type, e.g. `"Add"`.
    pub op_type: String,
    /// Attributes by key.
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Input values in operand order.
    pub inputs: Vec<ValueId>,
    /// Output values.
    pub outputs: Vec<ValueId>,
}

impl OpNode {
    /// Look up an attribute.
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }
}

/// A validated dataflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    nodes: Vec<OpNode>,
    values: Vec<ValueInfo>,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
    attributes: BTreeMap<String, AttributeValue>,
}

impl Graph {
    /// Nodes in execution order.
    pub fn nodes(&self) -> &[OpNode] {
        &self.nodes
    }

    /// The value table.
    pub fn values(&self) -> &[ValueInfo] {
        &self.values
    }

    /// Get a node by index.
    pub fn node(&self, id: NodeId) -> Option<&OpNode> {
        self.nodes.get(id)
    }

    /// Get a value by id.
    pub fn value(&self, id: ValueId) -> Option<&ValueInfo> {
        self.values.get(id)
    }

    /// Find a value by name.
    pub fn value_by_name(&self, name: &str) -> Option<&ValueInfo> {
        self.values.iter().find(|v| v.name == name)
    }

    /// Graph input value ids.
    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    /// Graph output value ids.
    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    /// Module-level attributes.
    pub fn attributes(&self) -> &BTreeMap<String, AttributeValue> {
        &self.attributes
    }

    /// Whether `value` is a graph input.
    pub fn is_input(&self, value: ValueId) -> bool {
        self.inputs.contains(&value)
    }

    /// Whether `value` is a graph output.
    pub fn is_output(&self, value: ValueId) -> bool {
        self.outputs.contains(&value)
    }

    /// Element types of a node's inputs.
    pub fn input_types(&self, node: &OpNode) -> Vec<DataType> {
        node.inputs.iter().map(|&v| self.values[v].dtype).collect()
    }

    /// Element types of a node's outputs.
    pub fn output_types(&self, node: &OpNode) -> Vec<DataType> {
        node.outputs.iter().map(|&v| self.values[v].dtype).collect()
    }

    /// Index of the node producing each value (`None` for graph inputs).
    pub fn producers(&self) -> Vec<Option<NodeId>> {
        let mut producers = vec![None; self.values.len()];
        for node in &self.nodes {
            for &out in &node.outputs {
                producers[out] = Some(node.index);
            }
        }
        producers
    }

    /// Check the structural invariants.
    ///
    /// Fails with [`CoreError::InvalidArgument`] if any reference is out of
    /// range, a value is produced twice, a graph input is produced by a node,
    /// a node reads a value not yet available, or a graph output is never
    /// produced.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(CoreError::InvalidArgument(msg));

        let mut names = HashMap::with_capacity(self.values.len());
        for (i, value) in self.values.iter().enumerate() {
            if value.id != i {
                return invalid(format!("value '{}' has id {} at index {}", value.name, value.id, i));
            }
            if names.insert(value.name.as_str(), i).is_some() {
                return invalid(format!("duplicate value name '{}'", value.name));
            }
        }

        let mut available = vec![false; self.values.len()];
        for &input in &self.inputs {
            if input >= self.values.len() {
                return invalid(format!("graph input {input} is out of range"));
            }
            available[input] = true;
        }

        for (i, node) in self.nodes.iter().enumerate() {
            if node.index != i {
                return invalid(format!("node '{}' has index {} at position {}", node.name, node.index, i));
            }
            for &input in &node.inputs {
                match available.get(input).copied() {
                    None => {
                        return invalid(format!("node '{}' reads unknown value {}", node.name, input))
                    }
                    Some(false) => {
                        return invalid(format!(
                            "node '{}' reads '{}' before it is produced",
                            node.name, self.values[input].name
                        ))
                    }
                    Some(true) => {}
                }
            }
            for &output in &node.outputs {
                match available.get(output).copied() {
                    None => {
                        return invalid(format!("node '{}' writes unknown value {}", node.name, output))
                    }
                    Some(true) if self.is_input(output) => {
                        return invalid(format!(
                            "node '{}' produces graph input '{}'",
                            node.name, self.values[output].name
                        ))
                    }
                    Some(true) => {
                        return invalid(format!(
                            "value '{}' is produced more than once",
                            self.values[output].name
                        ))
                    }
                    Some(false) => available[output] = true,
                }
            }
        }

        for &output in &self.outputs {
            if !available.get(output).copied().unwrap_or(false) {
                let name = self.values.get(output).map_or("<unknown>", |v| v.name.as_str());
                return invalid(format!("graph output '{name}' is never produced"));
            }
        }

        debug!(
            nodes = self.nodes.len(),
            values = self.values.len(),
            "Graph validated"
        );
        Ok(())
    }
}

/// Incremental, name-based graph construction.
///
/// ```rust
/// use tessera_core::{DataType, GraphBuilder, Shape};
///
/// let mut b = GraphBuilder::new();
/// b.add_input("a", DataType::F32, Shape::fixed([2]))?;
/// b.add_input("b", DataType::F32, Shape::fixed([2]))?;
/// b.add_value("sum", DataType::F32, Shape::fixed([2]))?;
/// b.add_node("add0", "Add", &["a", "b"], &["sum"])?;
/// b.add_output("sum")?;
/// let graph = b.build()?;
/// assert_eq!(graph.nodes().len(), 1);
/// # Ok::<(), tessera_core::CoreError>(())
/// ```
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<OpNode>,
    values: Vec<ValueInfo>,
    names: HashMap<String, ValueId>,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
    attributes: BTreeMap<String, AttributeValue>,
}

impl GraphBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a graph input.
    pub fn add_input(&mut self, name: &str, dtype: DataType, shape: Shape) -> Result<ValueId> {
        let id = self.add_value(name, dtype, shape)?;
        self.inputs.push(id);
        Ok(id)
    }

    /// Declare an intermediate or output value.
    pub fn add_value(&mut self, name: &str, dtype: DataType, shape: Shape) -> Result<ValueId> {
        if self.names.contains_key(name) {
            return Err(CoreError::invalid_argument(format!(
                "value '{name}' is already declared"
            )));
        }
        let id = self.values.len();
        self.values.push(ValueInfo {
            id,
            name: name.to_string(),
            dtype,
            shape,
        });
        self.names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Append a node reading and writing the named values.
    pub fn add_node(
        &mut self,
        name: &str,
        op_type: &str,
        inputs: &[&str],
        outputs: &[&str],
    ) -> Result<NodeId> {
        let inputs = inputs
            .iter()
            .map(|n| self.lookup(n))
            .collect::<Result<Vec<_>>>()?;
        let outputs = outputs
            .iter()
            .map(|n| self.lookup(n))
            .collect::<Result<Vec<_>>>()?;
        let index = self.nodes.len();
        self.nodes.push(OpNode {
            index,
            name: name.to_string(),
            op_type: op_type.to_string(),
            attributes: BTreeMap::new(),
            inputs,
            outputs,
        });
        Ok(index)
    }

    /// Set a node attribute. Keys may only be set once.
    pub fn set_attribute(&mut self, node: NodeId, key: &str, value: AttributeValue) -> Result<()> {
        let op = self
            .nodes
            .get_mut(node)
            .ok_or_else(|| CoreError::invalid_argument(format!("unknown node {node}")))?;
        if op.attributes.contains_key(key) {
            return Err(CoreError::invalid_argument(format!(
                "attribute '{}' is already set on node '{}'",
                key, op.name
            )));
        }
        op.attributes.insert(key.to_string(), value);
        Ok(())
    }

    /// Mark a declared value as a graph output.
    pub fn add_output(&mut self, name: &str) -> Result<()> {
        let id = self.lookup(name)?;
        if !self.outputs.contains(&id) {
            self.outputs.push(id);
        }
        Ok(())
    }

    /// Set a module-level attribute, replacing any previous value.
    pub fn set_module_attribute(&mut self, key: &str, value: AttributeValue) {
        self.attributes.insert(key.to_string(), value);
    }

    /// Finish and validate the graph.
    pub fn build(self) -> Result<Graph> {
        let graph = Graph {
            nodes: self.nodes,
            values: self.values,
            inputs: self.inputs,
            outputs: self.outputs,
            attributes: self.attributes,
        };
        graph.validate()?;
        Ok(graph)
    }

    fn lookup(&self, name: &str) -> Result<ValueId> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| CoreError::invalid_argument(format!("unknown value '{name}'")))
    }
}

/// Compiler output handed to a session: a graph plus optional native code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    graph: Graph,
}

impl Artifact {
    /// Wrap a graph.
    pub fn new(graph: Graph) -> Self {
        Self { graph }
    }

    /// Attach a native-code module by path.
    pub fn with_native_module(mut self, path: impl AsRef<Path>) -> Self {
        self.graph.attributes.insert(
            NATIVE_MODULE_ATTR.to_string(),
            AttributeValue::String(path.as_ref().to_string_lossy().into_owned()),
        );
        self
    }

    /// The graph.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Path of the attached native-code module, if any.
    pub fn native_module(&self) -> Option<&str> {
        self.graph
            .attributes
            .get(NATIVE_MODULE_ATTR)
            .and_then(AttributeValue::as_str)
    }

    /// Unwrap into the graph.
    pub fn into_graph(self) -> Graph {
        self.graph
    }
}

impl From<Graph> for Artifact {
    fn from(graph: Graph) -> Self {
        Self::new(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_2() -> Shape {
        Shape::fixed([2])
    }

    #[test]
    fn test_build_valid_chain() {
        let mut b = GraphBuilder::new();
        b.add_input("a", DataType::F32, f32_2()).unwrap();
        b.add_value("t", DataType::F32, f32_2()).unwrap();
        b.add_value("out", DataType::F32, f32_2()).unwrap();
        b.add_node("n0", "Relu", &["a"], &["t"]).unwrap();
        b.add_node("n1", "Neg", &["t"], &["out"]).unwrap();
        b.add_output("out").unwrap();
        let graph = b.build().unwrap();

        assert_eq!(graph.producers(), vec![None, Some(0), Some(1)]);
        assert_eq!(graph.input_types(&graph.nodes()[1]), vec![DataType::F32]);
    }

    #[test]
    fn test_use_before_definition_rejected() {
        let mut b = GraphBuilder::new();
        b.add_input("a", DataType::F32, f32_2()).unwrap();
        b.add_value("t", DataType::F32, f32_2()).unwrap();
        b.add_value("out", DataType::F32, f32_2()).unwrap();
        b.add_node("n0", "Neg", &["t"], &["out"]).unwrap();
        b.add_node("n1", "Relu", &["a"], &["t"]).unwrap();
        b.add_output("out").unwrap();
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("before it is produced"));
    }

    #[test]
    fn test_double_production_rejected() {
        let mut b = GraphBuilder::new();
        b.add_input("a", DataType::F32, f32_2()).unwrap();
        b.add_value("t", DataType::F32, f32_2()).unwrap();
        b.add_node("n0", "Relu", &["a"], &["t"]).unwrap();
        b.add_node("n1", "Neg", &["a"], &["t"]).unwrap();
        b.add_output("t").unwrap();
        assert!(matches!(b.build(), Err(CoreError::InvalidArgument(_))));
    }

    #[test]
    fn test_producing_graph_input_rejected() {
        let mut b = GraphBuilder::new();
        b.add_input("a", DataType::F32, f32_2()).unwrap();
        b.add_input("b", DataType::F32, f32_2()).unwrap();
        b.add_node("n0", "Relu", &["a"], &["b"]).unwrap();
        b.add_output("b").unwrap();
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("produces graph input"));
    }

    #[test]
    fn test_unproduced_output_rejected() {
        let mut b = GraphBuilder::new();
        b.add_input("a", DataType::F32, f32_2()).unwrap();
        b.add_value("dangling", DataType::F32, f32_2()).unwrap();
        b.add_output("dangling").unwrap();
        assert!(b.build().is_err());
    }

    #[test]
    fn test_duplicate_attribute_rejected() {
        let mut b = GraphBuilder::new();
        b.add_input("a", DataType::F32, f32_2()).unwrap();
        b.add_value("t", DataType::F32, f32_2()).unwrap();
        let n = b.add_node("n0", "Relu", &["a"], &["t"]).unwrap();
        b.set_attribute(n, "alpha", AttributeValue::Float(0.1)).unwrap();
        let err = b
            .set_attribute(n, "alpha", AttributeValue::Float(0.2))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[test]
    fn test_duplicate_value_name_rejected() {
        let mut b = GraphBuilder::new();
        b.add_input("a", DataType::F32, f32_2()).unwrap();
        assert!(b.add_value("a", DataType::F32, f32_2()).is_err());
        assert!(b.add_node("n0", "Relu", &["missing"], &["a"]).is_err());
    }

    #[test]
    fn test_artifact_native_module() {
        let mut b = GraphBuilder::new();
        b.add_input("a", DataType::F32, f32_2()).unwrap();
        b.add_output("a").unwrap();
        let artifact = Artifact::new(b.build().unwrap());
        assert_eq!(artifact.native_module(), None);

        let artifact = artifact.with_native_module("/tmp/libkernels.so");
        assert_eq!(artifact.native_module(), Some("/tmp/libkernels.so"));
    }
}
