//! Graph construction, validation and serialization tests.

use anyhow::Result;
use tessera_core::{
    AttributeValue, CoreError, DataType, Dim, Graph, GraphBuilder, Shape, StatusCode,
    NATIVE_MODULE_ATTR,
};

fn add_mul_graph() -> Result<Graph> {
    let shape = Shape::fixed([2]);
    let mut b = GraphBuilder::new();
    b.add_input("a", DataType::F32, shape.clone())?;
    b.add_input("b", DataType::F32, shape.clone())?;
    b.add_input("c", DataType::F32, shape.clone())?;
    b.add_value("t", DataType::F32, shape.clone())?;
    b.add_value("out", DataType::F32, shape)?;
    b.add_node("add", "Add", &["a", "b"], &["t"])?;
    b.add_node("mul", "Mul", &["t", "c"], &["out"])?;
    b.add_output("out")?;
    Ok(b.build()?)
}

// ============================================================================
// Structure
// ============================================================================

#[test]
fn test_node_order_and_lookup() -> Result<()> {
    let graph = add_mul_graph()?;

    assert_eq!(graph.nodes().len(), 2);
    assert_eq!(graph.inputs().len(), 3);
    assert_eq!(graph.outputs().len(), 1);

    let t = graph.value_by_name("t").expect("t");
    assert_eq!(graph.producers()[t.id], Some(0));
    assert!(graph.node(1).expect("mul").inputs.contains(&t.id));
    assert!(!graph.is_input(t.id));
    Ok(())
}

#[test]
fn test_graph_input_may_be_output() -> Result<()> {
    let mut b = GraphBuilder::new();
    b.add_input("x", DataType::I64, Shape(vec![Dim::Symbolic("N".into())]))?;
    b.add_output("x")?;
    let graph = b.build()?;
    assert!(graph.nodes().is_empty());
    assert!(graph.is_output(graph.inputs()[0]));
    Ok(())
}

#[test]
fn test_module_attributes() -> Result<()> {
    let mut b = GraphBuilder::new();
    b.add_input("x", DataType::F32, Shape::fixed([1]))?;
    b.add_output("x")?;
    b.set_module_attribute("producer", AttributeValue::String("tessera-compiler".into()));
    b.set_module_attribute(NATIVE_MODULE_ATTR, AttributeValue::String("libk.so".into()));
    let graph = b.build()?;
    assert_eq!(graph.attributes().len(), 2);
    Ok(())
}

// ============================================================================
// Validation of deserialized graphs
// ============================================================================

#[test]
fn test_serialized_graph_revalidates() -> Result<()> {
    let graph = add_mul_graph()?;
    let json = serde_json::to_string(&graph)?;
    let back: Graph = serde_json::from_str(&json)?;
    back.validate()?;
    assert_eq!(back, graph);
    Ok(())
}

#[test]
fn test_tampered_graph_rejected() -> Result<()> {
    let graph = add_mul_graph()?;
    let mut json: serde_json::Value = serde_json::to_value(&graph)?;

    // Swap the two nodes so "mul" reads "t" before "add" produces it.
    let nodes = json["nodes"].as_array_mut().expect("nodes");
    nodes.swap(0, 1);
    nodes[0]["index"] = 0.into();
    nodes[1]["index"] = 1.into();

    let tampered: Graph = serde_json::from_value(json)?;
    let err = tampered.validate().unwrap_err();
    assert_eq!(err.code(), StatusCode::InvalidArgument);
    assert!(matches!(err, CoreError::InvalidArgument(ref m) if m.contains("before it is produced")));
    Ok(())
}
