//! Per-provider kernel registry.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use tracing::debug;

use crate::error::{CoreError, Result};
use crate::graph::OpNode;
use crate::kernel::KernelFactory;
use crate::types::{AttributeValue, DataType};

/// Signature a kernel is registered under.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelDef {
    op_type: String,
    type_constraints: BTreeSet<DataType>,
    attribute_constraints: BTreeMap<String, AttributeValue>,
}

impl KernelDef {
    /// A definition matching every node of `op_type`.
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            type_constraints: BTreeSet::new(),
            attribute_constraints: BTreeMap::new(),
        }
    }

    /// Restrict input element types to `types`.
    pub fn type_constraint(mut self, types: impl IntoIterator<Item = DataType>) -> Self {
        self.type_constraints.extend(types);
        self
    }

    /// Require the node attribute `key` to equal `value`.
    pub fn attribute(mut self, key: impl Into<String>, value: AttributeValue) -> Self {
        self.attribute_constraints.insert(key.into(), value);
        self
    }

    /// Operation type.
    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    /// Allowed input element types; empty means any.
    pub fn type_constraints(&self) -> &BTreeSet<DataType> {
        &self.type_constraints
    }

    /// Required attribute values.
    pub fn attribute_constraints(&self) -> &BTreeMap<String, AttributeValue> {
        &self.attribute_constraints
    }

    /// Whether a node with the given input types satisfies this definition.
    pub fn matches(&self, node: &OpNode, input_types: &[DataType]) -> bool {
        node.op_type == self.op_type
            && (self.type_constraints.is_empty()
                || input_types.iter().all(|t| self.type_constraints.contains(t)))
            && self
                .attribute_constraints
                .iter()
                .all(|(k, v)| node.attributes.get(k) == Some(v))
    }
}

impl fmt::Display for KernelDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op_type)?;
        if !self.type_constraints.is_empty() {
            let types: Vec<String> = self.type_constraints.iter().map(|t| t.to_string()).collect();
            write!(f, "[{}]", types.join(","))?;
        }
        if !self.attribute_constraints.is_empty() {
            let keys: Vec<&str> = self.attribute_constraints.keys().map(String::as_str).collect();
            write!(f, "{{{}}}", keys.join(","))?;
        }
        Ok(())
    }
}

struct Entry {
    def: KernelDef,
    factory: KernelFactory,
    seq: usize,
}

impl Entry {
    // Higher is more specific.
    fn specificity(&self) -> (Reverse<usize>, usize, usize) {
        let types = match self.def.type_constraints.len() {
            0 => usize::MAX,
            n => n,
        };
        (Reverse(types), self.def.attribute_constraints.len(), self.seq)
    }
}

/// Maps operation signatures to kernel factories for one provider.
///
/// Resolution picks, among all definitions matching a node, the most specific
/// one:
///
/// 1. a smaller non-empty type-constraint set beats a larger one, and any
///    non-empty set beats an empty (unconstrained) one;
/// 2. then more attribute constraints beat fewer;
/// 3. then the later registration wins.
#[derive(Default)]
pub struct KernelRegistry {
    entries: HashMap<String, Vec<Entry>>,
    next_seq: usize,
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRegistry")
            .field("kernels", &self.len())
            .field("op_types", &self.op_types())
            .finish()
    }
}

impl KernelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kernel factory.
    ///
    /// Fails with [`CoreError::DuplicateKernel`] if an identical definition is
    /// already present.
    pub fn register(&mut self, def: KernelDef, factory: KernelFactory) -> Result<()> {
        let bucket = self.entries.entry(def.op_type.clone()).or_default();
        if bucket.iter().any(|e| e.def == def) {
            return Err(CoreError::DuplicateKernel(def.to_string()));
        }
        debug!(kernel = %def, "Registered kernel");
        bucket.push(Entry {
            def,
            factory,
            seq: self.next_seq,
        });
        self.next_seq += 1;
        Ok(())
    }

    /// Find the most specific kernel for a node.
    pub fn resolve(
        &self,
        node: &OpNode,
        input_types: &[DataType],
    ) -> Option<(&KernelDef, KernelFactory)> {
        self.entries
            .get(&node.op_type)?
            .iter()
            .filter(|e| e.def.matches(node, input_types))
            .max_by_key(|e| e.specificity())
            .map(|e| (&e.def, e.factory.clone()))
    }

    /// Whether any kernel is registered for `op_type`.
    pub fn supports(&self, op_type: &str) -> bool {
        self.entries.get(op_type).is_some_and(|b| !b.is_empty())
    }

    /// Registered op types, sorted.
    pub fn op_types(&self) -> Vec<&str> {
        let mut ops: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        ops.sort_unstable();
        ops
    }

    /// All registered definitions in registration order.
    pub fn definitions(&self) -> Vec<&KernelDef> {
        let mut all: Vec<&Entry> = self.entries.values().flatten().collect();
        all.sort_by_key(|e| e.seq);
        all.into_iter().map(|e| &e.def).collect()
    }

    /// Number of registered kernels.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Whether no kernels are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kernel::{kernel_factory, Kernel, KernelContext, KernelCreateInfo};

    struct Tagged(&'static str);

    impl Kernel for Tagged {
        fn infer_output_shapes(&self, s: &[&[usize]]) -> anyhow::Result<Vec<Vec<usize>>> {
            Ok(s.iter().map(|d| d.to_vec()).collect())
        }

        fn compute(&self, _: &mut KernelContext<'_>) -> anyhow::Result<()> {
            anyhow::bail!("{}", self.0)
        }
    }

    fn tagged(tag: &'static str) -> KernelFactory {
        kernel_factory(move |_: &KernelCreateInfo<'_>| Ok(Arc::new(Tagged(tag)) as Arc<dyn Kernel>))
    }

    fn node(op: &str, attrs: &[(&str, AttributeValue)]) -> OpNode {
        OpNode {
            index: 0,
            name: "n".into(),
            op_type: op.into(),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            inputs: vec![],
            outputs: vec![],
        }
    }

    fn winner(reg: &KernelRegistry, n: &OpNode, types: &[DataType]) -> String {
        let (def, _) = reg.resolve(n, types).expect("kernel");
        def.to_string()
    }

    #[test]
    fn test_duplicate_definition_rejected() {
        let mut reg = KernelRegistry::new();
        let def = KernelDef::new("Add").type_constraint([DataType::F32]);
        reg.register(def.clone(), tagged("a")).unwrap();
        let err = reg.register(def, tagged("b")).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateKernel(_)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_specific_type_set_wins() {
        let mut reg = KernelRegistry::new();
        reg.register(KernelDef::new("Add"), tagged("any")).unwrap();
        reg.register(
            KernelDef::new("Add").type_constraint([DataType::F32]),
            tagged("f32"),
        )
        .unwrap();
        reg.register(
            KernelDef::new("Add").type_constraint([DataType::F32, DataType::F64]),
            tagged("float"),
        )
        .unwrap();

        let n = node("Add", &[]);
        assert_eq!(winner(&reg, &n, &[DataType::F32, DataType::F32]), "Add[F32]");
        assert_eq!(winner(&reg, &n, &[DataType::F64]), "Add[F32,F64]");
        assert_eq!(winner(&reg, &n, &[DataType::I32]), "Add");
    }

    #[test]
    fn test_attribute_constraints_break_ties() {
        let mut reg = KernelRegistry::new();
        reg.register(KernelDef::new("Conv"), tagged("generic")).unwrap();
        reg.register(
            KernelDef::new("Conv").attribute("group", AttributeValue::Int(1)),
            tagged("dense"),
        )
        .unwrap();

        let dense = node("Conv", &[("group", AttributeValue::Int(1))]);
        let grouped = node("Conv", &[("group", AttributeValue::Int(4))]);
        assert_eq!(winner(&reg, &dense, &[]), "Conv{group}");
        assert_eq!(winner(&reg, &grouped, &[]), "Conv");
    }

    #[test]
    fn test_later_registration_wins_equal_specificity() {
        let mut reg = KernelRegistry::new();
        reg.register(
            KernelDef::new("Relu").attribute("a", AttributeValue::Int(0)),
            tagged("first"),
        )
        .unwrap();
        reg.register(
            KernelDef::new("Relu").attribute("b", AttributeValue::Int(0)),
            tagged("second"),
        )
        .unwrap();
        let n = node(
            "Relu",
            &[("a", AttributeValue::Int(0)), ("b", AttributeValue::Int(0))],
        );
        assert_eq!(winner(&reg, &n, &[]), "Relu{b}");
    }

    #[test]
    fn test_unknown_op_unresolved() {
        let mut reg = KernelRegistry::new();
        reg.register(
            KernelDef::new("Add").type_constraint([DataType::F32]),
            tagged("f32"),
        )
        .unwrap();
        assert!(reg.resolve(&node("Mul", &[]), &[DataType::F32]).is_none());
        assert!(reg.resolve(&node("Add", &[]), &[DataType::I64]).is_none());
        assert!(reg.supports("Add"));
        assert_eq!(reg.op_types(), vec!["Add"]);
    }
}
