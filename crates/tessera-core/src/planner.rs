//! Static memory planning.
//!
//! The planner walks the graph once in execution order and assigns every
//! statically shaped intermediate value an offset in its provider's arena.
//! Storage is reused as soon as a value's last consumer has run:
//!
//! - outputs of node `i` take the smallest free range that fits (ties go to the
//!   lowest offset), splitting off the remainder, or grow the arena;
//! - after node `i`, every value whose last use is `i` is released and adjacent
//!   free ranges coalesce.
//!
//! Graph inputs are bound to caller memory, and graph outputs and symbolically
//! shaped values are allocated individually at run time.

use std::fmt;

use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::graph::Graph;
use crate::provider::AllocatorConstraints;
use crate::types::{checked_byte_size, NodeId, ValueId};

/// Where a value's storage comes from at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Borrowed from the caller's input tensor.
    GraphInput,
    /// Allocated on its own from the producing provider's allocator.
    Standalone,
    /// A slice of a provider arena.
    Arena {
        /// Arena index (the provider slot).
        arena: usize,
        /// Byte offset inside the arena.
        offset: usize,
        /// Reserved bytes, a multiple of the arena alignment.
        size: usize,
    },
}

/// Inclusive range of node indices during which a value must stay intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    /// Producing node (or first consumer for graph inputs).
    pub first_use: NodeId,
    /// Last consuming node. Graph outputs live until the end of the run.
    pub last_use: NodeId,
}

impl LiveRange {
    /// Whether the two ranges share at least one node.
    pub fn overlaps(&self, other: &LiveRange) -> bool {
        self.first_use <= other.last_use && other.first_use <= self.last_use
    }
}

/// Plan entry for one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuePlan {
    /// The value.
    pub value: ValueId,
    /// Provider slot of the producing node; `None` for graph inputs.
    pub provider: Option<usize>,
    /// Storage decision.
    pub placement: Placement,
    /// Live range.
    pub live: LiveRange,
}

/// Size of one provider's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaPlan {
    /// Bytes to reserve.
    pub size: usize,
    /// Base alignment.
    pub alignment: usize,
}

/// Output of [`MemoryPlanner::plan`], shared read-only by every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPlan {
    values: Vec<ValuePlan>,
    arenas: Vec<ArenaPlan>,
    node_count: usize,
}

impl MemoryPlan {
    /// Plan entries indexed by value id.
    pub fn values(&self) -> &[ValuePlan] {
        &self.values
    }

    /// Plan entry of one value.
    pub fn value(&self, value: ValueId) -> Option<&ValuePlan> {
        self.values.get(value)
    }

    /// Arenas indexed by provider slot.
    pub fn arenas(&self) -> &[ArenaPlan] {
        &self.arenas
    }

    /// Total bytes reserved across arenas.
    pub fn arena_bytes(&self) -> usize {
        self.arenas.iter().fold(0, |acc, a| acc.saturating_add(a.size))
    }

    /// Bytes the arena values would need without any reuse.
    pub fn unshared_bytes(&self) -> usize {
        self.arena_values()
            .fold(0, |acc, (_, _, size)| acc.saturating_add(size))
    }

    /// Largest number of arena bytes live at any single node.
    pub fn peak_live_bytes(&self) -> usize {
        (0..self.node_count)
            .map(|i| {
                self.arena_values()
                    .filter(|(plan, _, _)| plan.live.first_use <= i && i <= plan.live.last_use)
                    .fold(0usize, |acc, (_, _, size)| acc.saturating_add(size))
            })
            .max()
            .unwrap_or(0)
    }

    /// Values whose storage must be freed after `node` runs.
    pub fn standalone_released_after(&self, node: NodeId) -> impl Iterator<Item = ValueId> + '_ {
        self.values
            .iter()
            .filter(move |p| p.placement == Placement::Standalone && p.live.last_use == node)
            .map(|p| p.value)
    }

    /// Check that arena values with overlapping live ranges never share
    /// storage and that every slice is aligned and inside its arena.
    ///
    /// Fails with [`CoreError::Internal`] on the first violation.
    pub fn verify(&self) -> Result<()> {
        let entries: Vec<(&ValuePlan, usize, usize, usize)> = self
            .values
            .iter()
            .filter_map(|p| match p.placement {
                Placement::Arena {
                    arena,
                    offset,
                    size,
                } => Some((p, arena, offset, size)),
                _ => None,
            })
            .collect();

        for &(plan, arena, offset, size) in &entries {
            let bounds = self.arenas.get(arena).ok_or_else(|| {
                CoreError::internal(format!("value {} placed in unknown arena {}", plan.value, arena))
            })?;
            if offset % bounds.alignment != 0 {
                return Err(CoreError::internal(format!(
                    "value {} at offset {} violates alignment {}",
                    plan.value, offset, bounds.alignment
                )));
            }
            if offset + size > bounds.size {
                return Err(CoreError::internal(format!(
                    "value {} [{}, {}) exceeds arena {} of {} bytes",
                    plan.value,
                    offset,
                    offset + size,
                    arena,
                    bounds.size
                )));
            }
        }

        for (i, &(a, arena_a, off_a, size_a)) in entries.iter().enumerate() {
            for &(b, arena_b, off_b, size_b) in &entries[i + 1..] {
                if arena_a != arena_b || size_a == 0 || size_b == 0 {
                    continue;
                }
                let storage_overlaps = off_a < off_b + size_b && off_b < off_a + size_a;
                if storage_overlaps && a.live.overlaps(&b.live) {
                    return Err(CoreError::internal(format!(
                        "values {} and {} share arena {} storage while both live",
                        a.value, b.value, arena_a
                    )));
                }
            }
        }
        Ok(())
    }

    fn arena_values(&self) -> impl Iterator<Item = (&ValuePlan, usize, usize)> + '_ {
        self.values.iter().filter_map(|p| match p.placement {
            Placement::Arena { arena, size, .. } => Some((p, arena, size)),
            _ => None,
        })
    }
}

impl fmt::Display for MemoryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemoryPlan(arenas={}, arena_bytes={}, unshared_bytes={}, peak_live_bytes={})",
            self.arenas.len(),
            self.arena_bytes(),
            self.unshared_bytes(),
            self.peak_live_bytes()
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct FreeRange {
    offset: usize,
    size: usize,
}

/// Offset allocator for one arena.
#[derive(Debug)]
struct ArenaState {
    alignment: usize,
    end: usize,
    // Sorted by offset, never adjacent.
    free: Vec<FreeRange>,
}

impl ArenaState {
    fn new(alignment: usize) -> Self {
        Self {
            alignment,
            end: 0,
            free: Vec::new(),
        }
    }

    /// Offset of a `size`-byte slice, or `None` if the arena would outgrow
    /// the address space.
    fn reserve(&mut self, size: usize) -> Option<usize> {
        let best = self
            .free
            .iter()
            .enumerate()
            .filter(|(_, r)| r.size >= size)
            .min_by_key(|(_, r)| (r.size, r.offset))
            .map(|(i, _)| i);

        if let Some(i) = best {
            let range = self.free[i];
            if range.size == size {
                self.free.remove(i);
            } else {
                self.free[i] = FreeRange {
                    offset: range.offset + size,
                    size: range.size - size,
                };
            }
            return Some(range.offset);
        }

        // Extend a free tail instead of leaving it stranded.
        if let Some(last) = self.free.last().copied() {
            if last.offset + last.size == self.end {
                let end = last.offset.checked_add(size)?;
                self.free.pop();
                self.end = end;
                return Some(last.offset);
            }
        }

        let offset = self.end;
        self.end = offset.checked_add(size)?;
        Some(offset)
    }

    fn release(&mut self, offset: usize, size: usize) {
        let pos = self.free.partition_point(|r| r.offset < offset);
        self.free.insert(pos, FreeRange { offset, size });

        if pos + 1 < self.free.len() {
            let next = self.free[pos + 1];
            if offset + size == next.offset {
                self.free[pos].size += next.size;
                self.free.remove(pos + 1);
            }
        }
        if pos > 0 {
            let prev = self.free[pos - 1];
            if prev.offset + prev.size == offset {
                self.free[pos - 1].size += self.free[pos].size;
                self.free.remove(pos);
            }
        }
    }
}

fn round_up(size: usize, alignment: usize) -> Option<usize> {
    size.checked_next_multiple_of(alignment)
}

/// Computes buffer reuse from value lifetimes.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryPlanner;

impl MemoryPlanner {
    /// Create a planner.
    pub fn new() -> Self {
        Self
    }

    /// Plan storage for every value of `graph`.
    ///
    /// `assignment[n]` is the provider slot executing node `n`;
    /// `constraints[slot]` are that provider's allocator constraints.
    pub fn plan(
        &self,
        graph: &Graph,
        assignment: &[usize],
        constraints: &[AllocatorConstraints],
    ) -> Result<MemoryPlan> {
        let nodes = graph.nodes();
        if assignment.len() != nodes.len() {
            return Err(CoreError::internal(format!(
                "assignment covers {} nodes, graph has {}",
                assignment.len(),
                nodes.len()
            )));
        }
        if let Some(&slot) = assignment.iter().find(|&&s| s >= constraints.len()) {
            return Err(CoreError::internal(format!(
                "node assigned to provider slot {slot} without constraints"
            )));
        }
        for (slot, c) in constraints.iter().enumerate() {
            if c.alignment == 0 || !c.alignment.is_power_of_two() {
                return Err(CoreError::PlanningFailed(format!(
                    "provider slot {} alignment {} is not a power of two",
                    slot, c.alignment
                )));
            }
        }

        let producers = graph.producers();
        let end = nodes.len();

        let mut last_use: Vec<Option<NodeId>> = vec![None; graph.values().len()];
        for node in nodes {
            for &input in &node.inputs {
                last_use[input] = Some(node.index);
            }
        }

        let mut values: Vec<ValuePlan> = graph
            .values()
            .iter()
            .map(|info| {
                let id = info.id;
                match producers[id] {
                    None => ValuePlan {
                        value: id,
                        provider: None,
                        placement: Placement::GraphInput,
                        live: LiveRange {
                            first_use: 0,
                            last_use: last_use[id].unwrap_or(0),
                        },
                    },
                    Some(producer) => {
                        let is_output = graph.is_output(id);
                        let last = if is_output {
                            end
                        } else {
                            last_use[id].unwrap_or(producer).max(producer)
                        };
                        ValuePlan {
                            value: id,
                            provider: Some(assignment[producer]),
                            placement: Placement::Standalone,
                            live: LiveRange {
                                first_use: producer,
                                last_use: last,
                            },
                        }
                    }
                }
            })
            .collect();

        let mut arenas: Vec<ArenaState> = constraints
            .iter()
            .map(|c| ArenaState::new(c.alignment))
            .collect();

        for node in nodes {
            let slot = assignment[node.index];
            for &out in &node.outputs {
                let info = &graph.values()[out];
                if graph.is_output(out) {
                    continue;
                }
                let Some(dims) = info.shape.static_dims() else {
                    continue;
                };
                let arena = &mut arenas[slot];
                let slice = checked_byte_size(&dims, info.dtype)
                    .and_then(|bytes| round_up(bytes, arena.alignment))
                    .and_then(|size| {
                        let offset = if size == 0 { Some(0) } else { arena.reserve(size) };
                        offset.map(|offset| (offset, size))
                    });
                let Some((offset, size)) = slice else {
                    return Err(CoreError::PlanningFailed(format!(
                        "value '{}' of shape {:?} does not fit in provider slot {} arena",
                        info.name, dims, slot
                    )));
                };
                values[out].placement = Placement::Arena {
                    arena: slot,
                    offset,
                    size,
                };
                debug!(
                    value = %info.name,
                    arena = slot,
                    offset,
                    size,
                    "Planned arena slice"
                );
            }

            for plan in values.iter().filter(|p| p.live.last_use == node.index) {
                if let Placement::Arena {
                    arena,
                    offset,
                    size,
                } = plan.placement
                {
                    if size > 0 {
                        arenas[arena].release(offset, size);
                    }
                }
            }
        }

        let arenas: Vec<ArenaPlan> = arenas
            .iter()
            .map(|a| ArenaPlan {
                size: a.end,
                alignment: a.alignment,
            })
            .collect();

        for (slot, (arena, c)) in arenas.iter().zip(constraints).enumerate() {
            if let Some(max) = c.max_arena_bytes {
                if arena.size > max {
                    return Err(CoreError::PlanningFailed(format!(
                        "provider slot {} needs a {} byte arena, limit is {}",
                        slot, arena.size, max
                    )));
                }
            }
        }

        let plan = MemoryPlan {
            values,
            arenas,
            node_count: end,
        };
        info!(
            arena_bytes = plan.arena_bytes(),
            unshared_bytes = plan.unshared_bytes(),
            "Memory plan computed"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::types::{DataType, Dim, Shape};

    fn constraints(alignment: usize) -> Vec<AllocatorConstraints> {
        vec![AllocatorConstraints {
            alignment,
            max_arena_bytes: None,
        }]
    }

    /// x -> t0 -> t1 -> t2 -> t3 -> out, each intermediate 16 floats.
    fn chain(len: usize) -> Graph {
        let shape = Shape::fixed([16]);
        let mut b = GraphBuilder::new();
        b.add_input("x", DataType::F32, shape.clone()).unwrap();
        let mut prev = "x".to_string();
        for i in 0..len {
            let name = format!("t{i}");
            b.add_value(&name, DataType::F32, shape.clone()).unwrap();
            b.add_node(&format!("n{i}"), "Relu", &[&prev], &[&name]).unwrap();
            prev = name;
        }
        b.add_value("out", DataType::F32, shape).unwrap();
        b.add_node("last", "Relu", &[&prev], &["out"]).unwrap();
        b.add_output("out").unwrap();
        b.build().unwrap()
    }

    #[test]
    fn test_chain_reuses_two_slots() {
        let graph = chain(4);
        let plan = MemoryPlanner::new()
            .plan(&graph, &vec![0; graph.nodes().len()], &constraints(64))
            .unwrap();
        plan.verify().unwrap();

        // Ping-pong between two 64-byte slots.
        assert_eq!(plan.arena_bytes(), 128);
        assert_eq!(plan.unshared_bytes(), 4 * 64);
        assert_eq!(plan.peak_live_bytes(), 128);

        let x = graph.value_by_name("x").unwrap().id;
        let out = graph.value_by_name("out").unwrap().id;
        assert_eq!(plan.value(x).unwrap().placement, Placement::GraphInput);
        assert_eq!(plan.value(out).unwrap().placement, Placement::Standalone);
        assert_eq!(plan.value(out).unwrap().live.last_use, graph.nodes().len());
    }

    #[test]
    fn test_sizes_rounded_to_alignment() {
        let mut b = GraphBuilder::new();
        b.add_input("x", DataType::U8, Shape::fixed([3])).unwrap();
        b.add_value("t", DataType::U8, Shape::fixed([3])).unwrap();
        b.add_value("out", DataType::U8, Shape::fixed([3])).unwrap();
        b.add_node("n0", "Identity", &["x"], &["t"]).unwrap();
        b.add_node("n1", "Identity", &["t"], &["out"]).unwrap();
        b.add_output("out").unwrap();
        let graph = b.build().unwrap();

        let plan = MemoryPlanner::new()
            .plan(&graph, &[0, 0], &constraints(32))
            .unwrap();
        let t = graph.value_by_name("t").unwrap().id;
        assert_eq!(
            plan.value(t).unwrap().placement,
            Placement::Arena {
                arena: 0,
                offset: 0,
                size: 32
            }
        );
    }

    #[test]
    fn test_symbolic_values_are_standalone() {
        let dynamic = Shape(vec![Dim::Symbolic("N".into())]);
        let mut b = GraphBuilder::new();
        b.add_input("x", DataType::F32, dynamic.clone()).unwrap();
        b.add_value("t", DataType::F32, dynamic.clone()).unwrap();
        b.add_value("out", DataType::F32, dynamic).unwrap();
        b.add_node("n0", "Relu", &["x"], &["t"]).unwrap();
        b.add_node("n1", "Neg", &["t"], &["out"]).unwrap();
        b.add_output("out").unwrap();
        let graph = b.build().unwrap();

        let plan = MemoryPlanner::new()
            .plan(&graph, &[0, 0], &constraints(64))
            .unwrap();
        let t = graph.value_by_name("t").unwrap().id;
        assert_eq!(plan.value(t).unwrap().placement, Placement::Standalone);
        assert_eq!(plan.arena_bytes(), 0);
        assert_eq!(plan.standalone_released_after(1).collect::<Vec<_>>(), vec![t]);
    }

    #[test]
    fn test_bad_alignment_fails() {
        let graph = chain(1);
        let err = MemoryPlanner::new()
            .plan(&graph, &[0, 0], &constraints(24))
            .unwrap_err();
        assert!(matches!(err, CoreError::PlanningFailed(_)));
    }

    #[test]
    fn test_arena_limit_enforced() {
        let graph = chain(3);
        let limited = vec![AllocatorConstraints {
            alignment: 64,
            max_arena_bytes: Some(64),
        }];
        let err = MemoryPlanner::new()
            .plan(&graph, &[0; 4], &limited)
            .unwrap_err();
        assert!(matches!(err, CoreError::PlanningFailed(_)));
    }

    #[test]
    fn test_per_provider_arenas() {
        let graph = chain(3);
        let plan = MemoryPlanner::new()
            .plan(
                &graph,
                &[0, 1, 0, 1],
                &[AllocatorConstraints::default(), AllocatorConstraints::default()],
            )
            .unwrap();
        plan.verify().unwrap();
        assert_eq!(plan.arenas().len(), 2);
        assert_eq!(plan.arenas()[0].size, 64);
        assert_eq!(plan.arenas()[1].size, 64);
    }

    #[test]
    fn test_verify_detects_overlap() {
        let graph = chain(2);
        let mut plan = MemoryPlanner::new()
            .plan(&graph, &[0, 0, 0], &constraints(64))
            .unwrap();
        let t0 = graph.value_by_name("t0").unwrap().id;
        let t1 = graph.value_by_name("t1").unwrap().id;
        plan.values[t1].placement = plan.values[t0].placement;
        let err = plan.verify().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_free_ranges_coalesce() {
        let mut arena = ArenaState::new(8);
        let a = arena.reserve(8).unwrap();
        let b = arena.reserve(8).unwrap();
        let c = arena.reserve(8).unwrap();
        arena.release(a, 8);
        arena.release(c, 8);
        arena.release(b, 8);
        assert_eq!(arena.free.len(), 1);
        assert_eq!(arena.reserve(24), Some(0));
        assert_eq!(arena.end, 24);
    }

    #[test]
    fn test_arena_growth_overflow() {
        let mut arena = ArenaState::new(8);
        assert_eq!(arena.reserve(usize::MAX - 7), Some(0));
        assert_eq!(arena.reserve(16), None);
        assert_eq!(round_up(usize::MAX - 3, 8), None);
    }

    #[test]
    fn test_oversized_value_fails_planning() {
        let huge = Shape::fixed([1 << 40, 1 << 40]);
        let mut b = GraphBuilder::new();
        b.add_input("x", DataType::F32, huge.clone()).unwrap();
        b.add_value("t", DataType::F32, huge.clone()).unwrap();
        b.add_value("out", DataType::F32, huge).unwrap();
        b.add_node("n0", "Relu", &["x"], &["t"]).unwrap();
        b.add_node("n1", "Neg", &["t"], &["out"]).unwrap();
        b.add_output("out").unwrap();
        let graph = b.build().unwrap();

        let err = MemoryPlanner::new()
            .plan(&graph, &[0, 0], &constraints(64))
            .unwrap_err();
        assert!(matches!(err, CoreError::PlanningFailed(_)), "{err}");
    }
}
