//! The task-group dependency graph and its compiled form.
//!
//! Users declare groups and the ordering constraints between them; the
//! compiler canonicalizes the DAG, carves it into as few linear chains as
//! possible and emits the opcode stream interpreted by the task manager.
//! Groups without ordering constraints end up on different chains and run in
//! parallel.

use crate::{GroupId, INVALID_GROUP, LONG_DURATION_GROUP};
use anyhow::{Result, anyhow, bail};
use cadence_containers::{HashMap, HashSet, RandomState};
use cadence_id::{Hash64, StringHash64};
use petgraph::{
    Directed, Direction,
    algo::{self, DfsSpace},
    graphmap::GraphMap,
};
use std::collections::BTreeSet;

/// Compile-time configuration for a task group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupConfig {
    /// Restricts execution of the group's tasks to the thread registered
    /// under this name. Other workers skip the group entirely, so a
    /// restricted group easily becomes a bottleneck.
    pub restrict_to_named_thread: Option<Hash64>,
}

/// One instruction of the compiled plan.
///
/// A chain is a linear run of opcodes; `chain_count` chains advance
/// concurrently over the shared stream. Something like
///
/// ```text
/// chain 1:  execute 1, wait 1, execute 3, wait 3, execute 5, ...
/// chain 2:  execute 2, wait 2, execute 4, ...
/// ```
///
/// runs groups 1 and 3 in sequence, in parallel with groups 2 and 4.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    /// Prefix entry holding the offset of a chain's first effective opcode.
    /// The first `chain_count` opcodes of the stream are all of this kind.
    DeclareChainIndex(u16),
    /// Starts the group: runs its start callback, releases its staged wakeups
    /// and marks it started. Exactly one chain carries this opcode for a
    /// given group.
    ExecuteTaskGroup(GroupId),
    /// Parks the chain until the group has completed. The chain that observes
    /// the group's last task gone performs the completion transition and runs
    /// the end callback.
    WaitTaskGroup(GroupId),
    /// Terminates the chain. The last chain to end resets the frame state.
    EndChain,
}

const OP_DECLARE_CHAIN_INDEX: u16 = 6;
const OP_EXECUTE_TASK_GROUP: u16 = 16;
const OP_WAIT_TASK_GROUP: u16 = 17;
const OP_END_CHAIN: u16 = 18;

impl Opcode {
    /// Encodes the opcode as an `(opcode, argument)` word pair.
    pub fn encode(self) -> (u16, u16) {
        match self {
            Self::DeclareChainIndex(offset) => (OP_DECLARE_CHAIN_INDEX, offset),
            Self::ExecuteTaskGroup(group) => (OP_EXECUTE_TASK_GROUP, group.into()),
            Self::WaitTaskGroup(group) => (OP_WAIT_TASK_GROUP, group.into()),
            Self::EndChain => (OP_END_CHAIN, 0),
        }
    }

    /// Decodes an `(opcode, argument)` word pair.
    pub fn decode((tag, arg): (u16, u16)) -> Result<Self> {
        match tag {
            OP_DECLARE_CHAIN_INDEX => Ok(Self::DeclareChainIndex(arg)),
            OP_EXECUTE_TASK_GROUP => Ok(Self::ExecuteTaskGroup(decode_group_arg(arg)?)),
            OP_WAIT_TASK_GROUP => Ok(Self::WaitTaskGroup(decode_group_arg(arg)?)),
            OP_END_CHAIN => Ok(Self::EndChain),
            tag => bail!("unknown opcode tag {tag}"),
        }
    }
}

fn decode_group_arg(arg: u16) -> Result<GroupId> {
    let group = GroupId::try_from(arg).map_err(|_| anyhow!("group argument {arg} out of range"))?;
    if group == LONG_DURATION_GROUP || group == INVALID_GROUP {
        bail!("group argument {group} is reserved");
    }
    Ok(group)
}

/// Builder for the DAG of task groups.
///
/// Group ids are assigned in registration order, starting at 1 (0 is the
/// long-duration group). Dependencies are declared edge by edge and validated
/// when the graph is [compiled](Self::compile).
#[derive(Debug)]
pub struct TaskGroupGraph {
    groups: HashMap<Hash64, GroupId>,
    debug_names: HashMap<GroupId, String>,
    configuration: HashMap<GroupId, GroupConfig>,
    edges: GraphMap<GroupId, (), Directed, RandomState>,
    next_group_id: GroupId,
}

impl TaskGroupGraph {
    pub fn new() -> Self {
        Self {
            groups: HashMap::default(),
            debug_names: HashMap::default(),
            configuration: HashMap::default(),
            edges: GraphMap::new(),
            next_group_id: LONG_DURATION_GROUP + 1,
        }
    }

    /// Registers a task group and returns its id.
    ///
    /// A name that is already registered returns the existing id with a
    /// warning. When the id space is exhausted, [`INVALID_GROUP`] is
    /// returned.
    pub fn add_task_group(&mut self, name: StringHash64, config: GroupConfig) -> GroupId {
        let id = self.next_group_id;
        if id == INVALID_GROUP {
            cadence_log::error!("task-group id space exhausted; group {name} not added");
            return INVALID_GROUP;
        }

        if let Some(&existing) = self.groups.get(&name.hash()) {
            cadence_log::warn!("a task group called {name} already exists (id {existing}); keeping it");
            return existing;
        }

        self.next_group_id += 1;
        self.groups.insert(name.hash(), id);
        self.debug_names.insert(id, name.to_string());
        self.configuration.insert(id, config);
        self.edges.add_node(id);
        id
    }

    /// Makes `group` depend on `dependency`: no task of `group` runs before
    /// every task of `dependency` has completed.
    pub fn add_dependency(&mut self, group: GroupId, dependency: GroupId) {
        assert_ne!(group, dependency, "a task group cannot depend on itself");
        assert!(
            self.debug_names.contains_key(&group),
            "dependency added for unknown task group {group}"
        );
        assert!(
            self.debug_names.contains_key(&dependency),
            "dependency added on unknown task group {dependency}"
        );
        // Edges point from dependency to dependent
        self.edges.add_edge(dependency, group, ());
    }

    /// Like [`add_dependency`](Self::add_dependency), resolving both groups
    /// by name.
    pub fn add_dependency_by_name(&mut self, group: Hash64, dependency: Hash64) {
        let group = self
            .group_id(group)
            .unwrap_or_else(|| panic!("dependency added for unknown task group {group}"));
        let dependency = self
            .group_id(dependency)
            .unwrap_or_else(|| panic!("dependency added on unknown task group {dependency}"));
        self.add_dependency(group, dependency);
    }

    /// Looks up a group by name.
    pub fn group_id(&self, name: Hash64) -> Option<GroupId> {
        self.groups.get(&name).copied()
    }

    /// The number of registered groups.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Compiles the declared graph into the opcode stream interpreted by the
    /// task manager.
    ///
    /// # Errors
    /// Returns an error if the declared dependencies contain a cycle or the
    /// plan outgrows the opcode address space.
    pub fn compile(&self) -> Result<CompiledGraph> {
        let order = self.topological_order()?;
        let canonical = self.canonicalized_edges();

        let mut predecessors: HashMap<GroupId, Vec<GroupId>> = HashMap::default();
        for group in canonical.nodes() {
            let mut preds: Vec<GroupId> = canonical
                .neighbors_directed(group, Direction::Incoming)
                .collect();
            preds.sort_unstable();
            predecessors.insert(group, preds);
        }

        // Greedily carve the DAG into linear chains: a group extends the
        // first chain whose tail is one of its predecessors, otherwise it
        // opens a new chain. The topological order is deterministic, so the
        // carving is too.
        let mut chains: Vec<Vec<GroupId>> = Vec::new();
        for &group in &order {
            let preds = &predecessors[&group];
            match chains
                .iter_mut()
                .find(|chain| preds.contains(chain.last().unwrap()))
            {
                Some(chain) => chain.push(group),
                None => chains.push(vec![group]),
            }
        }

        // Emit each chain's body: waits for every canonical predecessor, then
        // the execute.
        let mut bodies: Vec<Vec<Opcode>> = Vec::with_capacity(chains.len());
        let mut waited: HashSet<GroupId> = HashSet::default();
        for chain in &chains {
            let mut body = Vec::new();
            for &group in chain {
                for &pred in &predecessors[&group] {
                    body.push(Opcode::WaitTaskGroup(pred));
                    waited.insert(pred);
                }
                body.push(Opcode::ExecuteTaskGroup(group));
            }
            bodies.push(body);
        }

        // The completion transition of a group happens in a wait opcode, so
        // every group must be waited on somewhere. Sinks get a trailing wait
        // in the chain that executes them.
        for (chain, body) in chains.iter().zip(&mut bodies) {
            for &group in chain {
                if !waited.contains(&group) {
                    body.push(Opcode::WaitTaskGroup(group));
                }
            }
            body.push(Opcode::EndChain);
        }

        let chain_count = chains.len();
        let mut opcodes =
            Vec::with_capacity(chain_count + bodies.iter().map(Vec::len).sum::<usize>());
        let mut offset = chain_count;
        for body in &bodies {
            let start = u16::try_from(offset)
                .map_err(|_| anyhow!("compiled plan exceeds the opcode address space"))?;
            opcodes.push(Opcode::DeclareChainIndex(start));
            offset += body.len();
        }
        for body in bodies {
            opcodes.extend(body);
        }

        Ok(CompiledGraph {
            groups: self.groups.clone(),
            chain_count,
            opcodes,
            debug_names: self.debug_names.clone(),
            configuration: self.configuration.clone(),
        })
    }

    /// Deterministic Kahn traversal; ties are broken by ascending group id.
    fn topological_order(&self) -> Result<Vec<GroupId>> {
        let mut remaining: HashMap<GroupId, usize> = self
            .edges
            .nodes()
            .map(|group| {
                (
                    group,
                    self.edges
                        .neighbors_directed(group, Direction::Incoming)
                        .count(),
                )
            })
            .collect();

        let mut ready: BTreeSet<GroupId> = remaining
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&group, _)| group)
            .collect();

        let mut order = Vec::with_capacity(remaining.len());
        while let Some(group) = ready.pop_first() {
            order.push(group);
            for successor in self.edges.neighbors_directed(group, Direction::Outgoing) {
                let count = remaining.get_mut(&successor).unwrap();
                *count -= 1;
                if *count == 0 {
                    ready.insert(successor);
                }
            }
        }

        if order.len() != remaining.len() {
            bail!("found circular task-group dependencies");
        }
        Ok(order)
    }

    /// Transitive reduction: an edge implied by a longer path is dropped, so
    /// only the longest dependency chains survive.
    fn canonicalized_edges(&self) -> GraphMap<GroupId, (), Directed, RandomState> {
        let mut graph = self.edges.clone();
        let mut space = DfsSpace::new(&graph);

        let mut edges: Vec<(GroupId, GroupId)> = self
            .edges
            .all_edges()
            .map(|(from, to, ())| (from, to))
            .collect();
        edges.sort_unstable();

        for (from, to) in edges {
            graph.remove_edge(from, to);
            if !algo::has_path_connecting(&graph, from, to, Some(&mut space)) {
                graph.add_edge(from, to, ());
            }
        }
        graph
    }
}

impl Default for TaskGroupGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// The compiled plan: the opcode stream walked by the chains, plus the tables
/// needed to resolve groups by name at load time.
#[derive(Clone, Debug)]
pub struct CompiledGraph {
    pub(crate) groups: HashMap<Hash64, GroupId>,
    pub(crate) chain_count: usize,
    pub(crate) opcodes: Vec<Opcode>,
    pub(crate) debug_names: HashMap<GroupId, String>,
    pub(crate) configuration: HashMap<GroupId, GroupConfig>,
}

impl CompiledGraph {
    pub fn chain_count(&self) -> usize {
        self.chain_count
    }

    pub fn opcodes(&self) -> &[Opcode] {
        &self.opcodes
    }

    /// Looks up a group by name.
    pub fn group_id(&self, name: Hash64) -> Option<GroupId> {
        self.groups.get(&name).copied()
    }

    /// Encodes the opcode stream as `(opcode, argument)` word pairs.
    pub fn encode_opcodes(&self) -> Vec<(u16, u16)> {
        self.opcodes.iter().map(|op| op.encode()).collect()
    }

    /// Rebuilds a compiled graph from an encoded opcode stream and the name
    /// and configuration tables.
    ///
    /// # Errors
    /// Returns an error if the stream is malformed: unknown opcodes, chain
    /// offsets out of bounds, a group executed by more than one chain, or
    /// references to groups missing from the tables.
    pub fn from_encoded(
        words: &[(u16, u16)],
        groups: HashMap<Hash64, GroupId>,
        debug_names: HashMap<GroupId, String>,
        configuration: HashMap<GroupId, GroupConfig>,
    ) -> Result<Self> {
        let opcodes: Vec<Opcode> = words
            .iter()
            .map(|&word| Opcode::decode(word))
            .collect::<Result<_>>()?;

        let chain_count = opcodes
            .iter()
            .take_while(|op| matches!(op, Opcode::DeclareChainIndex(_)))
            .count();
        if chain_count == 0 {
            bail!("compiled plan declares no chains");
        }

        let mut executed: HashSet<GroupId> = HashSet::default();
        let mut ended_chains = 0;
        for (index, opcode) in opcodes.iter().enumerate() {
            match *opcode {
                Opcode::DeclareChainIndex(start) => {
                    if index >= chain_count {
                        bail!("chain declaration at {index} inside a chain body");
                    }
                    let start = start as usize;
                    if start < chain_count || start >= opcodes.len() {
                        bail!("chain {index} starts at invalid offset {start}");
                    }
                }
                Opcode::ExecuteTaskGroup(group) => {
                    if !executed.insert(group) {
                        bail!("task group {group} is executed by more than one chain");
                    }
                    if !debug_names.contains_key(&group) {
                        bail!("opcode stream references unknown task group {group}");
                    }
                }
                Opcode::WaitTaskGroup(group) => {
                    if !debug_names.contains_key(&group) {
                        bail!("opcode stream references unknown task group {group}");
                    }
                }
                Opcode::EndChain => ended_chains += 1,
            }
        }
        if ended_chains != chain_count {
            bail!("{chain_count} chains declared but {ended_chains} chain terminators found");
        }

        Ok(Self {
            groups,
            chain_count,
            opcodes,
            debug_names,
            configuration,
        })
    }

    /// Logs the group table and opcode stream.
    pub fn print_debug(&self) {
        cadence_log::debug!("---- compiled task-group plan ----");
        let mut ids: Vec<_> = self.debug_names.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            cadence_log::debug!("  group {id}: {}", self.debug_names[&id]);
        }
        cadence_log::debug!("  {} chains:", self.chain_count);
        for opcode in &self.opcodes {
            match opcode {
                Opcode::DeclareChainIndex(start) => {
                    cadence_log::debug!("  chain starts at {start}");
                }
                Opcode::ExecuteTaskGroup(group) => {
                    cadence_log::debug!("    execute {}", self.debug_names[group]);
                }
                Opcode::WaitTaskGroup(group) => {
                    cadence_log::debug!("    wait {}", self.debug_names[group]);
                }
                Opcode::EndChain => cadence_log::debug!("    end chain"),
            }
        }
    }

    pub(crate) fn group_name(&self, group: GroupId) -> &str {
        self.debug_names
            .get(&group)
            .map(String::as_str)
            .unwrap_or("<unknown>")
    }

    pub(crate) fn max_group_id(&self) -> GroupId {
        self.debug_names.keys().copied().max().unwrap_or(0)
    }
}
