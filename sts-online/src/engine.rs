//! Incremental partial-likelihood engine.
//!
//! The engine owns a [`LikelihoodBackend`] with a fixed pool of
//! `4·n_seqs − 2` partials buffers:
//!
//! | range | contents |
//! |---|---|
//! | `[0, n)` | one tip buffer per alignment row, filled once |
//! | `[n, 2n − 1)` | distal partial of each internal node, by postorder rank |
//! | `[2n − 1, 4n − 5)` | proximal partials, two per non-root internal node, by preorder rank |
//! | `[4n − 5, 4n − 2)` | scratch, lent out for mid-edge and attachment evaluation |
//!
//! Every buffer has two transition matrices of its own (`2b`, `2b + 1`),
//! used by the operation that writes it.
//!
//! Each computed buffer is tagged with a Merkle-style hash of what it holds:
//! a distal hash covers the subtree (leaf names, topology, branch lengths),
//! a proximal hash covers everything outside it, and both cover the loaded
//! model and rates. A node whose hash matches its buffer's tag is not
//! recomputed, so a single-edge change only touches the nodes whose view of
//! the tree changed.
//!
//! The tree is unrooted for likelihood purposes: the two root edges are
//! collapsed into one, so the vector above a child of the root is its
//! sibling's distal vector, one sibling branch length away.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use log::{debug, trace};
use sts_core::{Result, StsError, Summarizable};

use crate::alignment::Alignment;
use crate::backend::{BackendDims, CpuBackend, LikelihoodBackend, Operation};
use crate::config::EngineConfig;
use crate::likelihood_vector::LikelihoodVector;
use crate::metrics::EngineMetrics;
use crate::models::Alphabet;
use crate::rates::RateDistribution;
use crate::subst_model::SubstitutionModel;
use crate::tree::{NodeId, PhyloTree};

/// Cumulative scale buffer used for the root evaluation.
const ROOT_SCALE: usize = 0;

/// A partial vector together with the log of the scale factors divided out
/// of it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaledPartials {
    pub partials: LikelihoodVector,
    pub log_scale: f64,
}

/// A point on an edge: `distal` is measured from the edge's child node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttachmentLocation {
    pub edge: NodeId,
    pub distal: f64,
}

#[derive(Debug, Clone, Copy)]
struct BufferLayout {
    n_seqs: usize,
}

impl BufferLayout {
    fn n_buffers(self) -> usize {
        4 * self.n_seqs - 2
    }

    fn distal(self, rank: usize) -> usize {
        self.n_seqs + rank
    }

    fn proximal(self, rank: usize) -> usize {
        2 * self.n_seqs - 1 + rank
    }

    fn scratch(self) -> std::ops::Range<usize> {
        (4 * self.n_seqs - 5)..self.n_buffers()
    }

    fn matrices(buffer: usize) -> (usize, usize) {
        (2 * buffer, 2 * buffer + 1)
    }
}

/// The vector looking away from a node's edge, `extra` branch length above
/// the edge's upper end.
#[derive(Debug, Clone, Copy)]
struct Above {
    buffer: usize,
    extra: f64,
    content: u64,
}

struct EdgeGeometry {
    distal_buffer: usize,
    distal_hash: u64,
    length: f64,
    above: Above,
}

/// Buffer assignment of the last evaluated tree.
struct Snapshot {
    tree: PhyloTree,
    distal: HashMap<NodeId, usize>,
    distal_hash: HashMap<NodeId, u64>,
    proximal: HashMap<NodeId, usize>,
    above: HashMap<NodeId, Above>,
}

#[derive(Clone, Copy)]
enum Pass {
    Distal,
    Proximal,
}

struct Pending {
    node: NodeId,
    hash: u64,
    pass: Pass,
}

/// One backend submission: combine operations, the matrices they need, and
/// what each destination will hold.
#[derive(Default)]
struct Plan {
    operations: Vec<Operation>,
    matrices: Vec<(usize, f64)>,
    pending: Vec<Pending>,
    skipped: usize,
}

impl Plan {
    fn push(&mut self, pending: Pending, dest: usize, child1: (usize, f64), child2: (usize, f64)) {
        let (m1, m2) = BufferLayout::matrices(dest);
        self.operations.push(Operation {
            destination: dest,
            child1: child1.0,
            matrix1: m1,
            child2: child2.0,
            matrix2: m2,
        });
        self.matrices.push((m1, child1.1));
        self.matrices.push((m2, child2.1));
        self.pending.push(pending);
    }
}

fn hash_of<T: Hash>(value: T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

fn bits(values: &[f64]) -> Vec<u64> {
    values.iter().map(|v| v.to_bits()).collect()
}

fn is_current(
    states: &HashMap<NodeId, u64>,
    content: &[Option<u64>],
    node: NodeId,
    buffer: usize,
    hash: u64,
) -> bool {
    states.get(&node) == Some(&hash) && content[buffer] == Some(hash)
}

/// Felsenstein pruning over a cached, incrementally updated buffer pool.
pub struct PartialLikelihoodEngine<B: LikelihoodBackend = CpuBackend> {
    backend: B,
    layout: BufferLayout,
    alphabet: Alphabet,
    n_rates: usize,
    n_sites: usize,
    leaf_buffers: HashMap<String, usize>,
    model_hash: Option<u64>,
    rates_hash: Option<u64>,
    /// Hash of what each buffer currently holds.
    buffer_content: Vec<Option<u64>>,
    /// Total log scale of everything each buffer was built from.
    buffer_log_scale: Vec<f64>,
    distal_state: HashMap<NodeId, u64>,
    prox_state: HashMap<NodeId, u64>,
    mid_edge_cache: HashMap<NodeId, (u64, ScaledPartials)>,
    scratch_free: Vec<usize>,
    snapshot: Option<Snapshot>,
    metrics: Arc<EngineMetrics>,
}

impl PartialLikelihoodEngine<CpuBackend> {
    /// Engine on a [`CpuBackend`] with default settings.
    ///
    /// `model` and `rates` only fix the state and category counts; load them
    /// with [`Self::load_substitution_model`] and
    /// [`Self::load_rate_distribution`] before evaluating.
    pub fn new(
        alignment: &Alignment,
        model: &dyn SubstitutionModel,
        rates: &RateDistribution,
    ) -> Result<Self> {
        Self::with_config(alignment, model, rates, &EngineConfig::default())
    }

    pub fn with_config(
        alignment: &Alignment,
        model: &dyn SubstitutionModel,
        rates: &RateDistribution,
        config: &EngineConfig,
    ) -> Result<Self> {
        let dims = Self::required_dims(alignment, model.n_states(), rates.n_categories());
        let backend = CpuBackend::new(dims).with_rescaling(config.rescaling);
        Self::with_backend(backend, alignment, model, rates)
    }
}

impl<B: LikelihoodBackend> PartialLikelihoodEngine<B> {
    /// Backend allocation an engine over `alignment` needs.
    pub fn required_dims(alignment: &Alignment, n_states: usize, n_rates: usize) -> BackendDims {
        let n_buffers = 4 * alignment.n_sequences().max(2) - 2;
        BackendDims {
            n_buffers,
            n_matrices: 2 * n_buffers,
            n_scale_buffers: 1,
            n_rates,
            n_sites: alignment.n_sites(),
            n_states,
        }
    }

    /// Engine driving a caller-supplied backend, whose dimensions must equal
    /// [`Self::required_dims`].
    pub fn with_backend(
        mut backend: B,
        alignment: &Alignment,
        model: &dyn SubstitutionModel,
        rates: &RateDistribution,
    ) -> Result<Self> {
        let n_seqs = alignment.n_sequences();
        if n_seqs < 2 {
            return Err(StsError::Initialization(format!(
                "need at least two sequences, got {}",
                n_seqs
            )));
        }
        let alphabet = Alphabet::from_state_count(model.n_states()).ok_or_else(|| {
            StsError::Initialization(format!(
                "unsupported state count {}; expected 4 or 20",
                model.n_states()
            ))
        })?;
        let expected = Self::required_dims(alignment, model.n_states(), rates.n_categories());
        if backend.dims() != expected {
            return Err(StsError::Initialization(format!(
                "backend dimensions {:?} do not match required {:?}",
                backend.dims(),
                expected
            )));
        }

        let mut leaf_buffers = HashMap::with_capacity(n_seqs);
        for (row, name) in alignment.names().iter().enumerate() {
            if leaf_buffers.insert(name.clone(), row).is_some() {
                return Err(StsError::Initialization(format!(
                    "duplicate sequence name {}",
                    name
                )));
            }
            let partials = alignment.tip_partials(row, alphabet, rates.n_categories())?;
            backend.set_partials(row, &partials)?;
        }

        let layout = BufferLayout { n_seqs };
        let n_buffers = layout.n_buffers();
        debug!(
            "engine over {}: {} states, {} rate categories, {} buffers",
            alignment.summary(),
            alphabet.n_states(),
            rates.n_categories(),
            n_buffers
        );
        Ok(Self {
            backend,
            layout,
            alphabet,
            n_rates: rates.n_categories(),
            n_sites: alignment.n_sites(),
            leaf_buffers,
            model_hash: None,
            rates_hash: None,
            buffer_content: vec![None; n_buffers],
            buffer_log_scale: vec![0.0; n_buffers],
            distal_state: HashMap::new(),
            prox_state: HashMap::new(),
            mid_edge_cache: HashMap::new(),
            scratch_free: layout.scratch().rev().collect(),
            snapshot: None,
            metrics: Arc::new(EngineMetrics::new()),
        })
    }

    /// Report work into a shared metrics object instead of a private one.
    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Shared handle on the work counters.
    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn n_sites(&self) -> usize {
        self.n_sites
    }

    pub fn n_rates(&self) -> usize {
        self.n_rates
    }

    pub fn n_states(&self) -> usize {
        self.alphabet.n_states()
    }

    pub fn n_buffers(&self) -> usize {
        self.layout.n_buffers()
    }

    /// The last successfully evaluated tree.
    pub fn tree(&self) -> Option<&PhyloTree> {
        self.snapshot.as_ref().map(|s| &s.tree)
    }

    /// Push the eigen system and state frequencies of `model`.
    ///
    /// A model different from the loaded one discards every cached partial.
    pub fn load_substitution_model(&mut self, model: &dyn SubstitutionModel) -> Result<()> {
        if model.n_states() != self.alphabet.n_states() {
            return Err(StsError::InvalidInput(format!(
                "model has {} states, engine was built for {}",
                model.n_states(),
                self.alphabet.n_states()
            )));
        }
        let eigen = model.eigen_decomposition();
        self.backend.set_eigen_decomposition(&eigen)?;
        self.backend.set_state_frequencies(model.frequencies())?;
        let hash = hash_of((
            "model",
            bits(&eigen.eigenvalues),
            bits(&eigen.eigenvectors),
            bits(&eigen.inverse_eigenvectors),
            bits(model.frequencies()),
        ));
        if self.model_hash != Some(hash) {
            if self.model_hash.is_some() {
                debug!("substitution model changed; discarding cached partials");
            }
            self.discard_cache();
            self.model_hash = Some(hash);
        }
        Ok(())
    }

    /// Push category rates and weights.
    ///
    /// Different rates discard every cached partial.
    pub fn load_rate_distribution(&mut self, rates: &RateDistribution) -> Result<()> {
        if rates.n_categories() != self.n_rates {
            return Err(StsError::InvalidInput(format!(
                "rate distribution has {} categories, engine was built for {}",
                rates.n_categories(),
                self.n_rates
            )));
        }
        self.backend.set_category_rates(rates.rates())?;
        self.backend.set_category_weights(rates.weights())?;
        let hash = hash_of(("rates", bits(rates.rates()), bits(rates.weights())));
        if self.rates_hash != Some(hash) {
            if self.rates_hash.is_some() {
                debug!("rate distribution changed; discarding cached partials");
            }
            self.discard_cache();
            self.rates_hash = Some(hash);
        }
        Ok(())
    }

    /// Load `model` and `rates`, then evaluate `tree`.
    pub fn initialize(
        &mut self,
        model: &dyn SubstitutionModel,
        rates: &RateDistribution,
        tree: &PhyloTree,
    ) -> Result<f64> {
        debug!("initializing on {}", tree.summary());
        self.load_substitution_model(model)?;
        self.load_rate_distribution(rates)?;
        self.calculate_log_likelihood(tree)
    }

    fn discard_cache(&mut self) {
        for content in &mut self.buffer_content[self.layout.n_seqs..] {
            *content = None;
        }
        self.distal_state.clear();
        self.prox_state.clear();
        self.mid_edge_cache.clear();
    }

    fn state_hash(&self) -> Result<u64> {
        let model = self.model_hash.ok_or_else(|| {
            StsError::Initialization("substitution model not loaded".into())
        })?;
        let rates = self.rates_hash.ok_or_else(|| {
            StsError::Initialization("rate distribution not loaded".into())
        })?;
        Ok(hash_of((model, rates)))
    }

    fn check_tree(&self, tree: &PhyloTree) -> Result<()> {
        tree.validate_bifurcating()?;
        let mut seen = HashSet::new();
        for leaf in tree.leaves() {
            let name = tree
                .get_node(leaf)
                .and_then(|n| n.name.as_deref())
                .ok_or_else(|| StsError::InvalidInput(format!("leaf {} has no name", leaf)))?;
            if !self.leaf_buffers.contains_key(name) {
                return Err(StsError::InvalidInput(format!(
                    "leaf {} is not in the alignment",
                    name
                )));
            }
            if !seen.insert(name) {
                return Err(StsError::InvalidInput(format!(
                    "leaf {} appears twice in the tree",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Log-likelihood of `tree` under the loaded model and rates.
    ///
    /// Recomputes only the distal and proximal partials whose inputs changed
    /// since they were last computed; `tree` becomes the engine's snapshot
    /// for mid-edge and attachment queries.
    pub fn calculate_log_likelihood(&mut self, tree: &PhyloTree) -> Result<f64> {
        let state = self.state_hash()?;
        self.check_tree(tree)?;
        self.snapshot = None;

        let mut snap = Snapshot {
            tree: tree.clone(),
            distal: HashMap::with_capacity(tree.node_count()),
            distal_hash: HashMap::with_capacity(tree.node_count()),
            proximal: HashMap::with_capacity(tree.node_count()),
            above: HashMap::with_capacity(tree.node_count()),
        };
        let distal_plan = self.plan_distal(&mut snap, state)?;
        let (distal_ops, distal_skipped) = (distal_plan.operations.len(), distal_plan.skipped);
        self.execute(distal_plan)?;
        let proximal_plan = self.plan_proximal(&mut snap, state)?;
        let (prox_ops, prox_skipped) = (proximal_plan.operations.len(), proximal_plan.skipped);
        self.execute(proximal_plan)?;

        let internal: Vec<usize> = tree
            .iter_postorder()
            .filter(|&id| tree.get_node(id).map_or(false, |n| !n.is_leaf()))
            .filter_map(|id| snap.distal.get(&id).copied())
            .collect();
        let root_buffer = snap.distal[&tree.root()];
        self.backend.reset_scale_factors(ROOT_SCALE)?;
        self.backend.accumulate_scale_factors(&internal, ROOT_SCALE)?;
        let log_likelihood = self
            .backend
            .root_log_likelihood(root_buffer, Some(ROOT_SCALE))?;
        self.metrics.record_evaluation();

        debug!(
            "log-likelihood {:.6}: distal {} computed / {} cached, proximal {} computed / {} cached",
            log_likelihood, distal_ops, distal_skipped, prox_ops, prox_skipped
        );
        self.snapshot = Some(snap);
        Ok(log_likelihood)
    }

    fn plan_distal(&self, snap: &mut Snapshot, state: u64) -> Result<Plan> {
        let Snapshot {
            tree,
            distal,
            distal_hash,
            ..
        } = snap;
        let mut plan = Plan::default();
        let mut rank = 0;
        for id in tree.iter_postorder() {
            let node = tree
                .get_node(id)
                .ok_or_else(|| StsError::InvalidInput(format!("unknown node {}", id)))?;
            if node.is_leaf() {
                let name = node.name.as_deref().unwrap_or_default();
                let buffer = *self.leaf_buffers.get(name).ok_or_else(|| {
                    StsError::InvalidInput(format!("leaf {} is not in the alignment", name))
                })?;
                distal.insert(id, buffer);
                distal_hash.insert(id, hash_of(("leaf", name)));
                continue;
            }
            let (c1, c2) = (node.children[0], node.children[1]);
            let (l1, l2) = (tree.branch_length(c1)?, tree.branch_length(c2)?);
            let hash = hash_of((
                "distal",
                state,
                distal_hash[&c1],
                l1.to_bits(),
                distal_hash[&c2],
                l2.to_bits(),
            ));
            let buffer = self.layout.distal(rank);
            rank += 1;
            if is_current(&self.distal_state, &self.buffer_content, id, buffer, hash) {
                trace!("distal {}: buffer {} is current", id, buffer);
                plan.skipped += 1;
            } else {
                trace!("distal {}: recompute into buffer {}", id, buffer);
                plan.push(
                    Pending {
                        node: id,
                        hash,
                        pass: Pass::Distal,
                    },
                    buffer,
                    (distal[&c1], l1),
                    (distal[&c2], l2),
                );
            }
            distal.insert(id, buffer);
            distal_hash.insert(id, hash);
        }
        Ok(plan)
    }

    fn plan_proximal(&self, snap: &mut Snapshot, state: u64) -> Result<Plan> {
        let Snapshot {
            tree,
            distal,
            distal_hash,
            proximal,
            above,
        } = snap;
        let root = tree.root();
        let root_children = tree
            .get_node(root)
            .map(|n| n.children.clone())
            .unwrap_or_default();
        if let &[r1, r2] = root_children.as_slice() {
            for (child, sibling) in [(r1, r2), (r2, r1)] {
                above.insert(
                    child,
                    Above {
                        buffer: distal[&sibling],
                        extra: tree.branch_length(sibling)?,
                        content: distal_hash[&sibling],
                    },
                );
            }
        }

        let mut plan = Plan::default();
        let mut rank = 0;
        for id in tree.iter_preorder() {
            let node = tree
                .get_node(id)
                .ok_or_else(|| StsError::InvalidInput(format!("unknown node {}", id)))?;
            if node.is_leaf() || id == root {
                continue;
            }
            let upper = above[&id];
            let length = tree.branch_length(id)? + upper.extra;
            let (c1, c2) = (node.children[0], node.children[1]);
            for (son, sibling) in [(c1, c2), (c2, c1)] {
                let sibling_length = tree.branch_length(sibling)?;
                let hash = hash_of((
                    "proximal",
                    state,
                    upper.content,
                    length.to_bits(),
                    distal_hash[&sibling],
                    sibling_length.to_bits(),
                ));
                let buffer = self.layout.proximal(rank);
                rank += 1;
                if is_current(&self.prox_state, &self.buffer_content, son, buffer, hash) {
                    trace!("proximal {}: buffer {} is current", son, buffer);
                    plan.skipped += 1;
                } else {
                    trace!("proximal {}: recompute into buffer {}", son, buffer);
                    plan.push(
                        Pending {
                            node: son,
                            hash,
                            pass: Pass::Proximal,
                        },
                        buffer,
                        (upper.buffer, length),
                        (distal[&sibling], sibling_length),
                    );
                }
                proximal.insert(son, buffer);
                above.insert(
                    son,
                    Above {
                        buffer,
                        extra: 0.0,
                        content: hash,
                    },
                );
            }
        }
        Ok(plan)
    }

    /// Submit one batch and record what the written buffers now hold.
    fn execute(&mut self, plan: Plan) -> Result<()> {
        let Plan {
            operations,
            matrices,
            pending,
            skipped,
        } = plan;
        if operations.is_empty() {
            self.metrics.record_operations(0, skipped);
            return Ok(());
        }
        for op in &operations {
            self.buffer_content[op.destination] = None;
        }
        self.backend.update_transition_matrices(&matrices)?;
        self.metrics.record_matrix_updates(matrices.len());
        self.backend.update_partials(&operations)?;
        self.metrics.record_operations(operations.len(), skipped);

        for (op, done) in operations.iter().zip(pending) {
            self.buffer_log_scale[op.destination] = self.backend.buffer_log_scale(op.destination)?
                + self.buffer_log_scale[op.child1]
                + self.buffer_log_scale[op.child2];
            self.buffer_content[op.destination] = Some(done.hash);
            match done.pass {
                Pass::Distal => self.distal_state.insert(done.node, done.hash),
                Pass::Proximal => self.prox_state.insert(done.node, done.hash),
            };
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<&Snapshot> {
        self.snapshot
            .as_ref()
            .ok_or_else(|| StsError::Initialization("no tree has been evaluated".into()))
    }

    fn edge_geometry(&self, edge: NodeId) -> Result<EdgeGeometry> {
        let snap = self.snapshot()?;
        let distal_buffer = *snap
            .distal
            .get(&edge)
            .ok_or_else(|| StsError::InvalidInput(format!("unknown node {}", edge)))?;
        let above = *snap
            .above
            .get(&edge)
            .ok_or_else(|| StsError::InvalidInput(format!("node {} has no parent edge", edge)))?;
        Ok(EdgeGeometry {
            distal_buffer,
            distal_hash: snap.distal_hash[&edge],
            length: snap.tree.branch_length(edge)?,
            above,
        })
    }

    /// Length of the edge above `edge` in the evaluated tree.
    pub fn edge_length(&self, edge: NodeId) -> Result<f64> {
        self.snapshot()?.tree.branch_length(edge)
    }

    /// Combine two buffers into scratch `slot`; returns the slot's total log
    /// scale.
    fn combine_into(
        &mut self,
        slot: usize,
        child1: (usize, f64),
        child2: (usize, f64),
    ) -> Result<f64> {
        let (m1, m2) = BufferLayout::matrices(slot);
        self.backend
            .update_transition_matrices(&[(m1, child1.1), (m2, child2.1)])?;
        self.metrics.record_matrix_updates(2);
        self.backend.update_partials(&[Operation {
            destination: slot,
            child1: child1.0,
            matrix1: m1,
            child2: child2.0,
            matrix2: m2,
        }])?;
        self.metrics.record_operations(1, 0);
        let total = self.backend.buffer_log_scale(slot)?
            + self.buffer_log_scale[child1.0]
            + self.buffer_log_scale[child2.0];
        self.buffer_log_scale[slot] = total;
        Ok(total)
    }

    fn read_partials(&self, buffer: usize) -> Result<LikelihoodVector> {
        let mut v = LikelihoodVector::new(self.n_rates, self.n_sites, self.alphabet.n_states());
        self.backend.get_partials(buffer, v.as_mut_slice())?;
        Ok(v)
    }

    /// Partial vector at the midpoint of every edge of the evaluated tree,
    /// keyed by the edge's child node, in node order.
    ///
    /// Cached per edge; an entry is reused while the edge length and the
    /// vectors on both sides of the edge are unchanged.
    pub fn mid_edge_partials(&mut self) -> Result<Vec<(NodeId, ScaledPartials)>> {
        let state = self.state_hash()?;
        let edges = self.snapshot()?.tree.edges();
        let mut out = Vec::with_capacity(edges.len());
        let mut computed = 0;
        for edge in edges {
            let g = self.edge_geometry(edge)?;
            let key = hash_of((
                "mid-edge",
                state,
                g.distal_hash,
                g.length.to_bits(),
                g.above.content,
                g.above.extra.to_bits(),
            ));
            if let Some((cached_key, partials)) = self.mid_edge_cache.get(&edge) {
                if *cached_key == key {
                    out.push((edge, partials.clone()));
                    continue;
                }
            }
            let slot = self.acquire_scratch()?;
            let half = 0.5 * g.length;
            let result = self
                .combine_into(
                    slot,
                    (g.distal_buffer, half),
                    (g.above.buffer, half + g.above.extra),
                )
                .and_then(|log_scale| {
                    Ok(ScaledPartials {
                        partials: self.read_partials(slot)?,
                        log_scale,
                    })
                });
            self.release_scratch(slot);
            let partials = result?;
            computed += 1;
            self.mid_edge_cache.insert(edge, (key, partials.clone()));
            out.push((edge, partials));
        }
        trace!("mid-edge partials: {} computed, {} cached", computed, out.len() - computed);
        Ok(out)
    }

    /// Distal partial vector of `node` in the evaluated tree.
    pub fn distal_partials(&self, node: NodeId) -> Result<ScaledPartials> {
        let buffer = *self
            .snapshot()?
            .distal
            .get(&node)
            .ok_or_else(|| StsError::InvalidInput(format!("unknown node {}", node)))?;
        Ok(ScaledPartials {
            partials: self.read_partials(buffer)?,
            log_scale: self.buffer_log_scale[buffer],
        })
    }

    /// Tip partials of the sequence `name`.
    pub fn leaf_partials(&self, name: &str) -> Result<LikelihoodVector> {
        let buffer = self
            .leaf_buffer(name)
            .ok_or_else(|| StsError::InvalidInput(format!("unknown sequence {}", name)))?;
        self.read_partials(buffer)
    }

    /// Buffer holding the tip partials of `name`.
    pub fn leaf_buffer(&self, name: &str) -> Option<usize> {
        self.leaf_buffers.get(name).copied()
    }

    /// Log-likelihood of joining `partials` to the tip in `leaf_buffer`
    /// through a branch of length `pendant`.
    pub fn log_dot_leaf(
        &mut self,
        partials: &ScaledPartials,
        leaf_buffer: usize,
        pendant: f64,
    ) -> Result<f64> {
        self.state_hash()?;
        if leaf_buffer >= self.layout.n_seqs {
            return Err(StsError::InvalidInput(format!(
                "buffer {} is not a leaf buffer",
                leaf_buffer
            )));
        }
        let slot = self.acquire_scratch()?;
        let result = self.join_leaf(slot, partials, leaf_buffer, pendant);
        self.release_scratch(slot);
        result
    }

    fn join_leaf(
        &mut self,
        slot: usize,
        partials: &ScaledPartials,
        leaf_buffer: usize,
        pendant: f64,
    ) -> Result<f64> {
        self.backend.set_partials(slot, partials.partials.as_slice())?;
        let (matrix, _) = BufferLayout::matrices(slot);
        self.backend.update_transition_matrices(&[(matrix, pendant)])?;
        self.metrics.record_matrix_updates(1);
        let ll = self
            .backend
            .edge_log_likelihood(slot, leaf_buffer, matrix, None)?;
        Ok(ll + partials.log_scale)
    }

    /// For each location and each pendant length, the log-likelihood of the
    /// evaluated tree with `leaf` attached there.
    pub fn calculate_attachment_likelihoods(
        &mut self,
        leaf: &str,
        locations: &[AttachmentLocation],
        pendant_lengths: &[f64],
    ) -> Result<Vec<Vec<f64>>> {
        let leaf_buffer = self.attachable_leaf(leaf)?;
        let [tripod, pendant] = self.acquire_scratch_pair()?;
        let result = self.attachment_grid(tripod, pendant, leaf_buffer, locations, pendant_lengths);
        self.release_scratch(tripod);
        self.release_scratch(pendant);
        result
    }

    fn attachment_grid(
        &mut self,
        tripod: usize,
        pendant: usize,
        leaf_buffer: usize,
        locations: &[AttachmentLocation],
        pendant_lengths: &[f64],
    ) -> Result<Vec<Vec<f64>>> {
        let mut rows = Vec::with_capacity(locations.len());
        for location in locations {
            let log_scale = self.attachment_partial(tripod, location.edge, location.distal)?;
            let row = pendant_lengths
                .iter()
                .map(|&p| {
                    self.attachment_log_likelihood(tripod, pendant, leaf_buffer, p, log_scale)
                })
                .collect::<Result<Vec<f64>>>()?;
            rows.push(row);
        }
        Ok(rows)
    }

    /// Leaf buffer of `leaf`, which must not already be in the evaluated tree.
    pub(crate) fn attachable_leaf(&self, leaf: &str) -> Result<usize> {
        self.state_hash()?;
        let buffer = self
            .leaf_buffer(leaf)
            .ok_or_else(|| StsError::InvalidInput(format!("unknown sequence {}", leaf)))?;
        if self.snapshot()?.tree.leaf_by_name(leaf).is_some() {
            return Err(StsError::InvalidInput(format!(
                "leaf {} is already in the tree",
                leaf
            )));
        }
        Ok(buffer)
    }

    /// Write into `slot` the vector at `distal` above the child end of
    /// `edge`, looking at both sides of the edge. Returns its log scale.
    pub(crate) fn attachment_partial(
        &mut self,
        slot: usize,
        edge: NodeId,
        distal: f64,
    ) -> Result<f64> {
        let g = self.edge_geometry(edge)?;
        if !(distal >= 0.0 && distal <= g.length) {
            return Err(StsError::InvalidInput(format!(
                "distal length {} outside [0, {}]",
                distal, g.length
            )));
        }
        self.combine_into(
            slot,
            (g.distal_buffer, distal),
            (g.above.buffer, g.length - distal + g.above.extra),
        )
    }

    /// Log-likelihood of the attachment partial in `slot` joined to the leaf
    /// through `pendant`, using the first matrix of `matrix_slot`.
    pub(crate) fn attachment_log_likelihood(
        &mut self,
        slot: usize,
        matrix_slot: usize,
        leaf_buffer: usize,
        pendant: f64,
        log_scale: f64,
    ) -> Result<f64> {
        let (matrix, _) = BufferLayout::matrices(matrix_slot);
        self.backend.update_transition_matrices(&[(matrix, pendant)])?;
        self.metrics.record_matrix_updates(1);
        let ll = self
            .backend
            .edge_log_likelihood(slot, leaf_buffer, matrix, None)?;
        Ok(ll + log_scale)
    }

    /// Forget the cached state of `node`: its distal and proximal partials
    /// are recomputed on the next evaluation, and the mid-edge partials of
    /// its adjacent edges on the next query.
    pub fn invalidate(&mut self, node: NodeId) {
        self.distal_state.remove(&node);
        self.prox_state.remove(&node);
        self.mid_edge_cache.remove(&node);
        if let Some(snap) = &self.snapshot {
            if let Some(&b) = snap.distal.get(&node) {
                if b >= self.layout.n_seqs {
                    self.buffer_content[b] = None;
                }
            }
            if let Some(&b) = snap.proximal.get(&node) {
                self.buffer_content[b] = None;
            }
            if let Some(n) = snap.tree.get_node(node) {
                for child in &n.children {
                    self.mid_edge_cache.remove(child);
                }
            }
        }
    }

    /// Scratch slots currently available.
    pub fn free_buffer_count(&self) -> usize {
        self.scratch_free.len()
    }

    pub(crate) fn acquire_scratch(&mut self) -> Result<usize> {
        self.scratch_free
            .pop()
            .ok_or(StsError::InsufficientBuffers {
                requested: 1,
                available: 0,
            })
    }

    pub(crate) fn acquire_scratch_pair(&mut self) -> Result<[usize; 2]> {
        if self.scratch_free.len() < 2 {
            return Err(StsError::InsufficientBuffers {
                requested: 2,
                available: self.scratch_free.len(),
            });
        }
        let first = self.acquire_scratch()?;
        let second = self.acquire_scratch()?;
        Ok([first, second])
    }

    pub(crate) fn release_scratch(&mut self, slot: usize) {
        debug_assert!(self.layout.scratch().contains(&slot));
        debug_assert!(!self.scratch_free.contains(&slot));
        self.buffer_content[slot] = None;
        self.scratch_free.push(slot);
    }
}
