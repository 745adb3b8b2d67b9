//! Likelihood engine benchmarks: full evaluation from a cold cache versus
//! incremental re-evaluation after a single branch-length change, and the
//! mid-edge pass used to weight attachment edges.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use sts_online::{
    Alignment, Hky85Model, PartialLikelihoodEngine, PhyloTree, RateDistribution,
};

// =========================================================================
// Data generation
// =========================================================================

fn random_alignment(n_taxa: usize, n_sites: usize, seed: u64) -> Alignment {
    let bases = [b'A', b'C', b'G', b'T'];
    let mut rng = StdRng::seed_from_u64(seed);
    let ancestor: Vec<u8> = (0..n_sites).map(|_| bases[rng.gen_range(0..4)]).collect();
    let rows: Vec<(String, Vec<u8>)> = (0..n_taxa)
        .map(|i| {
            let seq: Vec<u8> = ancestor
                .iter()
                .map(|&b| if rng.gen_bool(0.15) { bases[rng.gen_range(0..4)] } else { b })
                .collect();
            (format!("t{}", i), seq)
        })
        .collect();
    Alignment::new(rows).unwrap()
}

/// Random topology: repeatedly split a random leaf.
fn random_tree(n_taxa: usize, seed: u64) -> PhyloTree {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tree = PhyloTree::new();
    let first = tree.add_child(0, None, Some(rng.gen_range(0.01..0.2))).unwrap();
    let second = tree.add_child(0, None, Some(rng.gen_range(0.01..0.2))).unwrap();
    let mut open = vec![first, second];
    while open.len() < n_taxa {
        let i = rng.gen_range(0..open.len());
        let parent = open.swap_remove(i);
        for _ in 0..2 {
            open.push(tree.add_child(parent, None, Some(rng.gen_range(0.01..0.2))).unwrap());
        }
    }
    for (i, id) in open.into_iter().enumerate() {
        tree.get_node_mut(id).unwrap().name = Some(format!("t{}", i));
    }
    tree
}

// =========================================================================
// Benchmarks
// =========================================================================

fn bench_full_vs_incremental(c: &mut Criterion) {
    let model = Hky85Model::new(2.5, [0.3, 0.2, 0.2, 0.3]).unwrap();
    let rates = RateDistribution::discrete_gamma(0.5, 4).unwrap();
    let n_sites = 500;

    let mut group = c.benchmark_group("log_likelihood");
    for &n_taxa in &[16usize, 64, 256] {
        let alignment = random_alignment(n_taxa, n_sites, 7);
        let tree = random_tree(n_taxa, 11);
        let edges = tree.edges();
        group.throughput(Throughput::Elements((n_taxa * n_sites) as u64));

        group.bench_with_input(BenchmarkId::new("full", n_taxa), &tree, |b, tree| {
            b.iter(|| {
                let mut engine = PartialLikelihoodEngine::new(&alignment, &model, &rates).unwrap();
                black_box(engine.initialize(&model, &rates, tree).unwrap())
            });
        });

        let mut engine = PartialLikelihoodEngine::new(&alignment, &model, &rates).unwrap();
        engine.initialize(&model, &rates, &tree).unwrap();
        let mut working = tree.clone();
        let mut rng = StdRng::seed_from_u64(3);
        group.bench_function(BenchmarkId::new("one_edge_changed", n_taxa), |b| {
            b.iter(|| {
                let edge = edges[rng.gen_range(0..edges.len())];
                working
                    .set_branch_length(edge, rng.gen_range(0.01..0.2))
                    .unwrap();
                black_box(engine.calculate_log_likelihood(&working).unwrap())
            });
        });

        group.bench_function(BenchmarkId::new("unchanged", n_taxa), |b| {
            b.iter(|| black_box(engine.calculate_log_likelihood(&working).unwrap()));
        });
    }
    group.finish();
}

fn bench_mid_edge(c: &mut Criterion) {
    let model = Hky85Model::new(2.5, [0.25; 4]).unwrap();
    let rates = RateDistribution::discrete_gamma(1.0, 4).unwrap();
    let n_taxa = 64;

    let alignment = random_alignment(n_taxa, 500, 19);
    let tree = random_tree(n_taxa, 23);
    let mut group = c.benchmark_group("mid_edge_partials");
    group.bench_function("cold", |b| {
        b.iter(|| {
            let mut engine = PartialLikelihoodEngine::new(&alignment, &model, &rates).unwrap();
            engine.initialize(&model, &rates, &tree).unwrap();
            black_box(engine.mid_edge_partials().unwrap().len())
        });
    });
    let mut engine = PartialLikelihoodEngine::new(&alignment, &model, &rates).unwrap();
    engine.initialize(&model, &rates, &tree).unwrap();
    engine.mid_edge_partials().unwrap();
    group.bench_function("cached", |b| {
        b.iter(|| black_box(engine.mid_edge_partials().unwrap().len()));
    });
    group.finish();
}

criterion_group!(benches, bench_full_vs_incremental, bench_mid_edge);
criterion_main!(benches);
