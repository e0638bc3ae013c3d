//! Address space benchmarks

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use nos_vm::{AllocatedMemory, FaultFlags, HoleTree, MapFlags, MemorySlice, SpaceLayout, VirtualSpace};
use nos_vm_api::testing::{SimulatedPhysicalMemory, SoftPageTable};
use nos_vm_api::{WorkQueue, PAGE_SIZE};

fn bench_hole_allocation(c: &mut Criterion) {
    c.bench_function("hole_allocate_release_fragmented", |b| {
        b.iter_batched(
            || {
                let mut tree = HoleTree::with_hole(0x10_0000, 1 << 30);
                // Punch every other page so the tree holds many small holes.
                let pages: Vec<_> = (0..512).map(|_| tree.allocate_bottom(PAGE_SIZE).unwrap()).collect();
                for page in pages.iter().step_by(2) {
                    tree.release(*page, PAGE_SIZE);
                }
                tree
            },
            |mut tree| {
                let address = tree.allocate_bottom(black_box(4 * PAGE_SIZE)).unwrap();
                tree.release(address, 4 * PAGE_SIZE);
                black_box(tree)
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("hole_allocate_top", |b| {
        let mut tree = HoleTree::with_hole(0x10_0000, 1 << 30);
        b.iter(|| {
            let address = tree.allocate_top(black_box(PAGE_SIZE)).unwrap();
            tree.release(address, PAGE_SIZE);
        })
    });
}

fn bench_fault_path(c: &mut Criterion) {
    const PAGES: usize = 64;

    c.bench_function("fault_anonymous_pages", |b| {
        b.iter_batched(
            || {
                let wq = WorkQueue::new();
                let memory = Arc::new(SimulatedPhysicalMemory::new(PAGES));
                let space = VirtualSpace::new(Arc::new(SoftPageTable::new()), wq.clone(), SpaceLayout::user()).unwrap();
                let view = Arc::new(AllocatedMemory::new(memory, PAGES * PAGE_SIZE));
                let mapped = {
                    let space = space.clone();
                    let flags = MapFlags::PROT_READ | MapFlags::PROT_WRITE;
                    wq.spawn(async move { space.map(MemorySlice::whole(view), 0, 0, PAGES * PAGE_SIZE, flags).await })
                };
                wq.run();
                (wq, space, mapped.try_take().unwrap().unwrap())
            },
            |(wq, space, address)| {
                let faults = wq.spawn(async move {
                    for page in 0..PAGES {
                        space.handle_fault(address + page * PAGE_SIZE, FaultFlags::WRITE).await;
                    }
                });
                wq.run();
                black_box(faults.is_finished())
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_hole_allocation, bench_fault_path);

criterion_main!(benches);
