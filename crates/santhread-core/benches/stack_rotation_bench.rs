//! Current-stack resolution and rotation benchmarks.

use criterion::{Criterion, criterion_group, criterion_main};
use santhread_core::StackDescriptorSet;
use santhread_core::platform::current_stack_bounds;

fn bench_current_stack(c: &mut Criterion) {
    let bounds = current_stack_bounds().unwrap();
    let set = StackDescriptorSet::new();
    set.set_user_stack(bounds.bottom, bounds.size()).unwrap();
    set.set_user_stack(0x1000, 0x1000).unwrap();

    let mut group = c.benchmark_group("current_stack");
    group.bench_function("on_previous", |b| {
        b.iter(|| criterion::black_box(set.current_stack()));
    });
    group.bench_function("addr_is_in_stack", |b| {
        b.iter(|| criterion::black_box(set.addr_is_in_stack(criterion::black_box(0x1800))));
    });
    group.finish();
}

fn bench_rotation(c: &mut Criterion) {
    let set = StackDescriptorSet::new();
    set.set_user_stack(0x10_0000, 0x1_0000).unwrap();
    c.bench_function("set_then_restore", |b| {
        b.iter(|| {
            set.set_user_stack(0x20_0000, 0x2000).unwrap();
            set.restore_previous_user_stack().unwrap();
        });
    });
}

criterion_group!(benches, bench_current_stack, bench_rotation);
criterion_main!(benches);
