use criterion::{criterion_group, criterion_main, Criterion};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use smfuzz::access::{GuestMemory, RegisterFile};
use smfuzz::descriptor::{parse_descriptor, HarnessDescriptor};
use smfuzz::harness::{GenericHarness, Harness, HarnessOptions, SynthesisHarness};
use smfuzz::input::FuzzInput;

const DESCRIPTOR: &str = "\
BasicBlock: 0
0,3254779904,u32
1,,paddr_t
2,,size_t
3,,uint64_t
BasicBlock: 1
0,,u32
1,100,
2,,donotfill
";

fn inputs() -> Vec<Vec<u8>> {
    let mut rng = SmallRng::seed_from_u64(0x5eed);
    (0..256)
        .map(|_| {
            let len = rng.gen_range(0..128);
            (0..len).map(|_| rng.gen()).collect()
        })
        .collect()
}

fn run(h: &dyn Harness, inputs: &[Vec<u8>], mem: &GuestMemory) {
    let guest = mem.surface();
    for data in inputs {
        let mut regs = RegisterFile::new();
        h.apply(&mut regs, &mut FuzzInput::new(data), &guest);
    }
    mem.clear_record();
}

pub fn bench_inject(c: &mut Criterion) {
    let inputs = inputs();
    let mem = GuestMemory::new();

    let generic = GenericHarness::new(HarnessOptions::default());
    c.bench_function("Generic", |b| b.iter(|| run(&generic, &inputs, &mem)));

    let rows = parse_descriptor(DESCRIPTOR).unwrap();
    let desc = HarnessDescriptor::new(rows).unwrap();
    let synthesis = SynthesisHarness::new(desc, HarnessOptions::default());
    c.bench_function("Synthesis", |b| b.iter(|| run(&synthesis, &inputs, &mem)));
}

criterion_group!(benches, bench_inject);
criterion_main!(benches);
