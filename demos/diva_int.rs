use diva_filter::DivaInt;
use diva_filter::data_gen::generate_uniform_u64_seeded;

fn main() {
    let infix_size = 8;
    let seed = 1;
    let load_factor = 0.95;

    let mut keys = generate_uniform_u64_seeded(100_000, 10);
    keys.sort_unstable();
    keys.dedup();

    let mut filter =
        DivaInt::new_fixed_width(infix_size, keys.iter().copied(), 8, seed, load_factor)
            .expect("generated keys are sorted");
    println!("loaded {} keys into {} boundaries", keys.len(), filter.boundary_count());

    for key in 0..10u64 {
        filter.insert_u64(key);
    }
    println!("point(3) = {}", filter.point_query_u64(3));
    println!("range(10..20) = {}", filter.range_query_u64(10, 20));

    // measure the empirical false-positive rate on non-members
    let probes = generate_uniform_u64_seeded(100_000, 11);
    let mut false_positives = 0usize;
    let mut probe_count = 0usize;
    for &probe in &probes {
        if keys.binary_search(&probe).is_ok() {
            continue;
        }
        probe_count += 1;
        false_positives += filter.point_query_u64(probe) as usize;
    }
    println!(
        "false-positive rate: {:.5} ({} / {} probes)",
        false_positives as f64 / probe_count as f64,
        false_positives,
        probe_count
    );

    // serialize and restore
    let mut blob = Vec::new();
    let written = filter.serialize(&mut blob);
    let restored = DivaInt::deserialize(&blob).expect("fresh blob");
    println!(
        "serialized {} bytes, restored filter agrees: {}",
        written,
        restored.point_query_u64(3)
    );
}
