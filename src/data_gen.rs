use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::thread_rng;
use rand_distr::{Distribution, Normal, Uniform};

// default = 64k keys
const DEFAULT_COUNT: usize = 1 << 16;

pub fn generate_normal_u64(count: usize, mean: f64, std_dev: f64) -> Vec<u64> {
    let normal = Normal::new(mean, std_dev).unwrap();
    let mut rng = thread_rng();

    (0..count)
        .map(|_| {
            let sample: f64 = normal.sample(&mut rng);
            sample.max(0.0).min(u64::MAX as f64) as u64
        })
        .collect()
}

pub fn generate_uniform_u64(count: usize, min: u64, max: u64) -> Vec<u64> {
    let uniform = Uniform::new_inclusive(min, max);
    let mut rng = thread_rng();

    (0..count).map(|_| uniform.sample(&mut rng)).collect()
}

/// Seeded variant for reproducible workloads.
pub fn generate_uniform_u64_seeded(count: usize, seed: u64) -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count).map(|_| rng.r#gen::<u64>()).collect()
}

pub fn generate_smooth_u64(count: Option<usize>) -> Vec<u64> {
    let count = count.unwrap_or(DEFAULT_COUNT);
    let mean = (u64::MAX / 2) as f64;
    let std_dev = (u64::MAX / 6) as f64;
    generate_normal_u64(count, mean, std_dev)
}

pub fn generate_strings(count: usize, min_len: usize, max_len: usize) -> Vec<String> {
    let mut rng = thread_rng();
    let len_dist = Uniform::new_inclusive(min_len, max_len);

    (0..count)
        .map(|_| {
            let len = len_dist.sample(&mut rng);
            (0..len)
                .map(|_| rng.gen_range(b'a'..=b'z') as char)
                .collect()
        })
        .collect()
}

/// Seeded variant for reproducible byte-string workloads.
pub fn generate_byte_strings_seeded(
    count: usize,
    min_len: usize,
    max_len: usize,
    seed: u64,
) -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let len = rng.gen_range(min_len..=max_len);
            (0..len).map(|_| rng.gen_range(1..=u8::MAX)).collect()
        })
        .collect()
}
