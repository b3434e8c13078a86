/// Dot product of two vectors.
///
/// Uses f64 intermediate precision. Returns 0.0 on dimension mismatch.
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot: f64 = 0.0;
    for i in 0..a.len() {
        dot += a[i] as f64 * b[i] as f64;
    }
    dot as f32
}

/// Compute the cosine similarity between two vectors.
///
/// Returns a value in `[-1, 1]` where 1 means identical direction and
/// -1 means opposite direction.
///
/// Returns 0.0 for zero vectors or dimension mismatches.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot: f64 = 0.0;
    let mut norm_a: f64 = 0.0;
    let mut norm_b: f64 = 0.0;

    for i in 0..a.len() {
        let ai = a[i] as f64;
        let bi = b[i] as f64;
        dot += ai * bi;
        norm_a += ai * ai;
        norm_b += bi * bi;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    // Clamp to [-1, 1] to handle floating point errors.
    similarity.clamp(-1.0, 1.0) as f32
}

/// Euclidean (L2) distance between two vectors.
///
/// Returns `f32::INFINITY` on dimension mismatch so a malformed vector
/// never wins a nearest-neighbour comparison.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    let mut sum: f64 = 0.0;
    for i in 0..a.len() {
        let d = a[i] as f64 - b[i] as f64;
        sum += d * d;
    }
    sum.sqrt() as f32
}

/// Scales `v` in place to unit L2 norm. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f64 = v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt();
    if norm > 0.0 {
        let s = (1.0 / norm) as f32;
        for x in v.iter_mut() {
            *x *= s;
        }
    }
}

/// Returns an L2-normalized copy of `v`.
pub fn normalized(v: &[f32]) -> Vec<f32> {
    let mut cp = v.to_vec();
    l2_normalize(&mut cp);
    cp
}
