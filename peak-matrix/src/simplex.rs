use ndarray::Array2;

/// Orthonormal Gram-Schmidt basis of the k-simplex's ILR hyperplane.
///
/// Column j contrasts the first (j+1) coordinates against coordinate j+1,
/// scaled so columns are unit-norm and mutually orthogonal. Projecting
/// compositions onto this (k, k-1) basis yields Euclidean coordinates that
/// preserve the compositional geometry.
pub fn gram_schmidt_basis(k: usize) -> Array2<f32> {
    assert!(k >= 2, "the ILR basis needs at least two parts");

    let mut basis = Array2::<f32>::zeros((k, k - 1));
    for j in 0..(k - 1) {
        let i = j + 1;
        let scale = (i as f32 / (i as f32 + 1.0)).sqrt();
        for r in 0..i {
            basis[[r, j]] = scale / i as f32;
        }
        basis[[i, j]] = -scale;
    }
    basis
}

/// Box-Cox power transform `(x^a - 1) / a`.
pub fn boxcox(x: f32, a: f32) -> f32 {
    (x.powf(a) - 1.0) / a
}

/// Elementwise Box-Cox over a matrix.
pub fn boxcox_mat(x: &Array2<f32>, a: f32) -> Array2<f32> {
    x.mapv(|v| boxcox(v, a))
}
