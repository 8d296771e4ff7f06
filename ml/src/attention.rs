//! Multi-head attention, the branch separated attention layer and the transformer block.
use ndarray::*;

use crate::{
    activation_functions::gelu,
    branches::{concat_tokens, token_chunk},
    fully_connected::FeedforwardLayer,
    normalization::{LayerNormLayer, BLOCK_EPS},
    weight_loader::{WeightLoader, WeightResult},
    ImagePrecision, TokenSequence,
};

/// `softmax(q k^T * scale) v` for a single head.
pub fn scaled_dot_product_attention(
    q: ArrayView2<ImagePrecision>,
    k: ArrayView2<ImagePrecision>,
    v: ArrayView2<ImagePrecision>,
    scale: ImagePrecision,
) -> Array2<ImagePrecision> {
    let mut scores = q.dot(&k.t());
    scores *= scale;
    for mut row in scores.outer_iter_mut() {
        let max = row.fold(ImagePrecision::NEG_INFINITY, |m, v| m.max(*v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
    scores.dot(&v)
}

/// Runs attention independently on `num_heads` equal column slices of q, k and v
/// and writes each head's result back into the same columns.
pub fn multi_head_attention(
    q: ArrayView2<ImagePrecision>,
    k: ArrayView2<ImagePrecision>,
    v: ArrayView2<ImagePrecision>,
    num_heads: usize,
    scale: ImagePrecision,
) -> Array2<ImagePrecision> {
    let (num_queries, dim) = q.dim();
    let head_dim = dim / num_heads;
    let mut out = Array2::zeros((num_queries, dim));
    for h in 0..num_heads {
        let head = scaled_dot_product_attention(
            q.slice(s![.., h * head_dim..(h + 1) * head_dim]),
            k.slice(s![.., h * head_dim..(h + 1) * head_dim]),
            v.slice(s![.., h * head_dim..(h + 1) * head_dim]),
            scale,
        );
        out.slice_mut(s![.., h * head_dim..(h + 1) * head_dim])
            .assign(&head);
    }
    out
}

/// Two layer perceptron with a GELU in between.
#[derive(Debug, Clone)]
pub struct Mlp {
    fc1: FeedforwardLayer,
    fc2: FeedforwardLayer,
}

impl Mlp {
    pub fn from_loader(
        loader: &mut impl WeightLoader,
        name: &str,
        dim: usize,
        hidden_dim: usize,
    ) -> WeightResult<Mlp> {
        Ok(Mlp {
            fc1: FeedforwardLayer::from_loader(
                loader,
                &format!("{}.fc1", name),
                dim,
                hidden_dim,
                true,
            )?,
            fc2: FeedforwardLayer::from_loader(
                loader,
                &format!("{}.fc2", name),
                hidden_dim,
                dim,
                true,
            )?,
        })
    }

    pub fn forward_pass(&self, x: &TokenSequence) -> TokenSequence {
        self.fc2.forward_pass(&gelu(&self.fc1.forward_pass(x)))
    }
}

/// Shape parameters shared by the attention layers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttentionParameters {
    pub dim: usize,
    pub num_heads: usize,
    pub qkv_bias: bool,
    pub scale: ImagePrecision,
    pub num_branch: usize,
}

/// Branch separated attention.
///
/// For an input of `1 + num_branch * n` tokens:
/// 1. the class token queries all tokens through `fuse_q` / `fuse_kv`, and the
///    result is added to it;
/// 2. branch `i` runs full attention (`qkv_i`) over the updated class token
///    followed by its `n` tokens, drops the class row and projects with `proj_i`;
/// 3. the updated class token is projected with `cls_proj` and put in front.
#[derive(Debug, Clone)]
pub struct BranchAttention {
    params: AttentionParameters,
    branch_qkv: Vec<FeedforwardLayer>,
    branch_proj: Vec<FeedforwardLayer>,
    fuse_q: FeedforwardLayer,
    fuse_kv: FeedforwardLayer,
    cls_proj: FeedforwardLayer,
}

impl BranchAttention {
    pub fn from_loader(
        loader: &mut impl WeightLoader,
        name: &str,
        params: AttentionParameters,
    ) -> WeightResult<BranchAttention> {
        let dim = params.dim;
        let mut branch_qkv = Vec::with_capacity(params.num_branch);
        let mut branch_proj = Vec::with_capacity(params.num_branch);
        for i in 0..params.num_branch {
            branch_qkv.push(FeedforwardLayer::from_loader(
                loader,
                &format!("{}.qkv_{}", name, i),
                dim,
                3 * dim,
                params.qkv_bias,
            )?);
            branch_proj.push(FeedforwardLayer::from_loader(
                loader,
                &format!("{}.proj_{}", name, i),
                dim,
                dim,
                true,
            )?);
        }
        let fuse_q = FeedforwardLayer::from_loader(
            loader,
            &format!("{}.fuse_q", name),
            dim,
            dim,
            params.qkv_bias,
        )?;
        let fuse_kv = FeedforwardLayer::from_loader(
            loader,
            &format!("{}.fuse_kv", name),
            dim,
            2 * dim,
            params.qkv_bias,
        )?;
        let cls_proj =
            FeedforwardLayer::from_loader(loader, &format!("{}.cls_proj", name), dim, dim, true)?;
        Ok(BranchAttention {
            params,
            branch_qkv,
            branch_proj,
            fuse_q,
            fuse_kv,
            cls_proj,
        })
    }

    pub fn forward_pass(&self, x: &TokenSequence) -> TokenSequence {
        let dim = self.params.dim;
        let heads = self.params.num_heads;
        let scale = self.params.scale;
        debug_assert_eq!(
            (x.nrows() - 1) % self.params.num_branch,
            0,
            "Tokens are not evenly split between branches"
        );

        let cls = x.slice(s![0..1, ..]);
        let q = self.fuse_q.forward_pass(cls);
        let kv = self.fuse_kv.forward_pass(x);
        let gathered = multi_head_attention(
            q.view(),
            kv.slice(s![.., ..dim]),
            kv.slice(s![.., dim..]),
            heads,
            scale,
        );
        let cls = gathered + cls;

        let mut parts = Vec::with_capacity(self.params.num_branch + 1);
        parts.push(self.cls_proj.forward_pass(&cls));
        for (i, (qkv_layer, proj)) in self
            .branch_qkv
            .iter()
            .zip(self.branch_proj.iter())
            .enumerate()
        {
            let tokens = token_chunk(x, i, self.params.num_branch);
            let sequence = concat_tokens(&[cls.view(), tokens]);
            let qkv = qkv_layer.forward_pass(&sequence);
            let attended = multi_head_attention(
                qkv.slice(s![.., ..dim]),
                qkv.slice(s![.., dim..2 * dim]),
                qkv.slice(s![.., 2 * dim..]),
                heads,
                scale,
            );
            parts.push(proj.forward_pass(attended.slice(s![1.., ..])));
        }

        let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
        concat_tokens(&views)
    }
}

/// Pre-norm transformer block with branch separated attention:
/// `x = x + attn(norm1(x)); x = x + mlp(norm2(x))`.
#[derive(Debug, Clone)]
pub struct TransformerBlock {
    norm1: LayerNormLayer,
    attn: BranchAttention,
    norm2: LayerNormLayer,
    mlp: Mlp,
}

impl TransformerBlock {
    pub fn from_loader(
        loader: &mut impl WeightLoader,
        name: &str,
        params: AttentionParameters,
        mlp_hidden_dim: usize,
    ) -> WeightResult<TransformerBlock> {
        let dim = params.dim;
        Ok(TransformerBlock {
            norm1: LayerNormLayer::from_loader(loader, &format!("{}.norm1", name), dim, BLOCK_EPS)?,
            attn: BranchAttention::from_loader(loader, &format!("{}.attn", name), params)?,
            norm2: LayerNormLayer::from_loader(loader, &format!("{}.norm2", name), dim, BLOCK_EPS)?,
            mlp: Mlp::from_loader(loader, &format!("{}.mlp", name), dim, mlp_hidden_dim)?,
        })
    }

    pub fn forward_pass(&self, x: &TokenSequence) -> TokenSequence {
        let x = x + &self.attn.forward_pass(&self.norm1.normalize(x));
        let mlp_out = self.mlp.forward_pass(&self.norm2.normalize(&x));
        x + &mlp_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weight_loader::RandomWeightLoader;

    fn params(num_branch: usize) -> AttentionParameters {
        AttentionParameters {
            dim: 4,
            num_heads: 2,
            qkv_bias: false,
            scale: (2.0f32).powf(-0.5),
            num_branch,
        }
    }

    fn tokens(n: usize, dim: usize) -> TokenSequence {
        Array2::from_shape_fn((n, dim), |(t, c)| ((t * 7 + c * 3) % 5) as f32 / 4.0 - 0.5)
    }

    #[test]
    fn test_attention_rows_are_convex_combinations() {
        let q = array![[1.0, 0.0], [0.0, 1.0]];
        let k = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let v = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let out = scaled_dot_product_attention(q.view(), k.view(), v.view(), 1.0);
        assert_eq!(out.dim(), (2, 2));
        // row 0 scores [1, 0, 1] -> weights [e, 1, e] / (2e + 1)
        let e = std::f32::consts::E;
        let w = [e / (2. * e + 1.), 1. / (2. * e + 1.), e / (2. * e + 1.)];
        let expected = w[0] * 1.0 + w[1] * 3.0 + w[2] * 5.0;
        assert!((out[[0, 0]] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_attention_with_uniform_scores_averages() {
        let q = array![[0.0, 0.0]];
        let k = array![[1.0, 2.0], [3.0, 4.0]];
        let v = array![[1.0, 10.0], [3.0, 20.0]];
        let out = scaled_dot_product_attention(q.view(), k.view(), v.view(), 0.5);
        assert_eq!(out, array![[2.0, 15.0]]);
    }

    #[test]
    fn test_multi_head_splits_columns() {
        let q = array![[1.0, 0.0, 0.0, 0.0]];
        let k = array![[1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 0.0]];
        let v = array![[1.0, 1.0, 5.0, 5.0], [0.0, 0.0, 1.0, 1.0]];
        let out = multi_head_attention(q.view(), k.view(), v.view(), 2, 1.0);
        // second head sees zero scores and averages its value columns
        assert!((out[[0, 2]] - 3.0).abs() < 1e-6);
        assert!((out[[0, 3]] - 3.0).abs() < 1e-6);
        // first head weights row 0 with e / (e + 1)
        let e = std::f32::consts::E;
        assert!((out[[0, 0]] - e / (e + 1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_branch_attention_keeps_shape() {
        let mut loader = RandomWeightLoader::new(0);
        let attn = BranchAttention::from_loader(&mut loader, "attn", params(3)).unwrap();
        let x = tokens(1 + 3 * 4, 4);
        assert_eq!(attn.forward_pass(&x).dim(), (13, 4));
    }

    /// Random parameters, except that the class token gathering is switched off.
    struct NoGathering(RandomWeightLoader);

    impl WeightLoader for NoGathering {
        fn get_weight<D, Sh>(
            &mut self,
            param_name: &str,
            shape: Sh,
            init: crate::initializers::Init,
        ) -> WeightResult<Array<f32, D>>
        where
            D: Dimension,
            Sh: Into<StrideShape<D>>,
        {
            let weight = self.0.get_weight(param_name, shape, init)?;
            if param_name.contains("fuse_") {
                Ok(weight.mapv(|_| 0.0))
            } else {
                Ok(weight)
            }
        }
    }

    #[test]
    fn test_branches_only_see_their_own_tokens() {
        let mut loader = NoGathering(RandomWeightLoader::new(1));
        let attn = BranchAttention::from_loader(&mut loader, "attn", params(2)).unwrap();
        let x = tokens(1 + 2 * 3, 4);
        let mut perturbed = x.clone();
        // change a token of branch 1
        perturbed.row_mut(5).mapv_inplace(|v| v + 1.0);

        let before = attn.forward_pass(&x);
        let after = attn.forward_pass(&perturbed);

        let changed = |a: ArrayView2<f32>, b: ArrayView2<f32>| {
            a.iter().zip(b.iter()).any(|(x, y)| (x - y).abs() > 1e-6)
        };
        // class token and branch 0 are untouched, branch 1 changes
        assert!(!changed(before.slice(s![0..4, ..]), after.slice(s![0..4, ..])));
        assert!(changed(before.slice(s![4.., ..]), after.slice(s![4.., ..])));
    }

    #[test]
    fn test_transformer_block_with_zero_projections_is_identity() {
        // zero weights everywhere make both residual branches add only biases, which are zero
        struct Zeros;
        impl WeightLoader for Zeros {
            fn get_weight<D, Sh>(
                &mut self,
                param_name: &str,
                shape: Sh,
                _init: crate::initializers::Init,
            ) -> WeightResult<Array<f32, D>>
            where
                D: Dimension,
                Sh: Into<StrideShape<D>>,
            {
                let shape: StrideShape<D> = shape.into();
                let len = shape.raw_dim().size();
                let value = if param_name.ends_with("norm1.weight") || param_name.ends_with("norm2.weight") {
                    1.0
                } else {
                    0.0
                };
                Ok(Array::from_shape_vec(shape, vec![value; len])?)
            }
        }

        let block = TransformerBlock::from_loader(&mut Zeros, "block", params(2), 8).unwrap();
        let x = tokens(5, 4);
        let y = block.forward_pass(&x);
        assert!(x.iter().zip(y.iter()).all(|(a, b)| (a - b).abs() < 1e-6));
    }

    /// Fixed, distinct parameters per name, so that swapped projections show up.
    struct Patterned;

    fn patterned(param_name: &str, len: usize) -> Vec<f32> {
        let seed = param_name.bytes().fold(0usize, |h, b| (h * 31 + b as usize) % 97);
        (0..len)
            .map(|i| ((i * 7 + seed) % 13) as f32 / 13.0 - 0.45)
            .collect()
    }

    impl WeightLoader for Patterned {
        fn get_weight<D, Sh>(
            &mut self,
            param_name: &str,
            shape: Sh,
            _init: crate::initializers::Init,
        ) -> WeightResult<Array<f32, D>>
        where
            D: Dimension,
            Sh: Into<StrideShape<D>>,
        {
            let shape: StrideShape<D> = shape.into();
            let len = shape.raw_dim().size();
            Ok(Array::from_shape_vec(shape, patterned(param_name, len))?)
        }
    }

    fn linear(x: ArrayView2<f32>, name: &str, inputs: usize, outputs: usize) -> Array2<f32> {
        let values = patterned(&format!("{}.weight", name), outputs * inputs);
        let w = Array2::from_shape_vec((outputs, inputs), values).unwrap();
        x.dot(&w.t())
    }

    fn linear_with_bias(x: ArrayView2<f32>, name: &str, dim: usize) -> Array2<f32> {
        let b = Array1::from(patterned(&format!("{}.bias", name), dim));
        linear(x, name, dim, dim) + &b
    }

    /// Two heads over four columns.
    fn heads(
        q: ArrayView2<f32>,
        k: ArrayView2<f32>,
        v: ArrayView2<f32>,
        scale: f32,
    ) -> Array2<f32> {
        let left = scaled_dot_product_attention(
            q.slice(s![.., 0..2]),
            k.slice(s![.., 0..2]),
            v.slice(s![.., 0..2]),
            scale,
        );
        let right = scaled_dot_product_attention(
            q.slice(s![.., 2..4]),
            k.slice(s![.., 2..4]),
            v.slice(s![.., 2..4]),
            scale,
        );
        concatenate(Axis(1), &[left.view(), right.view()]).unwrap()
    }

    #[test]
    fn test_branch_attention_values() {
        let p = params(2);
        let attn = BranchAttention::from_loader(&mut Patterned, "attn", p).unwrap();
        // class token plus two tokens per branch
        let x = tokens(5, 4);

        // the class token gathers from every token and keeps a residual
        let q = linear(x.slice(s![0..1, ..]), "attn.fuse_q", 4, 4);
        let kv = linear(x.view(), "attn.fuse_kv", 4, 8);
        let cls = heads(q.view(), kv.slice(s![.., 0..4]), kv.slice(s![.., 4..8]), p.scale)
            + &x.slice(s![0..1, ..]);

        let mut expected = vec![linear_with_bias(cls.view(), "attn.cls_proj", 4)];
        for i in 0..2 {
            let rows = x.slice(s![1 + 2 * i..3 + 2 * i, ..]);
            let sequence = concatenate(Axis(0), &[cls.view(), rows]).unwrap();
            let qkv = linear(sequence.view(), &format!("attn.qkv_{}", i), 4, 12);
            let attended = heads(
                qkv.slice(s![.., 0..4]),
                qkv.slice(s![.., 4..8]),
                qkv.slice(s![.., 8..12]),
                p.scale,
            );
            expected.push(linear_with_bias(
                attended.slice(s![1.., ..]),
                &format!("attn.proj_{}", i),
                4,
            ));
        }
        let views: Vec<_> = expected.iter().map(|e| e.view()).collect();
        let expected = concatenate(Axis(0), &views).unwrap();

        let out = attn.forward_pass(&x);
        assert_eq!(out.dim(), (5, 4));
        assert!(
            out.iter().zip(expected.iter()).all(|(a, b)| (a - b).abs() < 1e-5),
            "{:?} != {:?}",
            out,
            expected
        );
    }

    #[test]
    fn test_mlp_shape() {
        let mut loader = RandomWeightLoader::new(2);
        let mlp = Mlp::from_loader(&mut loader, "mlp", 4, 16).unwrap();
        assert_eq!(mlp.forward_pass(&tokens(3, 4)).dim(), (3, 4));
    }
}
