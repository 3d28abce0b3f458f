//! Flux DiT built for training
//!
//! Same module tree and weight names as the reference Flux checkpoints
//! (`img_in`, `double_blocks.N.img_attn.qkv`, `final_layer.adaLN_modulation.1`,
//! ...), but every norm and the attention softmax are composed from ops with
//! a backward pass, so gradients reach all weights.

use candle_core::{DType, IndexOp, Module, Tensor, D};
use candle_nn::{linear, linear_b, Linear, VarBuilder};
use candle_transformers::models::flux::model::Config as FluxConfig;

use super::norms::{LayerNorm, RmsNorm};

const NORM_EPS: f64 = 1e-6;
const TIME_EMBED_DIM: usize = 256;

fn push_linear(params: &mut Vec<Tensor>, layer: &Linear) {
    params.push(layer.weight().clone());
    if let Some(bias) = layer.bias() {
        params.push(bias.clone());
    }
}

/// Sinusoidal embedding of `t` in [0, 1].
fn timestep_embedding(t: &Tensor, dim: usize, dtype: DType) -> candle_core::Result<Tensor> {
    const TIME_FACTOR: f64 = 1000.;
    const MAX_PERIOD: f64 = 10000.;
    if dim % 2 == 1 {
        candle_core::bail!("{dim} is odd")
    }
    let dev = t.device();
    let half = dim / 2;
    let t = (t.to_dtype(DType::F32)? * TIME_FACTOR)?;
    let arange = Tensor::arange(0, half as u32, dev)?.to_dtype(DType::F32)?;
    let freqs = (arange * (-MAX_PERIOD.ln() / half as f64))?.exp()?;
    let args = t.unsqueeze(1)?.broadcast_mul(&freqs.unsqueeze(0)?)?;
    Tensor::cat(&[args.cos()?, args.sin()?], D::Minus1)?.to_dtype(dtype)
}

fn rope(pos: &Tensor, dim: usize, theta: usize) -> candle_core::Result<Tensor> {
    if dim % 2 == 1 {
        candle_core::bail!("{dim} is odd")
    }
    let theta = theta as f64;
    let inv_freq: Vec<f32> = (0..dim)
        .step_by(2)
        .map(|i| 1f32 / theta.powf(i as f64 / dim as f64) as f32)
        .collect();
    let inv_freq_len = inv_freq.len();
    let inv_freq = Tensor::from_vec(inv_freq, (1, 1, inv_freq_len), pos.device())?.to_dtype(pos.dtype())?;
    let freqs = pos.unsqueeze(2)?.broadcast_mul(&inv_freq)?;
    let cos = freqs.cos()?;
    let sin = freqs.sin()?;
    let out = Tensor::stack(&[&cos, &sin.neg()?, &sin, &cos], 3)?;
    let (b, n, d, _) = out.dims4()?;
    out.reshape((b, n, d, 2, 2))
}

fn apply_rope(x: &Tensor, freq_cis: &Tensor) -> candle_core::Result<Tensor> {
    let dims = x.dims().to_vec();
    let (b, heads, seq_len, head_dim) = x.dims4()?;
    let x = x.reshape((b, heads, seq_len, head_dim / 2, 2))?;
    let x0 = x.narrow(D::Minus1, 0, 1)?;
    let x1 = x.narrow(D::Minus1, 1, 1)?;
    let fr0 = freq_cis.get_on_dim(D::Minus1, 0)?;
    let fr1 = freq_cis.get_on_dim(D::Minus1, 1)?;
    (fr0.broadcast_mul(&x0)? + fr1.broadcast_mul(&x1)?)?.reshape(dims)
}

/// Rotary attention over [B, heads, L, head_dim], returned as [B, L, heads * head_dim].
fn attention(q: &Tensor, k: &Tensor, v: &Tensor, pe: &Tensor) -> candle_core::Result<Tensor> {
    let q = apply_rope(q, pe)?.contiguous()?;
    let k = apply_rope(k, pe)?.contiguous()?;
    let scale = 1.0 / (q.dim(D::Minus1)? as f64).sqrt();
    let scores = (q.matmul(&k.t()?)? * scale)?;
    let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
    probs.matmul(&v.contiguous()?)?.transpose(1, 2)?.flatten_from(2)
}

/// Positional frequencies for (axis0, row, col) ids.
struct EmbedNd {
    theta: usize,
    axes_dim: Vec<usize>,
}

impl Module for EmbedNd {
    fn forward(&self, ids: &Tensor) -> candle_core::Result<Tensor> {
        let n_axes = ids.dim(D::Minus1)?;
        if n_axes != self.axes_dim.len() {
            candle_core::bail!("ids have {n_axes} axes, expected {}", self.axes_dim.len())
        }
        let emb = (0..n_axes)
            .map(|idx| rope(&ids.get_on_dim(D::Minus1, idx)?, self.axes_dim[idx], self.theta))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Tensor::cat(&emb, 2)?.unsqueeze(1)
    }
}

struct MlpEmbedder {
    in_layer: Linear,
    out_layer: Linear,
}

impl MlpEmbedder {
    fn new(in_sz: usize, h_sz: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            in_layer: linear(in_sz, h_sz, vb.pp("in_layer"))?,
            out_layer: linear(h_sz, h_sz, vb.pp("out_layer"))?,
        })
    }

    fn params(&self, params: &mut Vec<Tensor>) {
        push_linear(params, &self.in_layer);
        push_linear(params, &self.out_layer);
    }
}

impl Module for MlpEmbedder {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        xs.apply(&self.in_layer)?.silu()?.apply(&self.out_layer)
    }
}

struct QkNorm {
    query_norm: RmsNorm,
    key_norm: RmsNorm,
}

impl QkNorm {
    fn new(dim: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            query_norm: RmsNorm::new(dim, NORM_EPS, "query_norm.scale", vb.clone())?,
            key_norm: RmsNorm::new(dim, NORM_EPS, "key_norm.scale", vb)?,
        })
    }

    fn params(&self, params: &mut Vec<Tensor>) {
        params.push(self.query_norm.scale().clone());
        params.push(self.key_norm.scale().clone());
    }
}

struct ModulationOut {
    shift: Tensor,
    scale: Tensor,
    gate: Tensor,
}

impl ModulationOut {
    fn scale_shift(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        xs.broadcast_mul(&(&self.scale + 1.)?)?.broadcast_add(&self.shift)
    }

    fn gate(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.gate.broadcast_mul(xs)
    }
}

/// `silu(vec) -> linear -> n x (shift, scale, gate)`.
struct Modulation {
    lin: Linear,
    sets: usize,
}

impl Modulation {
    fn new(dim: usize, sets: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            lin: linear(dim, 3 * sets * dim, vb.pp("lin"))?,
            sets,
        })
    }

    fn forward(&self, vec_: &Tensor) -> candle_core::Result<Vec<ModulationOut>> {
        let ys = vec_.silu()?.apply(&self.lin)?.unsqueeze(1)?.chunk(3 * self.sets, D::Minus1)?;
        if ys.len() != 3 * self.sets {
            candle_core::bail!("unexpected len from chunk {:?}", ys.len())
        }
        Ok(ys
            .chunks(3)
            .map(|c| ModulationOut {
                shift: c[0].clone(),
                scale: c[1].clone(),
                gate: c[2].clone(),
            })
            .collect())
    }
}

struct SelfAttention {
    qkv: Linear,
    norm: QkNorm,
    proj: Linear,
    num_heads: usize,
}

impl SelfAttention {
    fn new(dim: usize, num_heads: usize, qkv_bias: bool, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            qkv: linear_b(dim, dim * 3, qkv_bias, vb.pp("qkv"))?,
            norm: QkNorm::new(dim / num_heads, vb.pp("norm"))?,
            proj: linear(dim, dim, vb.pp("proj"))?,
            num_heads,
        })
    }

    fn qkv(&self, xs: &Tensor) -> candle_core::Result<(Tensor, Tensor, Tensor)> {
        split_qkv(&xs.apply(&self.qkv)?, self.num_heads, &self.norm)
    }

    fn params(&self, params: &mut Vec<Tensor>) {
        push_linear(params, &self.qkv);
        self.norm.params(params);
        push_linear(params, &self.proj);
    }
}

/// [B, L, 3 * dim] -> normalized q, k and raw v as [B, heads, L, head_dim].
fn split_qkv(qkv: &Tensor, num_heads: usize, norm: &QkNorm) -> candle_core::Result<(Tensor, Tensor, Tensor)> {
    let (b, l, _) = qkv.dims3()?;
    let qkv = qkv.reshape((b, l, 3, num_heads, ()))?;
    let q = qkv.i((.., .., 0))?.transpose(1, 2)?;
    let k = qkv.i((.., .., 1))?.transpose(1, 2)?;
    let v = qkv.i((.., .., 2))?.transpose(1, 2)?;
    Ok((q.apply(&norm.query_norm)?, k.apply(&norm.key_norm)?, v))
}

struct Mlp {
    lin1: Linear,
    lin2: Linear,
}

impl Mlp {
    fn new(in_sz: usize, mlp_sz: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            lin1: linear(in_sz, mlp_sz, vb.pp("0"))?,
            lin2: linear(mlp_sz, in_sz, vb.pp("2"))?,
        })
    }

    fn params(&self, params: &mut Vec<Tensor>) {
        push_linear(params, &self.lin1);
        push_linear(params, &self.lin2);
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        xs.apply(&self.lin1)?.gelu()?.apply(&self.lin2)
    }
}

/// One stream (image or text) of a double block.
struct Stream {
    modulation: Modulation,
    norm1: LayerNorm,
    attn: SelfAttention,
    norm2: LayerNorm,
    mlp: Mlp,
}

impl Stream {
    fn new(cfg: &FluxConfig, name: &str, vb: &VarBuilder) -> candle_core::Result<Self> {
        let h_sz = cfg.hidden_size;
        let mlp_sz = (h_sz as f64 * cfg.mlp_ratio) as usize;
        Ok(Self {
            modulation: Modulation::new(h_sz, 2, vb.pp(format!("{name}_mod")))?,
            norm1: LayerNorm::plain(NORM_EPS),
            attn: SelfAttention::new(h_sz, cfg.num_heads, cfg.qkv_bias, vb.pp(format!("{name}_attn")))?,
            norm2: LayerNorm::plain(NORM_EPS),
            mlp: Mlp::new(h_sz, mlp_sz, vb.pp(format!("{name}_mlp")))?,
        })
    }

    fn params(&self, params: &mut Vec<Tensor>) {
        push_linear(params, &self.modulation.lin);
        self.attn.params(params);
        self.mlp.params(params);
    }

    /// Modulations plus q, k, v for the joint attention.
    fn pre_attention(&self, xs: &Tensor, vec_: &Tensor) -> candle_core::Result<(Vec<ModulationOut>, [Tensor; 3])> {
        let mods = self.modulation.forward(vec_)?;
        let modulated = mods[0].scale_shift(&xs.apply(&self.norm1)?)?;
        let (q, k, v) = self.attn.qkv(&modulated)?;
        Ok((mods, [q, k, v]))
    }

    fn post_attention(&self, xs: &Tensor, attn: &Tensor, mods: &[ModulationOut]) -> candle_core::Result<Tensor> {
        let xs = (xs + mods[0].gate(&attn.apply(&self.attn.proj)?)?)?;
        let mlp_in = mods[1].scale_shift(&xs.apply(&self.norm2)?)?;
        &xs + mods[1].gate(&mlp_in.apply(&self.mlp)?)?
    }
}

struct DoubleStreamBlock {
    img: Stream,
    txt: Stream,
}

impl DoubleStreamBlock {
    fn new(cfg: &FluxConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            img: Stream::new(cfg, "img", &vb)?,
            txt: Stream::new(cfg, "txt", &vb)?,
        })
    }

    fn forward(&self, img: &Tensor, txt: &Tensor, vec_: &Tensor, pe: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        let (img_mods, [img_q, img_k, img_v]) = self.img.pre_attention(img, vec_)?;
        let (txt_mods, [txt_q, txt_k, txt_v]) = self.txt.pre_attention(txt, vec_)?;

        let q = Tensor::cat(&[txt_q, img_q], 2)?;
        let k = Tensor::cat(&[txt_k, img_k], 2)?;
        let v = Tensor::cat(&[txt_v, img_v], 2)?;
        let attn = attention(&q, &k, &v, pe)?;
        let txt_len = txt.dim(1)?;
        let txt_attn = attn.narrow(1, 0, txt_len)?;
        let img_attn = attn.narrow(1, txt_len, attn.dim(1)? - txt_len)?;

        Ok((
            self.img.post_attention(img, &img_attn, &img_mods)?,
            self.txt.post_attention(txt, &txt_attn, &txt_mods)?,
        ))
    }
}

struct SingleStreamBlock {
    linear1: Linear,
    linear2: Linear,
    norm: QkNorm,
    pre_norm: LayerNorm,
    modulation: Modulation,
    h_sz: usize,
    mlp_sz: usize,
    num_heads: usize,
}

impl SingleStreamBlock {
    fn new(cfg: &FluxConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let h_sz = cfg.hidden_size;
        let mlp_sz = (h_sz as f64 * cfg.mlp_ratio) as usize;
        Ok(Self {
            linear1: linear(h_sz, h_sz * 3 + mlp_sz, vb.pp("linear1"))?,
            linear2: linear(h_sz + mlp_sz, h_sz, vb.pp("linear2"))?,
            norm: QkNorm::new(h_sz / cfg.num_heads, vb.pp("norm"))?,
            pre_norm: LayerNorm::plain(NORM_EPS),
            modulation: Modulation::new(h_sz, 1, vb.pp("modulation"))?,
            h_sz,
            mlp_sz,
            num_heads: cfg.num_heads,
        })
    }

    fn params(&self, params: &mut Vec<Tensor>) {
        push_linear(params, &self.linear1);
        push_linear(params, &self.linear2);
        self.norm.params(params);
        push_linear(params, &self.modulation.lin);
    }

    fn forward(&self, xs: &Tensor, vec_: &Tensor, pe: &Tensor) -> candle_core::Result<Tensor> {
        let mods = self.modulation.forward(vec_)?;
        let x_mod = mods[0].scale_shift(&xs.apply(&self.pre_norm)?)?.apply(&self.linear1)?;
        let qkv = x_mod.narrow(D::Minus1, 0, 3 * self.h_sz)?;
        let (q, k, v) = split_qkv(&qkv, self.num_heads, &self.norm)?;
        let mlp = x_mod.narrow(D::Minus1, 3 * self.h_sz, self.mlp_sz)?;
        let attn = attention(&q, &k, &v, pe)?;
        let output = Tensor::cat(&[attn, mlp.gelu()?], 2)?.apply(&self.linear2)?;
        xs + mods[0].gate(&output)?
    }
}

struct LastLayer {
    norm_final: LayerNorm,
    linear: Linear,
    ada_ln_modulation: Linear,
}

impl LastLayer {
    fn new(h_sz: usize, out_c: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            norm_final: LayerNorm::plain(NORM_EPS),
            linear: linear(h_sz, out_c, vb.pp("linear"))?,
            ada_ln_modulation: linear(h_sz, 2 * h_sz, vb.pp("adaLN_modulation.1"))?,
        })
    }

    fn forward(&self, xs: &Tensor, vec_: &Tensor) -> candle_core::Result<Tensor> {
        let chunks = vec_.silu()?.apply(&self.ada_ln_modulation)?.chunk(2, 1)?;
        let (shift, scale) = (&chunks[0], &chunks[1]);
        xs.apply(&self.norm_final)?
            .broadcast_mul(&(scale.unsqueeze(1)? + 1.0)?)?
            .broadcast_add(&shift.unsqueeze(1)?)?
            .apply(&self.linear)
    }
}

pub struct FluxDit {
    img_in: Linear,
    txt_in: Linear,
    time_in: MlpEmbedder,
    vector_in: MlpEmbedder,
    guidance_in: Option<MlpEmbedder>,
    pe_embedder: EmbedNd,
    double_blocks: Vec<DoubleStreamBlock>,
    single_blocks: Vec<SingleStreamBlock>,
    final_layer: LastLayer,
}

impl FluxDit {
    pub fn new(cfg: &FluxConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        if cfg.hidden_size % cfg.num_heads != 0 {
            candle_core::bail!("hidden_size {} is not divisible by {} heads", cfg.hidden_size, cfg.num_heads)
        }
        let img_in = linear(cfg.in_channels, cfg.hidden_size, vb.pp("img_in"))?;
        let txt_in = linear(cfg.context_in_dim, cfg.hidden_size, vb.pp("txt_in"))?;
        let time_in = MlpEmbedder::new(TIME_EMBED_DIM, cfg.hidden_size, vb.pp("time_in"))?;
        let vector_in = MlpEmbedder::new(cfg.vec_in_dim, cfg.hidden_size, vb.pp("vector_in"))?;
        let guidance_in = if cfg.guidance_embed {
            Some(MlpEmbedder::new(TIME_EMBED_DIM, cfg.hidden_size, vb.pp("guidance_in"))?)
        } else {
            None
        };
        let double_blocks = (0..cfg.depth)
            .map(|idx| DoubleStreamBlock::new(cfg, vb.pp("double_blocks").pp(idx)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let single_blocks = (0..cfg.depth_single_blocks)
            .map(|idx| SingleStreamBlock::new(cfg, vb.pp("single_blocks").pp(idx)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let final_layer = LastLayer::new(cfg.hidden_size, cfg.in_channels, vb.pp("final_layer"))?;

        Ok(Self {
            img_in,
            txt_in,
            time_in,
            vector_in,
            guidance_in,
            pe_embedder: EmbedNd {
                theta: cfg.theta,
                axes_dim: cfg.axes_dim.clone(),
            },
            double_blocks,
            single_blocks,
            final_layer,
        })
    }

    /// Every weight the forward pass reads.
    pub fn parameters(&self) -> Vec<Tensor> {
        let mut params = Vec::new();
        push_linear(&mut params, &self.img_in);
        push_linear(&mut params, &self.txt_in);
        self.time_in.params(&mut params);
        self.vector_in.params(&mut params);
        if let Some(guidance_in) = &self.guidance_in {
            guidance_in.params(&mut params);
        }
        for block in &self.double_blocks {
            block.img.params(&mut params);
            block.txt.params(&mut params);
        }
        for block in &self.single_blocks {
            block.params(&mut params);
        }
        push_linear(&mut params, &self.final_layer.linear);
        push_linear(&mut params, &self.final_layer.ada_ln_modulation);
        params
    }

    /// `img` [B, L, in_channels], `txt` [B, S, context_in_dim], `timesteps` in [0, 1].
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        img: &Tensor,
        img_ids: &Tensor,
        txt: &Tensor,
        txt_ids: &Tensor,
        timesteps: &Tensor,
        y: &Tensor,
        guidance: Option<&Tensor>,
    ) -> candle_core::Result<Tensor> {
        if txt.rank() != 3 {
            candle_core::bail!("unexpected shape for txt {:?}", txt.shape())
        }
        if img.rank() != 3 {
            candle_core::bail!("unexpected shape for img {:?}", img.shape())
        }
        let dtype = img.dtype();
        let pe = Tensor::cat(&[txt_ids, img_ids], 1)?.apply(&self.pe_embedder)?;
        let mut txt = txt.apply(&self.txt_in)?;
        let mut img = img.apply(&self.img_in)?;

        let mut vec_ = timestep_embedding(timesteps, TIME_EMBED_DIM, dtype)?.apply(&self.time_in)?;
        if let (Some(guidance_in), Some(guidance)) = (&self.guidance_in, guidance) {
            vec_ = (vec_ + timestep_embedding(guidance, TIME_EMBED_DIM, dtype)?.apply(guidance_in)?)?;
        }
        let vec_ = (vec_ + y.apply(&self.vector_in)?)?;

        for block in &self.double_blocks {
            (img, txt) = block.forward(&img, &txt, &vec_, &pe)?;
        }
        let txt_len = txt.dim(1)?;
        let mut xs = Tensor::cat(&[&txt, &img], 1)?;
        for block in &self.single_blocks {
            xs = block.forward(&xs, &vec_, &pe)?;
        }
        self.final_layer.forward(&xs.i((.., txt_len..))?, &vec_)
    }
}
