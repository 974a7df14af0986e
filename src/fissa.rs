//! FISSA: fusing item similarity models with self-attention networks.
//!
//! Two views of a user's sequence are computed: `x_l`, the attention-encoded
//! state of the last real item, and `y`, an item-similarity weighted summary
//! of the raw item embeddings. A sigmoid gate conditioned on the last item,
//! `y` and each candidate decides, per candidate, how to mix them.

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{linear, Dropout, Embedding, Init, Linear, VarBuilder, VarMap};
use tracing::info;

use crate::config::{FissaConfig, HiddenAct};
use crate::error::{Error, Result};
use crate::loss::{LossType, Objective};
use crate::transformer::{grad_softmax_last_dim, padding_mask, GradLayerNorm, TransformerEncoder};
use crate::{ItemId, PADDING_ITEM_ID};

fn item_id_u32(item_id: ItemId) -> Result<u32> {
    u32::try_from(item_id).map_err(|_| Error::ItemIdOutOfRange(item_id))
}

fn xavier_normal(fan_in: usize, fan_out: usize) -> Init {
    Init::Randn {
        mean: 0.0,
        stdev: (2.0 / (fan_in + fan_out) as f64).sqrt(),
    }
}

// ---------------------------------------------------------------------------
// Interaction batch
// ---------------------------------------------------------------------------

/// One batch handed over by the training / evaluation driver.
///
/// `item_seq` is `(B, L)` u32, right-padded with 0; `item_seq_len` is `(B,)`.
#[derive(Debug, Clone)]
pub struct Interaction {
    pub item_seq: Tensor,
    pub item_seq_len: Tensor,
    /// Next item per example, for training.
    pub pos_items: Option<Tensor>,
    /// Sampled negative per example, for pairwise training.
    pub neg_items: Option<Tensor>,
    /// Candidate per example, for [`Fissa::predict`].
    pub item_ids: Option<Tensor>,
}

impl Interaction {
    pub fn new(item_seq: Tensor, item_seq_len: Tensor) -> Self {
        Self {
            item_seq,
            item_seq_len,
            pos_items: None,
            neg_items: None,
            item_ids: None,
        }
    }

    /// Pack histories into a padded batch. Sequences longer than `max_len`
    /// keep their most recent `max_len` items.
    pub fn from_sequences(sequences: &[Vec<ItemId>], max_len: usize, device: &Device) -> Result<Self> {
        let b = sequences.len();
        let mut ids = vec![PADDING_ITEM_ID as u32; b * max_len];
        let mut lens = Vec::with_capacity(b);
        for (row, seq) in sequences.iter().enumerate() {
            if seq.is_empty() {
                return Err(Error::InvalidSequenceLength { row, len: 0, max: max_len });
            }
            let recent = &seq[seq.len().saturating_sub(max_len)..];
            for (col, &item_id) in recent.iter().enumerate() {
                ids[row * max_len + col] = item_id_u32(item_id)?;
            }
            lens.push(recent.len() as u32);
        }
        let item_seq = Tensor::from_vec(ids, (b, max_len), device)?;
        let item_seq_len = Tensor::from_vec(lens, b, device)?;
        Ok(Self::new(item_seq, item_seq_len))
    }

    pub fn with_pos_items(mut self, items: &[ItemId]) -> Result<Self> {
        self.pos_items = Some(self.ids_tensor("pos_items", items)?);
        Ok(self)
    }

    pub fn with_neg_items(mut self, items: &[ItemId]) -> Result<Self> {
        self.neg_items = Some(self.ids_tensor("neg_items", items)?);
        Ok(self)
    }

    pub fn with_item_ids(mut self, items: &[ItemId]) -> Result<Self> {
        self.item_ids = Some(self.ids_tensor("item_ids", items)?);
        Ok(self)
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.item_seq.dim(0)?)
    }

    fn ids_tensor(&self, field: &'static str, items: &[ItemId]) -> Result<Tensor> {
        let expected = self.batch_size()?;
        if items.len() != expected {
            return Err(Error::BatchSizeMismatch {
                field,
                expected,
                actual: items.len(),
            });
        }
        let ids = items
            .iter()
            .map(|&i| item_id_u32(i))
            .collect::<Result<Vec<u32>>>()?;
        Ok(Tensor::from_vec(ids, expected, self.item_seq.device())?)
    }
}

// ---------------------------------------------------------------------------
// Item embedding with a frozen zero padding row
// ---------------------------------------------------------------------------

/// Item table whose padding row reads as zeros and never gets gradient.
struct ItemEmbedding {
    weight: Tensor,
    row_mask: Tensor,
    hidden_size: usize,
}

impl ItemEmbedding {
    fn new(n_items: usize, hidden_size: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let weight = vb.get_with_hints(
            (n_items, hidden_size),
            "weight",
            xavier_normal(hidden_size, n_items),
        )?;
        let mask: Vec<f32> = (0..n_items)
            .map(|i| if i == PADDING_ITEM_ID { 0.0 } else { 1.0 })
            .collect();
        let row_mask = Tensor::from_vec(mask, (n_items, 1), vb.device())?;
        Ok(Self {
            weight,
            row_mask,
            hidden_size,
        })
    }

    /// Full `(n_items, D)` table with the padding row zeroed.
    fn table(&self) -> candle_core::Result<Tensor> {
        self.weight.broadcast_mul(&self.row_mask)
    }

    fn forward(&self, ids: &Tensor) -> candle_core::Result<Tensor> {
        Embedding::new(self.table()?, self.hidden_size).forward(ids)
    }
}

/// Per-example encoder outputs shared by the loss and scoring paths.
struct SequenceRepr {
    x_l: Tensor,
    y: Tensor,
    last_item_emb: Tensor,
}

/// Pick `output[b, positions[b], :]` for every row. output: (B, L, D) -> (B, D)
pub fn gather_indexes(output: &Tensor, positions: &[usize]) -> Result<Tensor> {
    let (b, l, d) = output.dims3()?;
    if positions.len() != b {
        return Err(Error::BatchSizeMismatch {
            field: "positions",
            expected: b,
            actual: positions.len(),
        });
    }
    let flat = positions
        .iter()
        .enumerate()
        .map(|(row, &p)| {
            if p >= l {
                Err(Error::InvalidSequenceLength { row, len: p + 1, max: l })
            } else {
                Ok((row * l + p) as u32)
            }
        })
        .collect::<Result<Vec<u32>>>()?;
    let idx = Tensor::from_vec(flat, b, output.device())?;
    Ok(output.reshape((b * l, d))?.index_select(&idx, 0)?)
}

/// Dot product of each fused representation with its candidate.
/// fused, candidates: (B, C, D) -> (B, C)
fn score(fused: &Tensor, candidates: &Tensor) -> Result<Tensor> {
    Ok(fused.broadcast_mul(candidates)?.sum(D::Minus1)?)
}

// ---------------------------------------------------------------------------
// Fissa
// ---------------------------------------------------------------------------

pub struct Fissa {
    config: FissaConfig,
    objective: Objective,
    n_items: usize,
    item_embedding: ItemEmbedding,
    position_embedding: Embedding,
    layer_norm: GradLayerNorm,
    dropout: Dropout,
    item_sim_dropout: Dropout,
    trm_encoder: TransformerEncoder,
    w1: Tensor,
    w2: Tensor,
    q_s: Tensor,
    gating: Linear,
}

impl Fissa {
    /// Build the model over `n_items` ids (including padding id 0).
    ///
    /// `loss_type` and `hidden_act` are resolved before any parameter is
    /// allocated, so a bad name leaves `vb`'s backing store untouched.
    pub fn from_vb(config: FissaConfig, n_items: usize, vb: VarBuilder) -> Result<Self> {
        let loss_type: LossType = config.loss_type.parse()?;
        let act: HiddenAct = config.hidden_act.parse()?;
        config.validate()?;
        if n_items < 2 {
            return Err(Error::InvalidConfig(format!(
                "n_items {n_items} leaves no real item besides padding"
            )));
        }

        let d = config.hidden_size;
        let item_embedding = ItemEmbedding::new(n_items, d, vb.pp("item_embedding"))?;
        let position_embedding = Embedding::new(
            vb.pp("position_embedding").get_with_hints(
                (config.max_seq_length + 1, d),
                "weight",
                xavier_normal(d, config.max_seq_length + 1),
            )?,
            d,
        );
        let layer_norm = GradLayerNorm::new(d, config.layer_norm_eps, vb.pp("layer_norm"))?;
        let trm_encoder = TransformerEncoder::new(&config, act, vb.pp("trm_encoder"))?;

        let custom = Init::Randn {
            mean: 0.0,
            stdev: config.initializer_range,
        };
        let w1 = vb.get_with_hints((d, d), "w1", custom)?;
        let w2 = vb.get_with_hints((d, d), "w2", custom)?;
        let q_s = vb.get_with_hints(d, "q_s", custom)?;
        let gating = linear(3 * d, 1, vb.pp("gating"))?;

        info!(
            n_items,
            hidden_size = d,
            n_layers = config.n_layers,
            n_heads = config.n_heads,
            ?loss_type,
            ?act,
            "built FISSA model"
        );

        Ok(Self {
            dropout: Dropout::new(config.hidden_dropout_prob),
            item_sim_dropout: Dropout::new(config.hidden_dropout_prob),
            objective: Objective::new(loss_type),
            n_items,
            item_embedding,
            position_embedding,
            layer_norm,
            trm_encoder,
            w1,
            w2,
            q_s,
            gating,
            config,
        })
    }

    pub fn new(config: FissaConfig, n_items: usize, varmap: &VarMap, device: &Device) -> Result<Self> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        Self::from_vb(config, n_items, vb)
    }

    pub fn config(&self) -> &FissaConfig {
        &self.config
    }

    pub fn n_items(&self) -> usize {
        self.n_items
    }

    pub fn loss_type(&self) -> LossType {
        self.objective.loss_type()
    }

    fn check_item_ids(&self, ids: &Tensor) -> Result<()> {
        let ids = ids.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?;
        match ids.iter().find(|&&i| i as usize >= self.n_items) {
            Some(&bad) => Err(Error::ItemIdOutOfRange(bad as usize)),
            None => Ok(()),
        }
    }

    /// One in-range item id per example.
    fn check_candidates(&self, field: &'static str, items: &Tensor, batch_size: usize) -> Result<()> {
        let actual = items.dims1()?;
        if actual != batch_size {
            return Err(Error::BatchSizeMismatch {
                field,
                expected: batch_size,
                actual,
            });
        }
        self.check_item_ids(items)
    }

    /// Validate a batch and return, per row, the index of its last real item.
    fn last_positions(&self, item_seq: &Tensor, item_seq_len: &Tensor) -> Result<Vec<usize>> {
        let (b, l) = item_seq.dims2()?;
        if l > self.config.max_seq_length {
            return Err(Error::SequenceTooLong {
                len: l,
                max: self.config.max_seq_length,
            });
        }
        self.check_item_ids(item_seq)?;

        let lens = item_seq_len.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        if lens.len() != b {
            return Err(Error::BatchSizeMismatch {
                field: "item_seq_len",
                expected: b,
                actual: lens.len(),
            });
        }
        lens.iter()
            .enumerate()
            .map(|(row, &len)| {
                let len = len as usize;
                if len == 0 || len > l {
                    Err(Error::InvalidSequenceLength { row, len, max: l })
                } else {
                    Ok(len - 1)
                }
            })
            .collect()
    }

    fn encode(&self, item_seq: &Tensor, item_seq_len: &Tensor, train: bool) -> Result<SequenceRepr> {
        let positions = self.last_positions(item_seq, item_seq_len)?;
        let item_seq = item_seq.to_dtype(DType::U32)?;
        let seq_len = item_seq.dim(1)?;

        let item_emb = self.item_embedding.forward(&item_seq)?; // (B, L, D)
        let position_ids = Tensor::arange(0u32, seq_len as u32, item_seq.device())?;
        let position_emb = self.position_embedding.forward(&position_ids)?; // (L, D)

        let input_emb = item_emb.broadcast_add(&position_emb)?;
        let input_emb = self.layer_norm.forward(&input_emb)?;
        let input_emb = self.dropout.forward(&input_emb, train)?;

        let mask = padding_mask(&item_seq)?;
        let trm_output = self.trm_encoder.forward(&input_emb, &mask, train)?;
        let last_layer = trm_output
            .last()
            .ok_or_else(|| Error::InvalidConfig("encoder has no layers".into()))?;
        let x_l = gather_indexes(last_layer, &positions)?;

        // Item-similarity branch. Padding rows are zero vectors but still take
        // part in the softmax.
        let d = self.config.hidden_size;
        let sim = item_emb
            .broadcast_matmul(&self.w1)?
            .broadcast_matmul(&self.q_s.reshape((d, 1))?)?
            .squeeze(D::Minus1)?; // (B, L)
        let a = grad_softmax_last_dim(&sim)?;
        let projected = item_emb.broadcast_matmul(&self.w2)?;
        let y = projected.broadcast_mul(&a.unsqueeze(2)?)?.sum(1)?;
        let y = self.item_sim_dropout.forward(&y, train)?;

        let last_item_emb = gather_indexes(&item_emb, &positions)?;
        Ok(SequenceRepr {
            x_l,
            y,
            last_item_emb,
        })
    }

    /// Encode a batch into `(x_l, y)`, both `(B, D)`.
    /// Dropout is active only when `train` is set.
    pub fn forward(&self, item_seq: &Tensor, item_seq_len: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let repr = self.encode(item_seq, item_seq_len, train)?;
        Ok((repr.x_l, repr.y))
    }

    /// Gate `x_l` against `y` per candidate.
    ///
    /// x_l, y, last_item_emb: (B, D); candidates: (B, C, D) -> (B, C, D)
    pub fn cal_final(
        &self,
        x_l: &Tensor,
        y: &Tensor,
        last_item_emb: &Tensor,
        candidates: &Tensor,
    ) -> Result<Tensor> {
        let (b, c, d) = candidates.dims3()?;
        let isg_input = Tensor::cat(&[last_item_emb, y], 1)?
            .unsqueeze(1)?
            .broadcast_as((b, c, 2 * d))?
            .contiguous()?;
        let isg_input = Tensor::cat(&[&isg_input, &candidates.contiguous()?], 2)?; // (B, C, 3D)
        let g = candle_nn::ops::sigmoid(&self.gating.forward(&isg_input)?)?; // (B, C, 1)
        let keep_y = g.affine(-1.0, 1.0)?;
        let fused = x_l
            .unsqueeze(1)?
            .broadcast_mul(&g)?
            .broadcast_add(&y.unsqueeze(1)?.broadcast_mul(&keep_y)?)?;
        Ok(fused)
    }

    /// Score one candidate per example. items: (B,) -> (B,)
    fn score_items(&self, repr: &SequenceRepr, items: &Tensor) -> Result<Tensor> {
        let items_emb = self
            .item_embedding
            .forward(&items.to_dtype(DType::U32)?)?
            .unsqueeze(1)?; // (B, 1, D)
        let fused = self.cal_final(&repr.x_l, &repr.y, &repr.last_item_emb, &items_emb)?;
        Ok(score(&fused, &items_emb)?.squeeze(1)?)
    }

    /// Score every item in the catalog. -> (B, n_items)
    fn score_catalog(&self, repr: &SequenceRepr) -> Result<Tensor> {
        let (b, d) = repr.x_l.dims2()?;
        let candidates = self
            .item_embedding
            .table()?
            .unsqueeze(0)?
            .broadcast_as((b, self.n_items, d))?
            .contiguous()?;
        let fused = self.cal_final(&repr.x_l, &repr.y, &repr.last_item_emb, &candidates)?;
        score(&fused, &candidates)
    }

    /// Training loss for a batch; dropout is active.
    ///
    /// Pairwise needs `pos_items` and `neg_items`, listwise only `pos_items`.
    pub fn calculate_loss(&self, batch: &Interaction) -> Result<Tensor> {
        let pos_items = batch
            .pos_items
            .as_ref()
            .ok_or(Error::MissingInput("pos_items"))?;
        let batch_size = batch.batch_size()?;
        self.check_candidates("pos_items", pos_items, batch_size)?;
        match &self.objective {
            Objective::Pairwise(bpr) => {
                let neg_items = batch
                    .neg_items
                    .as_ref()
                    .ok_or(Error::MissingInput("neg_items"))?;
                self.check_candidates("neg_items", neg_items, batch_size)?;
                let repr = self.encode(&batch.item_seq, &batch.item_seq_len, true)?;
                let pos_score = self.score_items(&repr, pos_items)?;
                let neg_score = self.score_items(&repr, neg_items)?;
                Ok(bpr.forward(&pos_score, &neg_score)?)
            }
            Objective::Listwise(ce) => {
                let repr = self.encode(&batch.item_seq, &batch.item_seq_len, true)?;
                let logits = self.score_catalog(&repr)?;
                Ok(ce.forward(&logits, &pos_items.to_dtype(DType::U32)?)?)
            }
        }
    }

    /// Score `batch.item_ids` against each sequence in evaluation mode. -> (B,)
    pub fn predict(&self, batch: &Interaction) -> Result<Tensor> {
        let items = batch
            .item_ids
            .as_ref()
            .ok_or(Error::MissingInput("item_ids"))?;
        self.check_candidates("item_ids", items, batch.batch_size()?)?;
        let repr = self.encode(&batch.item_seq, &batch.item_seq_len, false)?;
        self.score_items(&repr, items)
    }

    /// Score the whole catalog in evaluation mode. -> (B, n_items)
    pub fn full_sort_predict(&self, batch: &Interaction) -> Result<Tensor> {
        let repr = self.encode(&batch.item_seq, &batch.item_seq_len, false)?;
        self.score_catalog(&repr)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
