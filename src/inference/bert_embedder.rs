use anyhow::{anyhow, Context, Result};
use candle::{DType, Device, Tensor};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use tokenizers::{Tokenizer, TruncationParams};
use tracing::info;

use super::snapshot::{self, ModelSource, Snapshot};
use super::TextEmbedder;

const SENTENCE_BERT_CONFIG: &str = "sentence_bert_config.json";

/// Sentence-transformers style embedder: BERT encoder, attention-mask mean
/// pooling, then L2 normalisation.
pub struct BertEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl BertEmbedder {
    pub fn load(source: &ModelSource, device: Device) -> Result<Self> {
        info!(source = %source.describe(), device = ?device, "loading embedding model");
        let snapshot = snapshot::resolve(source, &[SENTENCE_BERT_CONFIG])?;

        let config: BertConfig = snapshot.read_json("config.json")?;
        let max_len = max_seq_length(&snapshot)?;

        let tokenizer_path = snapshot.file("tokenizer.json");
        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Tokenizer load failed ({}): {e}", tokenizer_path.display()))?;
        configure_tokenizer(&mut tokenizer, max_len)?;

        let vb = snapshot.var_builder(DType::F32, &device)?;
        let model = BertModel::load(vb, &config).context("failed to build BERT model")?;

        let dims = output_dims(&model, &tokenizer, &device)?;
        info!(dims, max_len, shards = snapshot.weights.len(), "embedding model ready");

        Ok(Self {
            model,
            tokenizer,
            device,
        })
    }
}

impl TextEmbedder for BertEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        embed_with(&self.model, &self.tokenizer, &self.device, text)
    }
}

fn embed_with(
    model: &BertModel,
    tokenizer: &Tokenizer,
    device: &Device,
    text: &str,
) -> Result<Vec<f32>> {
    let enc = tokenizer
        .encode(text, true)
        .map_err(|e| anyhow!("Tokenizer encode error: {e}"))?;

    let ids = enc.get_ids();
    let seq_len = ids.len();
    let input = Tensor::new(ids, device)?.reshape((1, seq_len))?;
    let token_type_ids = Tensor::new(enc.get_type_ids(), device)?.reshape((1, seq_len))?;
    let mask = Tensor::new(enc.get_attention_mask(), device)?.reshape((1, seq_len))?;

    let hidden = model.forward(&input, &token_type_ids, Some(&mask))?;
    let pooled = mean_pool_normalized(&hidden, &mask)?;

    Ok(pooled.squeeze(0)?.to_vec1::<f32>()?)
}

fn output_dims(model: &BertModel, tokenizer: &Tokenizer, device: &Device) -> Result<usize> {
    embed_with(model, tokenizer, device, "hello").map(|v| v.len())
}

/// Mean over tokens weighted by the attention mask, L2-normalised per row.
/// `hidden` is `(batch, seq, dim)`, `mask` is `(batch, seq)`.
pub(crate) fn mean_pool_normalized(hidden: &Tensor, mask: &Tensor) -> candle::Result<Tensor> {
    let hidden = hidden.to_dtype(DType::F32)?;
    let mask = mask.to_dtype(DType::F32)?.unsqueeze(2)?;
    let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
    let counts = mask.sum(1)?.clamp(1f32, f32::MAX)?;
    let mean = summed.broadcast_div(&counts)?;
    let norm = mean.sqr()?.sum_keepdim(1)?.sqrt()?.clamp(1e-12f32, f32::MAX)?;
    mean.broadcast_div(&norm)
}

/// Truncation length: `max_seq_length` from `sentence_bert_config.json`,
/// else `max_position_embeddings` from `config.json`.
fn max_seq_length(snapshot: &Snapshot) -> Result<usize> {
    if snapshot.has(SENTENCE_BERT_CONFIG) {
        let st: serde_json::Value = snapshot.read_json(SENTENCE_BERT_CONFIG)?;
        if let Some(len) = st["max_seq_length"].as_u64() {
            return Ok(len as usize);
        }
    }
    let raw: serde_json::Value = snapshot.read_json("config.json")?;
    Ok(raw["max_position_embeddings"]
        .as_u64()
        .map(|v| v as usize)
        .unwrap_or(512))
}

fn configure_tokenizer(tokenizer: &mut Tokenizer, max_len: usize) -> Result<()> {
    tokenizer.with_padding(None);
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: max_len,
            ..Default::default()
        }))
        .map_err(|e| anyhow!("Tokenizer truncation setup failed: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::str::FromStr;

    const WORD_TOKENIZER: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": {"[UNK]": 0, "w": 1}, "unk_token": "[UNK]"}
    }"#;

    fn snapshot_with(name: &str, files: &[(&str, &str)]) -> Snapshot {
        let dir = std::env::temp_dir().join(format!(
            "embed-sidecar-bert-{name}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        for (file, body) in files {
            fs::write(dir.join(file), body).unwrap();
        }
        Snapshot {
            dir,
            weights: Vec::new(),
        }
    }

    #[test]
    fn sentence_bert_config_sets_truncation_length() {
        let snapshot = snapshot_with(
            "stcfg",
            &[
                ("config.json", r#"{"max_position_embeddings": 512}"#),
                (SENTENCE_BERT_CONFIG, r#"{"max_seq_length": 256, "do_lower_case": false}"#),
            ],
        );
        let max_len = max_seq_length(&snapshot).unwrap();
        assert_eq!(max_len, 256);

        let mut tokenizer = Tokenizer::from_str(WORD_TOKENIZER).unwrap();
        configure_tokenizer(&mut tokenizer, max_len).unwrap();
        let long_text = vec!["w"; 300].join(" ");
        let enc = tokenizer.encode(long_text.as_str(), true).unwrap();
        assert_eq!(enc.get_ids().len(), 256);
    }

    #[test]
    fn position_embeddings_bound_truncation_without_sentence_bert_config() {
        let snapshot = snapshot_with(
            "poscfg",
            &[("config.json", r#"{"max_position_embeddings": 512}"#)],
        );
        assert_eq!(max_seq_length(&snapshot).unwrap(), 512);
    }

    #[test]
    fn pooling_ignores_masked_tokens() {
        let device = Device::Cpu;
        let hidden = Tensor::new(&[[[3f32, 4.], [100., 100.]]], &device).unwrap();
        let mask = Tensor::new(&[[1u32, 0]], &device).unwrap();

        let pooled = mean_pool_normalized(&hidden, &mask).unwrap();
        let row = pooled.squeeze(0).unwrap().to_vec1::<f32>().unwrap();

        assert!((row[0] - 0.6).abs() < 1e-6);
        assert!((row[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn pooled_vectors_have_unit_length() {
        let device = Device::Cpu;
        let hidden = Tensor::new(&[[[1f32, 2., 2.], [3., 0., 4.], [0., 5., 0.]]], &device).unwrap();
        let mask = Tensor::new(&[[1u32, 1, 1]], &device).unwrap();

        let row = mean_pool_normalized(&hidden, &mask)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let len: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();

        assert_eq!(row.len(), 3);
        assert!((len - 1.0).abs() < 1e-5);
    }

    #[test]
    fn minilm_snapshot_embeds_hello_world() {
        let snapshot = PathBuf::from("models/all-MiniLM-L6-v2");
        if !snapshot.join("config.json").exists() {
            eprintln!(
                "embedding snapshot missing under {}, skipping test",
                snapshot.display()
            );
            return;
        }
        let embedder = BertEmbedder::load(&ModelSource::Local(snapshot), Device::Cpu)
            .expect("failed to load embedder");
        let first = embedder.embed("hello world").expect("embed failed");
        let second = embedder.embed("hello world").expect("embed failed");
        assert_eq!(first.len(), 384);
        assert_eq!(first.len(), second.len());
    }
}
