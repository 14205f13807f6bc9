use anyhow::{anyhow, Context, Result};
use candle::{DType, Device, IndexOp, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::qwen2::{Config as QwenConfig, ModelForCausalLM};
use candle_transformers::utils::apply_repeat_penalty;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Mutex;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use super::snapshot::{self, ModelSource};
use super::{ChatMessage, ChatModel, GenerationParams};
use crate::conversation::{self, ChatTemplate, STOP_TOKENS, TEMPLATE_FILE};

const GENERATION_CONFIG: &str = "generation_config.json";

/// Sampling knobs read from the snapshot's `generation_config.json`.
/// Temperature is not taken from here; requests carry their own.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SamplingDefaults {
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    #[serde(default)]
    eos_token_id: Option<EosIds>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum EosIds {
    One(u32),
    Many(Vec<u32>),
}

impl SamplingDefaults {
    fn eos_ids(&self) -> Vec<u32> {
        match &self.eos_token_id {
            Some(EosIds::One(id)) => vec![*id],
            Some(EosIds::Many(ids)) => ids.clone(),
            None => Vec::new(),
        }
    }

    pub fn sampling(&self, temperature: f64) -> Sampling {
        if temperature <= 0.0 {
            return Sampling::ArgMax;
        }
        // top_k == 0 and top_p >= 1.0 disable the respective filter, as in HF.
        let k = self.top_k.filter(|k| *k > 0);
        let p = self.top_p.filter(|p| *p < 1.0);
        match (k, p) {
            (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
            (Some(k), None) => Sampling::TopK { k, temperature },
            (None, Some(p)) => Sampling::TopP { p, temperature },
            (None, None) => Sampling::All { temperature },
        }
    }
}

/// Qwen2 chat model: ChatML prompt rendering, sampled decoding, and
/// stripping of the echoed prompt tokens.
pub struct QwenChat {
    model: Mutex<ModelForCausalLM>,
    tokenizer: Tokenizer,
    device: Device,
    template: ChatTemplate,
    defaults: SamplingDefaults,
    eos_ids: Vec<u32>,
}

impl QwenChat {
    pub fn load(
        source: &ModelSource,
        device: Device,
        template_override: Option<PathBuf>,
    ) -> Result<Self> {
        info!(source = %source.describe(), device = ?device, "loading chat model");
        let snapshot = snapshot::resolve(
            source,
            &[GENERATION_CONFIG, "tokenizer_config.json", TEMPLATE_FILE],
        )?;

        let tokenizer_path = snapshot.file("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Tokenizer load failed ({}): {e}", tokenizer_path.display()))?;

        let cfg: QwenConfig = snapshot.read_json("config.json")?;

        let defaults: SamplingDefaults = if snapshot.has(GENERATION_CONFIG) {
            snapshot.read_json(GENERATION_CONFIG)?
        } else {
            SamplingDefaults::default()
        };
        let eos_ids = collect_eos_ids(&tokenizer, &defaults);
        if eos_ids.is_empty() {
            return Err(anyhow!("chat model has no end-of-sequence token"));
        }

        let template = conversation::load_for_snapshot(&snapshot.dir, template_override.as_deref())?;

        let dtype = if device.is_cuda() { DType::BF16 } else { DType::F32 };
        let vb = snapshot.var_builder(dtype, &device)?;
        let model = ModelForCausalLM::new(&cfg, vb).context("failed to build Qwen2 model")?;

        info!(
            shards = snapshot.weights.len(),
            ?dtype,
            eos = ?eos_ids,
            "chat model ready"
        );

        Ok(Self {
            model: Mutex::new(model),
            tokenizer,
            device,
            template,
            defaults,
            eos_ids,
        })
    }
}

impl ChatModel for QwenChat {
    fn generate(&self, messages: &[ChatMessage], params: &GenerationParams) -> Result<String> {
        if params.max_new_tokens == 0 {
            return Ok(String::new());
        }

        let prompt = self.template.render(messages, true)?;
        let enc = self
            .tokenizer
            .encode(prompt.as_str(), true)
            .map_err(|e| anyhow!("Tokenizer encode error: {e}"))?;
        let prompt_tokens = enc.get_ids().to_vec();
        debug!(prompt_tokens = prompt_tokens.len(), "starting generation");

        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow!("chat model lock poisoned"))?;
        model.clear_kv_cache();

        let device = &self.device;
        let generated = run_generation(
            |ctx, pos| {
                let input = Tensor::new(ctx, device)?.unsqueeze(0)?;
                let out = model.forward(&input, pos)?;
                let seq_len = out.dim(1)?;
                Ok(out.i((0, seq_len - 1))?.to_dtype(DType::F32)?)
            },
            prompt_tokens,
            params,
            &self.defaults,
            &self.eos_ids,
        )?;
        drop(model);

        let text = self
            .tokenizer
            .decode(&generated, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {e}"))?;
        Ok(text.trim().to_string())
    }
}

/// Autoregressive loop. `step(ctx, pos)` runs the model on `ctx` at KV
/// offset `pos` and returns last-position logits as a 1D F32 tensor.
/// Returns only the tokens produced after the prompt, without the EOS.
pub(crate) fn run_generation<F>(
    mut step: F,
    prompt_tokens: Vec<u32>,
    params: &GenerationParams,
    defaults: &SamplingDefaults,
    eos_ids: &[u32],
) -> Result<Vec<u32>>
where
    F: FnMut(&[u32], usize) -> Result<Tensor>,
{
    let prompt_len = prompt_tokens.len();
    let mut tokens = prompt_tokens;
    let mut lp = LogitsProcessor::from_sampling(
        params.resolve_seed(),
        defaults.sampling(params.temperature),
    );
    let penalty = defaults.repetition_penalty.filter(|p| (*p - 1.0).abs() > f32::EPSILON);
    let mut pos = 0usize;

    for _ in 0..params.max_new_tokens {
        // first step: whole prompt; later: last token only
        let ctx: &[u32] = if pos == 0 {
            &tokens
        } else {
            &tokens[tokens.len() - 1..]
        };
        let ctx_len = ctx.len();

        let mut logits = step(ctx, pos)?;
        pos += ctx_len;

        if let Some(penalty) = penalty {
            logits = apply_repeat_penalty(&logits, penalty, &tokens)?;
        }

        let next = lp.sample(&logits)?;
        if eos_ids.contains(&next) {
            break;
        }
        tokens.push(next);
    }

    Ok(tokens.split_off(prompt_len))
}

fn collect_eos_ids(tokenizer: &Tokenizer, defaults: &SamplingDefaults) -> Vec<u32> {
    let mut ids = defaults.eos_ids();
    for token in STOP_TOKENS {
        if let Some(id) = tokenizer.token_to_id(token) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}
