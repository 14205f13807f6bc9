use anyhow::{anyhow, Context, Result};
use minijinja::{Environment, Error as TemplateError, ErrorKind};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::inference::ChatMessage;

const CHAT_TEMPLATE_NAME: &str = "hf_chat_template";
pub const TEMPLATE_FILE: &str = "chat_template.jinja";
const TOKENIZER_CONFIG: &str = "tokenizer_config.json";

/// ChatML, the format Qwen instruct models are trained on. Used when the
/// snapshot ships no template of its own.
pub const CHATML_TEMPLATE: &str = "{%- for message in messages -%}\
{{ '<|im_start|>' ~ message.role ~ '\\n' ~ message.content ~ '<|im_end|>\\n' }}\
{%- endfor -%}\
{%- if add_generation_prompt -%}{{ '<|im_start|>assistant\\n' }}{%- endif -%}";

/// Stop markers emitted by ChatML-family models.
pub const STOP_TOKENS: &[&str] = &["<|im_end|>", "<|endoftext|>"];

pub struct ChatTemplate {
    env: Environment<'static>,
    bos_token: String,
    eos_token: String,
}

#[derive(Serialize)]
struct TemplateContext<'a> {
    bos_token: &'a str,
    eos_token: &'a str,
    messages: &'a [ChatMessage],
    tools: &'a [serde_json::Value],
    add_generation_prompt: bool,
}

impl ChatTemplate {
    pub fn from_source(source: String) -> Result<Self> {
        // The environment borrows its sources for 'static; templates are
        // compiled once per model load.
        let template_src = Box::leak(source.into_boxed_str());
        let mut env = Environment::new();
        env.add_function("raise_exception", raise_exception);
        env.add_template(CHAT_TEMPLATE_NAME, template_src)
            .map_err(|err| anyhow!("failed to compile chat template: {err}"))?;
        Ok(Self {
            env,
            bos_token: String::new(),
            eos_token: String::new(),
        })
    }

    pub fn chatml() -> Result<Self> {
        Self::from_source(CHATML_TEMPLATE.to_string())
    }

    fn with_special_tokens(mut self, bos: Option<String>, eos: Option<String>) -> Self {
        self.bos_token = bos.unwrap_or_default();
        self.eos_token = eos.unwrap_or_default();
        self
    }

    /// Render `messages` into the model's prompt text. With
    /// `add_generation_prompt` the output ends with the assistant header.
    pub fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> Result<String> {
        let tools: [serde_json::Value; 0] = [];
        let ctx = TemplateContext {
            bos_token: &self.bos_token,
            eos_token: &self.eos_token,
            messages,
            tools: &tools,
            add_generation_prompt,
        };
        self.env
            .get_template(CHAT_TEMPLATE_NAME)
            .and_then(|tmpl| tmpl.render(&ctx))
            .map_err(|err| anyhow!("chat template rendering failed: {err}"))
    }
}

fn raise_exception(message: String) -> Result<String, TemplateError> {
    Err(TemplateError::new(ErrorKind::InvalidOperation, message))
}

/// Find the chat template for a model snapshot: an explicit path first,
/// then `chat_template.jinja` next to the weights, then the
/// `chat_template` field of `tokenizer_config.json`, then ChatML.
pub fn load_for_snapshot(snapshot_dir: &Path, explicit: Option<&Path>) -> Result<ChatTemplate> {
    let tokenizer_config = read_tokenizer_config(snapshot_dir);
    let (bos, eos) = tokenizer_config
        .as_ref()
        .map(|cfg| (special_token(cfg, "bos_token"), special_token(cfg, "eos_token")))
        .unwrap_or((None, None));

    let template = match locate_template_source(snapshot_dir, explicit, tokenizer_config.as_ref())? {
        Some((origin, source)) => {
            debug!(target = "conversation", origin = %origin, "using chat template");
            ChatTemplate::from_source(source)?
        }
        None => {
            warn!(
                target = "conversation",
                dir = %snapshot_dir.display(),
                "no chat template in snapshot, falling back to ChatML"
            );
            ChatTemplate::chatml()?
        }
    };

    Ok(template.with_special_tokens(bos, eos))
}

fn locate_template_source(
    snapshot_dir: &Path,
    explicit: Option<&Path>,
    tokenizer_config: Option<&serde_json::Value>,
) -> Result<Option<(String, String)>> {
    if let Some(path) = explicit {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read chat template ({})", path.display()))?;
            return Ok(Some((path.display().to_string(), raw)));
        }
        warn!(
            target = "conversation",
            path = path.display().to_string(),
            "CHAT_TEMPLATE_PATH does not exist"
        );
    }

    let beside_weights: PathBuf = snapshot_dir.join(TEMPLATE_FILE);
    if beside_weights.exists() {
        let raw = fs::read_to_string(&beside_weights).with_context(|| {
            format!("failed to read chat template ({})", beside_weights.display())
        })?;
        return Ok(Some((beside_weights.display().to_string(), raw)));
    }

    Ok(tokenizer_config
        .and_then(embedded_template)
        .map(|src| (TOKENIZER_CONFIG.to_string(), src)))
}

fn read_tokenizer_config(snapshot_dir: &Path) -> Option<serde_json::Value> {
    let path = snapshot_dir.join(TOKENIZER_CONFIG);
    if !path.exists() {
        return None;
    }
    match crate::inference::snapshot::read_json(&path) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(target = "conversation", "ignoring unreadable {TOKENIZER_CONFIG}: {err:#}");
            None
        }
    }
}

/// `chat_template` is either a string or a list of named templates.
fn embedded_template(config: &serde_json::Value) -> Option<String> {
    match &config["chat_template"] {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(named) => named
            .iter()
            .find(|entry| entry["name"] == "default")
            .or_else(|| named.first())
            .and_then(|entry| entry["template"].as_str())
            .map(str::to_string),
        _ => None,
    }
}

/// Special tokens are stored either as plain strings or as AddedToken objects.
fn special_token(config: &serde_json::Value, key: &str) -> Option<String> {
    match &config[key] {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(obj) => obj
            .get("content")
            .and_then(|c| c.as_str())
            .map(str::to_string),
        _ => None,
    }
}
