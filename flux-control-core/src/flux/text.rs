//! Prompt encoders: T5-XXL for the token sequence and CLIP ViT-L for the
//! pooled vector.

use std::path::Path;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{clip, t5};
use tokenizers::{
    models::bpe::BPE,
    pre_tokenizers::{
        byte_level::ByteLevel,
        sequence::Sequence,
        split::{Split, SplitPattern},
    },
    processors::template::TemplateProcessing,
    AddedToken, PaddingParams, PaddingStrategy, SplitDelimiterBehavior, Tokenizer,
    TruncationParams,
};
use tracing::{debug, info};

use crate::weights::safetensors_files;

pub const T5_MAX_LENGTH: usize = 512;
pub const CLIP_MAX_LENGTH: usize = 77;
const CLIP_BOS: u32 = 49406;
const CLIP_EOS: u32 = 49407;
const T5_EOS: u32 = 1;
const CLIP_SPLIT_PATTERN: &str = r"<\|startoftext\|>|<\|endoftext\|>|'s|'t|'re|'ve|'m|'ll|'d|[\p{L}]+|[\p{N}]|[^\s\p{L}\p{N}]+";

/// Pads with zeros or truncates to exactly `len` tokens. A truncated sequence
/// still ends with `</s>`.
pub fn fit_tokens(mut tokens: Vec<u32>, len: usize) -> Vec<u32> {
    let truncated = tokens.len() > len;
    tokens.resize(len, 0);
    if truncated {
        if let Some(last) = tokens.last_mut() {
            *last = T5_EOS;
        }
    }
    tokens
}

pub struct T5Encoder {
    model: t5::T5EncoderModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl T5Encoder {
    /// Loads `text_encoder_2/` and `tokenizer_2/` of a diffusers Flux snapshot.
    pub fn load(root: &Path, dtype: DType, device: &Device) -> Result<Self> {
        let model_dir = root.join("text_encoder_2");
        info!(path = %model_dir.display(), "loading T5 encoder");

        let config_path = model_dir.join("config.json");
        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read T5 config {}", config_path.display()))?;
        let config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;

        let files = safetensors_files(&model_dir)?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&files, dtype, device)
                .context("failed to build T5 var builder")?
        };
        let model = t5::T5EncoderModel::load(vb, &config).context("failed to load T5 model")?;

        let tokenizer = Tokenizer::from_file(root.join("tokenizer_2").join("tokenizer.json"))
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
        })
    }

    /// Returns the (1, 512, 4096) token embeddings of `prompt`.
    pub fn encode(&mut self, prompt: &str) -> Result<Tensor> {
        let tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let tokens = fit_tokens(tokens, T5_MAX_LENGTH);
        let input_ids = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let emb = self.model.forward(&input_ids)?;
        debug!(shape = ?emb.dims(), "T5 embeddings");
        Ok(emb)
    }
}

pub struct ClipEncoder {
    model: clip::text_model::ClipTextTransformer,
    tokenizer: Tokenizer,
    device: Device,
}

impl ClipEncoder {
    /// Loads `text_encoder/` and `tokenizer/` of a diffusers Flux snapshot.
    pub fn load(root: &Path, dtype: DType, device: &Device) -> Result<Self> {
        let model_dir = root.join("text_encoder");
        info!(path = %model_dir.display(), "loading CLIP encoder");

        let files = safetensors_files(&model_dir)?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&files, dtype, device)
                .context("failed to build CLIP var builder")?
        };
        let config = clip::text_model::ClipTextConfig {
            vocab_size: 49408,
            embed_dim: 768,
            activation: clip::text_model::Activation::QuickGelu,
            intermediate_size: 3072,
            max_position_embeddings: CLIP_MAX_LENGTH,
            pad_with: Some("<|endoftext|>".to_string()),
            num_hidden_layers: 12,
            num_attention_heads: 12,
            projection_dim: 768,
        };
        let model = clip::text_model::ClipTextTransformer::new(vb.pp("text_model"), &config)
            .context("failed to load CLIP model")?;
        let tokenizer = clip_tokenizer(&root.join("tokenizer"))?;

        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
        })
    }

    /// Returns the (1, 768) pooled embedding taken at the end-of-text token.
    pub fn encode(&self, prompt: &str) -> Result<Tensor> {
        let tokens = self
            .tokenizer
            .encode(prompt.to_lowercase(), true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() != CLIP_MAX_LENGTH {
            anyhow::bail!(
                "CLIP tokenization produced {} tokens, expected {CLIP_MAX_LENGTH}",
                tokens.len()
            );
        }
        let eot = eot_position(&tokens);
        let input_ids = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let hidden = self.model.forward_with_mask(&input_ids, usize::MAX)?;
        Ok(hidden.i((0, eot))?.unsqueeze(0)?)
    }
}

/// First end-of-text token after the start token, or the last position when
/// the prompt was truncated.
pub fn eot_position(tokens: &[u32]) -> usize {
    tokens
        .iter()
        .skip(1)
        .position(|&t| t == CLIP_EOS)
        .map(|p| p + 1)
        .unwrap_or(tokens.len().saturating_sub(1))
}

/// The CLIP tokenizer ships as `vocab.json` + `merges.txt`; a `tokenizer.json`
/// is used instead when present.
fn clip_tokenizer(dir: &Path) -> Result<Tokenizer> {
    let unified = dir.join("tokenizer.json");
    if unified.exists() {
        let mut tokenizer = Tokenizer::from_file(&unified)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        pad_and_truncate(&mut tokenizer)?;
        return Ok(tokenizer);
    }

    let vocab = dir.join("vocab.json");
    let merges = dir.join("merges.txt");
    let bpe = BPE::from_file(&vocab.to_string_lossy(), &merges.to_string_lossy())
        .end_of_word_suffix("</w>".to_string())
        .build()
        .map_err(Error::msg)
        .with_context(|| format!("failed to build CLIP tokenizer from {}", dir.display()))?;

    let mut tokenizer = Tokenizer::new(bpe);
    tokenizer.add_special_tokens(&[
        AddedToken::from("<|startoftext|>", true),
        AddedToken::from("<|endoftext|>", true),
    ]);
    // words as CLIP splits them, then mapped onto the byte-level alphabet of the vocab
    let split = Split::new(
        SplitPattern::Regex(CLIP_SPLIT_PATTERN.to_string()),
        SplitDelimiterBehavior::Removed,
        true,
    )
    .map_err(Error::msg)?;
    tokenizer.with_pre_tokenizer(Some(Sequence::new(vec![
        split.into(),
        ByteLevel::new(false, true, false).into(),
    ])));
    let processor = TemplateProcessing::builder()
        .try_single("<|startoftext|> $A <|endoftext|>")
        .map_err(Error::msg)?
        .special_tokens(vec![("<|startoftext|>", CLIP_BOS), ("<|endoftext|>", CLIP_EOS)])
        .build()
        .map_err(Error::msg)?;
    tokenizer.with_post_processor(Some(processor));
    pad_and_truncate(&mut tokenizer)?;
    Ok(tokenizer)
}

fn pad_and_truncate(tokenizer: &mut Tokenizer) -> Result<()> {
    tokenizer.with_padding(Some(PaddingParams {
        strategy: PaddingStrategy::Fixed(CLIP_MAX_LENGTH),
        pad_id: CLIP_EOS,
        pad_token: "<|endoftext|>".to_string(),
        ..Default::default()
    }));
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: CLIP_MAX_LENGTH,
            ..Default::default()
        }))
        .map_err(Error::msg)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t5_tokens_are_padded_and_truncated() {
        assert_eq!(fit_tokens(vec![5, 6, 1], 5), vec![5, 6, 1, 0, 0]);
        let long: Vec<u32> = (1..=600).collect();
        let fitted = fit_tokens(long, T5_MAX_LENGTH);
        assert_eq!(fitted.len(), T5_MAX_LENGTH);
        assert_eq!(fitted[T5_MAX_LENGTH - 2], T5_MAX_LENGTH as u32 - 1);
        assert_eq!(fitted[T5_MAX_LENGTH - 1], T5_EOS);

        let exact: Vec<u32> = (2..=6).collect();
        assert_eq!(fit_tokens(exact.clone(), 5), exact);
    }

    #[test]
    fn vocab_and_merges_tokenizer_is_byte_level() {
        let dir = std::env::temp_dir().join(format!("flux-control-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        // "é" is the byte pair 0xc3 0xa9, spelled "Ã©" in the byte-level alphabet
        let vocab = serde_json::json!({
            "Ã": 0,
            "©</w>": 1,
            "Ã©</w>": 2,
            "a": 3,
            "a</w>": 4,
            "<|startoftext|>": CLIP_BOS,
            "<|endoftext|>": CLIP_EOS,
        });
        std::fs::write(dir.join("vocab.json"), vocab.to_string()).unwrap();
        std::fs::write(dir.join("merges.txt"), "#version: 0.2\nÃ ©</w>\n").unwrap();

        let tokenizer = clip_tokenizer(&dir).unwrap();
        let ids = tokenizer.encode("é a", true).unwrap().get_ids().to_vec();
        assert_eq!(ids.len(), CLIP_MAX_LENGTH);
        assert_eq!(&ids[..4], &[CLIP_BOS, 2, 4, CLIP_EOS]);
        assert!(ids[4..].iter().all(|&id| id == CLIP_EOS));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn pooled_position_is_first_end_of_text() {
        let mut tokens = vec![CLIP_BOS, 320, 1125, CLIP_EOS];
        tokens.resize(CLIP_MAX_LENGTH, CLIP_EOS);
        assert_eq!(eot_position(&tokens), 3);

        // truncated prompt without an end-of-text token
        let tokens: Vec<u32> = std::iter::once(CLIP_BOS)
            .chain(std::iter::repeat(320).take(CLIP_MAX_LENGTH - 1))
            .collect();
        assert_eq!(eot_position(&tokens), CLIP_MAX_LENGTH - 1);
    }
}
