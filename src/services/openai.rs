//! OpenAI-compatible HTTP backend for transcription and batch translation.
//!
//! ## Endpoints:
//! - `POST {base_url}/audio/transcriptions` (multipart `file` + `model`) → `{"text": ...}`
//! - `POST {base_url}/chat/completions` with a JSON-object response format; the model is
//!   asked to answer with `{"<language>": "<translation>", ...}`

use super::{ServiceError, Transcriber, Translator};
use crate::config::ServicesConfig;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
    transcription_model: String,
    translation_model: String,
    audio_mime: String,
}

impl OpenAiClient {
    pub fn new(config: &ServicesConfig) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        if config.api_key.is_empty() {
            warn!("No API key configured for speech/translation services, requests will be unauthenticated");
        }

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            transcription_model: config.transcription_model.clone(),
            translation_model: config.translation_model.clone(),
            audio_mime: config.audio_mime.clone(),
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(format!("{}{}", self.base_url, path));
        if self.api_key.is_empty() {
            request
        } else {
            request.bearer_auth(&self.api_key)
        }
    }

    async fn json_response(response: reqwest::Response) -> Result<Value, ServiceError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Api {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl Transcriber for OpenAiClient {
    async fn transcribe(&self, audio: Bytes) -> Result<String, ServiceError> {
        debug!(bytes = audio.len(), model = %self.transcription_model, "Sending audio for transcription");

        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name(file_name_for(&self.audio_mime))
            .mime_str(&self.audio_mime)
            .map_err(|e| ServiceError::Request(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.transcription_model.clone());

        let response = self.post("/audio/transcriptions").multipart(form).send().await?;
        let body = Self::json_response(response).await?;
        body["text"]
            .as_str()
            .map(|text| text.trim().to_string())
            .ok_or_else(|| ServiceError::InvalidResponse("missing 'text' field".to_string()))
    }
}

#[async_trait]
impl Translator for OpenAiClient {
    async fn translate_batch(&self, text: &str, targets: &[String]) -> Result<HashMap<String, String>, ServiceError> {
        if targets.is_empty() {
            return Ok(HashMap::new());
        }
        debug!(targets = ?targets, model = %self.translation_model, "Requesting batch translation");

        let request = json!({
            "model": self.translation_model,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": translation_prompt(targets)},
                {"role": "user", "content": text},
            ],
        });
        let response = self.post("/chat/completions").json(&request).send().await?;
        let body = Self::json_response(response).await?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ServiceError::InvalidResponse("missing completion content".to_string()))?;

        parse_translations(content, targets)
    }
}

fn translation_prompt(targets: &[String]) -> String {
    format!(
        "You are a classroom interpreter. Translate the user's message into each of these languages: {}. \
         Reply with a single JSON object whose keys are exactly those language names and whose values \
         are the translations. Do not add commentary.",
        targets.join(", ")
    )
}

/// Pick the requested languages out of the model's JSON answer.
fn parse_translations(content: &str, targets: &[String]) -> Result<HashMap<String, String>, ServiceError> {
    let value: Value =
        serde_json::from_str(content).map_err(|e| ServiceError::InvalidResponse(format!("translation JSON: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| ServiceError::InvalidResponse("translation answer is not an object".to_string()))?;

    let mut translations = HashMap::new();
    for lang in targets {
        let found = object
            .get(lang)
            .or_else(|| object.iter().find(|(k, _)| k.eq_ignore_ascii_case(lang)).map(|(_, v)| v));
        match found.and_then(Value::as_str) {
            Some(text) => {
                translations.insert(lang.clone(), text.to_string());
            }
            None => debug!(lang = %lang, "Translation missing from service answer"),
        }
    }
    Ok(translations)
}

fn file_name_for(mime: &str) -> &'static str {
    match mime.split(';').next().unwrap_or_default().trim() {
        "audio/wav" | "audio/x-wav" | "audio/wave" => "audio.wav",
        "audio/ogg" => "audio.ogg",
        "audio/mpeg" => "audio.mp3",
        "audio/mp4" => "audio.m4a",
        _ => "audio.webm",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn langs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_translations_keeps_requested_languages() {
        let content = r#"{"Spanish": "hola", "french": "bonjour", "German": "hallo"}"#;
        let parsed = parse_translations(content, &langs(&["Spanish", "French", "Italian"])).unwrap();

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["Spanish"], "hola");
        assert_eq!(parsed["French"], "bonjour");
        assert!(!parsed.contains_key("German"));
    }

    #[test]
    fn test_parse_translations_rejects_garbage() {
        assert!(matches!(
            parse_translations("not json", &langs(&["Spanish"])),
            Err(ServiceError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_translations(r#"["hola"]"#, &langs(&["Spanish"])),
            Err(ServiceError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_file_name_for_mime() {
        assert_eq!(file_name_for("audio/webm;codecs=opus"), "audio.webm");
        assert_eq!(file_name_for("audio/wav"), "audio.wav");
        assert_eq!(file_name_for("audio/ogg"), "audio.ogg");
    }

    #[test]
    fn test_prompt_lists_languages() {
        let prompt = translation_prompt(&langs(&["Spanish", "Korean"]));
        assert!(prompt.contains("Spanish, Korean"));
    }

    #[tokio::test]
    async fn test_empty_batch_skips_request() {
        let client = OpenAiClient::new(&crate::config::AppConfig::default().services).unwrap();
        let result = client.translate_batch("hello", &[]).await.unwrap();
        assert!(result.is_empty());
    }
}
