use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use medibridge_types::models::TRANSLATION_UNAVAILABLE;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Asynchronous translation service. Never fails: an unusable result is
/// reported as [`TRANSLATION_UNAVAILABLE`] so the message pipeline always
/// completes.
pub trait Translator: Send + Sync {
    fn translate<'a>(&'a self, text: &'a str, target_language: &'a str) -> BoxFuture<'a, String>;
}

/// Human readable name for a language code; unknown codes pass through.
pub fn language_name(code: &str) -> &str {
    match code.trim().to_ascii_lowercase().as_str() {
        "en" => "English",
        "es" => "Spanish",
        "hi" => "Hindi",
        "fr" => "French",
        "de" => "German",
        "zh" => "Chinese",
        "ja" => "Japanese",
        "ar" => "Arabic",
        "pt" => "Portuguese",
        "ru" => "Russian",
        _ => code,
    }
}

/// Stand-in used when no model token is configured.
pub struct MockTranslator;

impl Translator for MockTranslator {
    fn translate<'a>(&'a self, text: &'a str, target_language: &'a str) -> BoxFuture<'a, String> {
        Box::pin(async move { format!("[Mock Translation to {}]: {}", target_language, text) })
    }
}

/// Chat-completions client for an OpenAI-compatible endpoint.
pub struct OpenAiTranslator {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

impl OpenAiTranslator {
    pub fn new(endpoint: &str, token: &str, model: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
            model: model.to_string(),
        })
    }

    async fn request(&self, text: &str, target_language: &str) -> anyhow::Result<Option<String>> {
        let lang = language_name(target_language);
        let system = format!(
            "You are a medical translator. Your ONLY job is to translate text from one language into {lang}. \
             Do NOT reply, do NOT answer questions, do NOT explain. \
             Output ONLY the {lang} translation of the user's message, nothing else."
        );

        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage { role: "system", content: &system },
                ChatMessage { role: "user", content: text },
            ],
            temperature: 0.2,
            max_tokens: 2048,
        };

        let resp: ChatResponse = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(resp
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    }
}

impl Translator for OpenAiTranslator {
    fn translate<'a>(&'a self, text: &'a str, target_language: &'a str) -> BoxFuture<'a, String> {
        Box::pin(async move {
            match self.request(text, target_language).await {
                Ok(Some(translated)) => {
                    info!("Translated into {} ({} chars)", target_language, translated.len());
                    translated
                }
                // An empty completion is not a failure: show the original.
                Ok(None) => text.to_string(),
                Err(e) => {
                    warn!("Translation into {} failed: {:#}", target_language, e);
                    TRANSLATION_UNAVAILABLE.to_string()
                }
            }
        })
    }
}
