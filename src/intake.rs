//! Voice and receipt intake.
//!
//! Both paths end in the core: a voice note is transcribed and fed to the
//! ingestion pipeline; a receipt photo is stored, read by OCR, and its line
//! items are translated into the user's locale through the translation
//! cache. The speech, OCR, and storage backends are capabilities supplied by
//! the host.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::IntakeError;
use crate::ingest::{IngestOutcome, IngestRequest, Ingestor};
use crate::models::SourceHint;
use crate::parse::normalize_language;
use crate::scope::CallScope;
use crate::translate::Translator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Ogg,
    Mp3,
    Wav,
}

impl AudioCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioCodec::Ogg => "ogg",
            AudioCodec::Mp3 => "mp3",
            AudioCodec::Wav => "wav",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub detected_language: String,
}

#[async_trait]
pub trait SpeechClient: Send + Sync {
    async fn transcribe(
        &self,
        audio: &[u8],
        codec: AudioCodec,
        language_hint: &str,
    ) -> Result<Transcript, IntakeError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceiptLine {
    pub name: String,
    pub qty: Option<f64>,
    pub price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReceiptAnalysis {
    pub merchant: Option<String>,
    pub total: Option<f64>,
    pub currency: Option<String>,
    pub items: Vec<ReceiptLine>,
    pub detected_language: String,
}

#[async_trait]
pub trait OcrClient: Send + Sync {
    async fn analyze(&self, image: &[u8], content_type: &str) -> Result<ReceiptAnalysis, IntakeError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredFile {
    pub file_id: String,
    pub url: String,
}

#[async_trait]
pub trait CloudStorage: Send + Sync {
    async fn upload(
        &self,
        folder: &str,
        name: &str,
        bytes: &[u8],
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<StoredFile, IntakeError>;

    async fn download(&self, file_id: &str) -> Result<Vec<u8>, IntakeError>;
}

async fn cancellable<T, F>(scope: &CallScope, fut: F) -> Result<T, IntakeError>
where
    F: Future<Output = Result<T, IntakeError>>,
{
    tokio::select! {
        biased;
        _ = scope.token().cancelled() => Err(IntakeError::Cancelled),
        res = fut => res,
    }
}

/// Transcribe a voice note and ingest the transcript.
///
/// `req.text` is replaced by the transcript and `req.source` becomes
/// [`SourceHint::Voice`]. An empty `req.language` is filled from the
/// transcriber's detection when it has one.
pub async fn ingest_voice(
    speech: &dyn SpeechClient,
    ingestor: &Ingestor,
    audio: &[u8],
    codec: AudioCodec,
    mut req: IngestRequest,
    scope: &CallScope,
) -> Result<IngestOutcome, IntakeError> {
    let transcript = cancellable(scope, speech.transcribe(audio, codec, &req.language)).await?;
    let text = transcript.text.trim();
    if text.is_empty() {
        return Err(IntakeError::EmptyTranscript);
    }

    tracing::info!(
        codec = codec.as_str(),
        chars = text.len(),
        detected_language = %transcript.detected_language,
        "voice note transcribed"
    );

    req.text = text.to_string();
    req.source = SourceHint::Voice;
    if req.language.trim().is_empty() {
        req.language = transcript.detected_language.clone();
    }

    Ok(ingestor.ingest(&req, scope).await?)
}

const RECEIPT_TYPES: &[(&str, &str)] = &[
    ("image/jpeg", ".jpg"),
    ("image/jpg", ".jpg"),
    ("image/png", ".png"),
    ("image/webp", ".webp"),
    ("image/bmp", ".bmp"),
    ("image/gif", ".gif"),
    ("application/pdf", ".pdf"),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalizedLine {
    pub original_name: String,
    pub localized_name: String,
    pub qty: Option<f64>,
    pub price: Option<f64>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalizedReceipt {
    pub file: StoredFile,
    pub merchant: Option<String>,
    pub total: Option<f64>,
    pub currency: Option<String>,
    pub detected_language: String,
    pub locale: String,
    pub items: Vec<LocalizedLine>,
}

fn receipt_extension(content_type: &str) -> Result<&'static str, IntakeError> {
    RECEIPT_TYPES
        .iter()
        .find(|(ty, _)| *ty == content_type)
        .map(|(_, ext)| *ext)
        .ok_or_else(|| IntakeError::UnsupportedMedia(content_type.to_string()))
}

pub struct ReceiptIntake {
    storage: Arc<dyn CloudStorage>,
    ocr: Arc<dyn OcrClient>,
    translator: Arc<dyn Translator>,
}

impl ReceiptIntake {
    pub fn new(
        storage: Arc<dyn CloudStorage>,
        ocr: Arc<dyn OcrClient>,
        translator: Arc<dyn Translator>,
    ) -> Self {
        Self {
            storage,
            ocr,
            translator,
        }
    }

    /// Store, analyze, and localize a receipt image for `user_id`.
    pub async fn process(
        &self,
        user_id: Uuid,
        image: &[u8],
        content_type: &str,
        locale: &str,
        scope: &CallScope,
    ) -> Result<LocalizedReceipt, IntakeError> {
        let content_type = content_type.trim().to_lowercase();
        let extension = receipt_extension(&content_type)?;

        let folder = format!("receipts/{}", user_id);
        let name = format!("{}{}", Uuid::new_v4(), extension);
        let metadata = HashMap::from([
            ("user_id".to_string(), user_id.to_string()),
            ("content_type".to_string(), content_type.clone()),
        ]);

        let file = cancellable(
            scope,
            self.storage
                .upload(&folder, &name, image, &content_type, &metadata),
        )
        .await?;
        tracing::info!(%user_id, file_id = %file.file_id, bytes = image.len(), "receipt stored");

        self.localize(user_id, file, image, &content_type, locale, scope)
            .await
    }

    /// Analyze and localize a receipt stored earlier, e.g. into another locale.
    pub async fn reprocess(
        &self,
        user_id: Uuid,
        file: StoredFile,
        content_type: &str,
        locale: &str,
        scope: &CallScope,
    ) -> Result<LocalizedReceipt, IntakeError> {
        let content_type = content_type.trim().to_lowercase();
        receipt_extension(&content_type)?;

        let image = cancellable(scope, self.storage.download(&file.file_id)).await?;
        tracing::info!(%user_id, file_id = %file.file_id, bytes = image.len(), "receipt fetched");

        self.localize(user_id, file, &image, &content_type, locale, scope)
            .await
    }

    async fn localize(
        &self,
        user_id: Uuid,
        file: StoredFile,
        image: &[u8],
        content_type: &str,
        locale: &str,
        scope: &CallScope,
    ) -> Result<LocalizedReceipt, IntakeError> {
        let locale = normalize_language(locale);
        let analysis = cancellable(scope, self.ocr.analyze(image, content_type)).await?;

        let names: Vec<String> = analysis.items.iter().map(|line| line.name.clone()).collect();
        let mut detected_language = analysis.detected_language.clone();

        let items = if names.is_empty() {
            Vec::new()
        } else {
            let batch = self
                .translator
                .batch_translate(&names, &locale, scope)
                .await?;
            if detected_language.is_empty() {
                detected_language = batch.detected_language.clone();
            }

            analysis
                .items
                .iter()
                .zip(batch.translations)
                .map(|(line, t)| LocalizedLine {
                    original_name: line.name.clone(),
                    localized_name: t.translated_text,
                    qty: line.qty,
                    price: line.price,
                    confidence: t.confidence,
                })
                .collect()
        };

        tracing::info!(
            %user_id,
            items = names.len(),
            locale = %locale,
            detected_language = %detected_language,
            "receipt localized"
        );

        Ok(LocalizedReceipt {
            file,
            merchant: analysis.merchant,
            total: analysis.total,
            currency: analysis.currency,
            detected_language,
            locale,
            items,
        })
    }
}
