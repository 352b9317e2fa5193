//! Flattening a message list into the agent's single free-text prompt.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::{debug, warn};

use crate::openai::{ChatMessage, ContentPart, MessageContent, Role};

/// Prompt text plus the out-of-band system instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
    pub system: Option<String>,
}

/// Private scratch directory for inline images handed to the agent by path.
#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `$TMPDIR/agentgate-images`.
    pub fn default_dir() -> PathBuf {
        std::env::temp_dir().join("agentgate-images")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Decode a `data:<mime>;base64,<payload>` URL and write it to a fresh,
    /// uniquely named file. Returns the file path.
    pub async fn persist_data_url(&self, url: &str) -> Result<PathBuf> {
        let (mime, payload) = parse_data_url(url)?;
        let bytes = STANDARD
            .decode(payload.trim())
            .context("decoding inline image payload")?;

        self.ensure_dir().await?;
        let path = self.dir.join(format!(
            "{}.{}",
            uuid::Uuid::new_v4(),
            extension_for(mime)
        ));
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("writing image {}", path.display()))?;
        debug!("Persisted inline image ({} bytes) to {}", bytes.len(), path.display());
        Ok(path)
    }

    async fn ensure_dir(&self) -> Result<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder
            .create(&self.dir)
            .await
            .with_context(|| format!("creating image directory {}", self.dir.display()))
    }
}

fn parse_data_url(url: &str) -> Result<(&str, &str)> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| anyhow!("not a data URL"))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| anyhow!("data URL has no payload"))?;
    let mime = header
        .strip_suffix(";base64")
        .ok_or_else(|| anyhow!("only base64 data URLs are supported"))?;
    Ok((mime, payload))
}

fn extension_for(mime: &str) -> &'static str {
    match mime.to_ascii_lowercase().as_str() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        _ => "bin",
    }
}

/// Build the agent prompt.
///
/// When resuming a session, or when only one non-system turn exists, the
/// prompt is that turn's text alone. Otherwise every non-system turn is
/// rendered as a `Role: text` block, blocks separated by a blank line.
/// System messages never enter the prompt body; they are joined into
/// [`Prompt::system`].
pub async fn build_prompt(messages: &[ChatMessage], resuming: bool, images: &ImageStore) -> Prompt {
    let system: Vec<String> = messages
        .iter()
        .filter(|m| m.role.is_system())
        .map(ChatMessage::text)
        .filter(|t| !t.trim().is_empty())
        .collect();
    let system = (!system.is_empty()).then(|| system.join("\n\n"));

    let turns: Vec<&ChatMessage> = messages.iter().filter(|m| !m.role.is_system()).collect();

    let text = if resuming || messages.len() == 1 || turns.len() == 1 {
        match turns.last().copied().or(messages.last()) {
            Some(message) => render_content(&message.content, images).await,
            None => String::new(),
        }
    } else {
        let mut blocks = Vec::with_capacity(turns.len());
        for message in turns {
            let body = render_content(&message.content, images).await;
            blocks.push(format!("{}: {}", message.role.label(), body));
        }
        blocks.join("\n\n")
    };

    Prompt { text, system }
}

/// Render content as text, replacing images with textual references.
async fn render_content(content: &MessageContent, images: &ImageStore) -> String {
    let parts = match content {
        MessageContent::Text(text) => return text.clone(),
        MessageContent::Parts(parts) => parts,
        MessageContent::Null => return String::new(),
    };

    let mut rendered = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            ContentPart::Text { text } => rendered.push(text.clone()),
            ContentPart::ImageUrl { image_url } if image_url.url.starts_with("data:") => {
                match images.persist_data_url(&image_url.url).await {
                    Ok(path) => rendered.push(format!("[Image: {}]", path.display())),
                    Err(e) => {
                        warn!("Dropping inline image: {:?}", e);
                        rendered.push("[Image: unavailable]".to_string());
                    }
                }
            }
            ContentPart::ImageUrl { image_url } => {
                rendered.push(format!("[Image: {}]", image_url.url));
            }
            ContentPart::Unknown(_) => {}
        }
    }
    rendered.join("\n")
}
