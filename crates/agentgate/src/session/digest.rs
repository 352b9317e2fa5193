//! Content digest of a conversation context.

use sha2::{Digest, Sha256};

use crate::openai::{ChatMessage, ContentPart, MessageContent, Role};

/// Deterministic, order-sensitive SHA-256 digest of a message list.
///
/// Every field is length-prefixed so that no two distinct contexts share an
/// encoding. Roles, content shape (text, part list or `null`), part order,
/// text, image payload bytes and the raw JSON of unrecognised parts all
/// contribute.
pub fn context_digest(context: &[ChatMessage]) -> String {
    let mut hasher = Sha256::new();
    write_len(&mut hasher, context.len());
    for message in context {
        hasher.update([role_tag(message.role)]);
        match &message.content {
            MessageContent::Text(text) => {
                hasher.update(b"T");
                write_bytes(&mut hasher, text.as_bytes());
            }
            MessageContent::Parts(parts) => {
                hasher.update(b"P");
                write_len(&mut hasher, parts.len());
                for part in parts {
                    write_part(&mut hasher, part);
                }
            }
            MessageContent::Null => hasher.update(b"N"),
        }
    }
    hex::encode(hasher.finalize())
}

fn role_tag(role: Role) -> u8 {
    match role {
        Role::System => b's',
        Role::Developer => b'd',
        Role::User => b'u',
        Role::Assistant => b'a',
    }
}

fn write_part(hasher: &mut Sha256, part: &ContentPart) {
    match part {
        ContentPart::Text { text } => {
            hasher.update(b"t");
            write_bytes(hasher, text.as_bytes());
        }
        ContentPart::ImageUrl { image_url } => {
            hasher.update(b"i");
            write_bytes(hasher, image_url.url.as_bytes());
            match &image_url.detail {
                Some(detail) => {
                    hasher.update(b"d");
                    write_bytes(hasher, detail.as_bytes());
                }
                None => hasher.update(b"-"),
            }
        }
        ContentPart::Unknown(value) => {
            // serde_json maps keep their keys sorted, so this is canonical.
            hasher.update(b"?");
            write_bytes(hasher, value.to_string().as_bytes());
        }
    }
}

fn write_len(hasher: &mut Sha256, len: usize) {
    hasher.update((len as u64).to_le_bytes());
}

fn write_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    write_len(hasher, bytes.len());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::ImageUrl;

    fn image(url: &str) -> ContentPart {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: url.to_string(),
                detail: None,
            },
        }
    }

    #[test]
    fn test_digest_is_deterministic() {
        let ctx = vec![ChatMessage::user("hello"), ChatMessage::assistant("hi")];
        assert_eq!(context_digest(&ctx), context_digest(&ctx));
        assert_eq!(context_digest(&ctx), context_digest(&ctx.clone()));
        assert_eq!(context_digest(&ctx).len(), 64);
    }

    #[test]
    fn test_digest_is_order_sensitive() {
        let a = vec![ChatMessage::user("one"), ChatMessage::user("two")];
        let b = vec![ChatMessage::user("two"), ChatMessage::user("one")];
        assert_ne!(context_digest(&a), context_digest(&b));
    }

    #[test]
    fn test_digest_distinguishes_role() {
        let a = vec![ChatMessage::user("same")];
        let b = vec![ChatMessage::assistant("same")];
        assert_ne!(context_digest(&a), context_digest(&b));
    }

    #[test]
    fn test_digest_distinguishes_boundaries() {
        let a = vec![ChatMessage::user("ab"), ChatMessage::user("c")];
        let b = vec![ChatMessage::user("a"), ChatMessage::user("bc")];
        assert_ne!(context_digest(&a), context_digest(&b));
    }

    #[test]
    fn test_digest_distinguishes_text_from_single_part() {
        let a = vec![ChatMessage::user("hi")];
        let b = vec![ChatMessage {
            role: Role::User,
            content: MessageContent::Parts(vec![ContentPart::Text {
                text: "hi".to_string(),
            }]),
        }];
        assert_ne!(context_digest(&a), context_digest(&b));
    }

    #[test]
    fn test_digest_distinguishes_image_payload() {
        let with = |url: &str| {
            vec![ChatMessage {
                role: Role::User,
                content: MessageContent::Parts(vec![
                    ContentPart::Text {
                        text: "look".to_string(),
                    },
                    image(url),
                ]),
            }]
        };
        assert_ne!(
            context_digest(&with("data:image/png;base64,AAAA")),
            context_digest(&with("data:image/png;base64,AAAB"))
        );
    }

    #[test]
    fn test_digest_distinguishes_unknown_part_payload() {
        let with = |data: &str| -> Vec<ChatMessage> {
            serde_json::from_value(serde_json::json!([{
                "role": "user",
                "content": [
                    {"type": "text", "text": "listen"},
                    {"type": "input_audio", "input_audio": {"data": data, "format": "wav"}}
                ]
            }]))
            .unwrap()
        };
        assert_ne!(context_digest(&with("AAAA")), context_digest(&with("BBBB")));
        assert_eq!(context_digest(&with("AAAA")), context_digest(&with("AAAA")));
    }

    #[test]
    fn test_digest_distinguishes_developer_from_system() {
        let parse = |role: &str| -> Vec<ChatMessage> {
            serde_json::from_value(serde_json::json!([{"role": role, "content": "rules"}])).unwrap()
        };
        assert_ne!(context_digest(&parse("system")), context_digest(&parse("developer")));
    }

    #[test]
    fn test_digest_distinguishes_null_from_empty_content() {
        let null: Vec<ChatMessage> =
            serde_json::from_value(serde_json::json!([{"role": "assistant", "content": null}]))
                .unwrap();
        let empty = vec![ChatMessage::assistant("")];
        assert_ne!(context_digest(&null), context_digest(&empty));
    }

    #[test]
    fn test_empty_context_has_stable_digest() {
        assert_eq!(context_digest(&[]), context_digest(&[]));
        assert_ne!(context_digest(&[]), context_digest(&[ChatMessage::user("")]));
    }
}
