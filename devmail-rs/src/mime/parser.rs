use mail_parser::{Address, MessageParser, MessagePart, MimeHeaders, PartType};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::attachment::transform_attachment;
use super::date::parse_email_date;
use super::types::{MimePart, ParsedEmail};
use crate::error::{MailError, Result};
use crate::model::{Attachment, Email, Envelope, HeaderValue, MailAddress};

/// Headers copied verbatim into [`Email::headers`]
pub const COMMON_HEADERS: &[&str] = &[
    "From",
    "To",
    "Cc",
    "Bcc",
    "Subject",
    "Date",
    "Message-ID",
    "Reply-To",
    "In-Reply-To",
    "References",
    "Content-Type",
    "Content-Transfer-Encoding",
    "MIME-Version",
    "X-Mailer",
    "X-Priority",
    "Priority",
    "Importance",
];

/// MIME message parser
pub struct MimeParser;

impl MimeParser {
    /// Parse a raw message into an [`Email`] plus its attachment bytes
    ///
    /// `envelope` carries the SMTP transport facts of a live session. Without
    /// it the envelope recipients are taken from the `To` header and the
    /// sender, host and peer are left unknown.
    pub fn parse(raw: &[u8], envelope: Option<Envelope>) -> Result<ParsedEmail> {
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(MailError::Parse("empty message".to_string()));
        }

        let message = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| MailError::Parse("failed to parse MIME structure".to_string()))?;

        let raw_headers: Vec<(String, String)> = message
            .headers_raw()
            .map(|(name, value)| (name.to_string(), unfold(value)))
            .collect();
        if raw_headers.is_empty() {
            return Err(MailError::Parse("no header section found".to_string()));
        }

        let mut email = Email {
            headers: Self::common_headers(&raw_headers),
            time: parse_email_date(Self::header(&raw_headers, "Date")),
            subject: message
                .subject()
                .map(str::to_string)
                .or_else(|| Self::header(&raw_headers, "Subject").map(str::to_string))
                .unwrap_or_default(),
            from: Self::addresses(message.from()),
            to: Self::addresses(message.to()),
            cc: Self::addresses(message.cc()),
            bcc: Self::addresses(message.bcc()),
            ..Default::default()
        };

        let mut parts = Vec::new();
        let root_type = message
            .root_part()
            .content_type()
            .map(|ct| Self::media_type(ct.ctype(), ct.subtype()))
            .unwrap_or_else(|| "text/plain".to_string());

        if root_type.starts_with("multipart/") {
            for part in message.parts.iter().skip(1) {
                Self::categorize_part(&mut email, &mut parts, part);
            }
        } else {
            let body = Self::body_text(message.root_part());
            if root_type.starts_with("text/html") {
                email.html = body.trim().to_string();
            } else {
                email.text = body.trim().to_string();
            }
        }

        email.envelope = Some(envelope.unwrap_or_else(|| Envelope {
            from: String::new(),
            to: email.to.iter().map(|a| a.address.clone()).collect(),
            host: "unknown".to_string(),
            remote_address: "unknown".to_string(),
        }));

        debug!(
            "Parsed message '{}' ({} attachment(s))",
            email.subject,
            email.attachments.len()
        );

        Ok(ParsedEmail { email, parts })
    }

    /// Sort one leaf part into text, HTML or attachment
    fn categorize_part(email: &mut Email, parts: &mut Vec<MimePart>, part: &MessagePart<'_>) {
        if matches!(part.body, PartType::Multipart(_)) {
            return;
        }
        if part.is_encoding_problem {
            warn!("Skipping malformed MIME part at offset {}", part.offset_header);
            return;
        }

        let media_type = part
            .content_type()
            .map(|ct| Self::media_type(ct.ctype(), ct.subtype()))
            .unwrap_or_else(|| "text/plain".to_string());
        let disposition = part
            .content_disposition()
            .map(|cd| cd.ctype().to_ascii_lowercase())
            .unwrap_or_default();
        let is_attachment = disposition == "attachment";
        let content_id = part
            .content_id()
            .map(|id| id.trim().trim_matches(|c| c == '<' || c == '>').to_string())
            .unwrap_or_default();

        if media_type == "text/plain" && !is_attachment {
            email.text = Self::body_text(part).trim().to_string();
        } else if media_type == "text/html" && !is_attachment {
            email.html = Self::body_text(part).trim().to_string();
        } else if is_attachment || !content_id.is_empty() {
            let file_name = part
                .content_disposition()
                .and_then(|cd| cd.attribute("filename"))
                .or_else(|| part.attachment_name())
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| media_type.clone());

            let body = part.contents().to_vec();
            let mut attachment = Attachment {
                content_type: media_type,
                file_name,
                content_id,
                size: body.len() as u64,
                ..Default::default()
            };
            transform_attachment(&mut attachment, email.attachments.len(), &body);

            parts.push(MimePart {
                generated_file_name: attachment.generated_file_name.clone(),
                body,
            });
            email.attachments.push(attachment);
        }
    }

    fn body_text(part: &MessagePart<'_>) -> String {
        match &part.body {
            PartType::Text(text) | PartType::Html(text) => text.to_string(),
            _ => String::from_utf8_lossy(part.contents()).into_owned(),
        }
    }

    fn media_type(ctype: &str, subtype: Option<&str>) -> String {
        match subtype {
            Some(subtype) => format!("{}/{}", ctype, subtype).to_ascii_lowercase(),
            None => ctype.to_ascii_lowercase(),
        }
    }

    fn addresses(address: Option<&Address<'_>>) -> Vec<MailAddress> {
        address
            .map(|list| {
                list.iter()
                    .filter_map(|addr| {
                        let address = addr.address()?;
                        Some(MailAddress {
                            name: addr.name().map(str::to_string),
                            address: address.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Collect the allow-listed headers, keeping every value of repeated ones
    fn common_headers(raw_headers: &[(String, String)]) -> BTreeMap<String, HeaderValue> {
        let mut headers: BTreeMap<String, HeaderValue> = BTreeMap::new();

        for (name, value) in raw_headers {
            if value.is_empty() {
                continue;
            }
            let Some(canonical) = COMMON_HEADERS
                .iter()
                .find(|common| common.eq_ignore_ascii_case(name))
            else {
                continue;
            };

            match headers.get_mut(*canonical) {
                Some(existing) => existing.push(value.clone()),
                None => {
                    headers.insert(canonical.to_string(), HeaderValue::Single(value.clone()));
                }
            }
        }

        headers
    }

    /// First raw value of a header, case-insensitive
    fn header<'a>(raw_headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        raw_headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Join folded header lines into one value
fn unfold(value: &str) -> String {
    value
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
