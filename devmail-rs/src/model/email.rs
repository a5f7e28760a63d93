use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A captured email, as parsed from the raw `.eml` on disk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Email {
    /// Path-safe identifier, also the `.eml` file stem and attachment directory name
    pub id: String,
    pub time: DateTime<Utc>,
    pub read: bool,
    pub subject: String,
    pub from: Vec<MailAddress>,
    pub to: Vec<MailAddress>,
    pub cc: Vec<MailAddress>,
    pub bcc: Vec<MailAddress>,
    /// Envelope recipients missing from both To and Cc
    pub calculated_bcc: Vec<MailAddress>,
    pub text: String,
    pub html: String,
    pub attachments: Vec<Attachment>,
    pub envelope: Option<Envelope>,
    pub source: String,
    pub size: u64,
    pub size_human: String,
    pub headers: BTreeMap<String, HeaderValue>,
}

impl Email {
    /// True while the receive time has not been assigned
    pub fn time_unset(&self) -> bool {
        self.time == DateTime::<Utc>::default()
    }

    /// First address of the From header, if any
    pub fn from_address(&self) -> Option<&str> {
        self.from
            .iter()
            .map(|a| a.address.as_str())
            .find(|a| !a.is_empty())
    }

    pub fn attachment(&self, generated_file_name: &str) -> Option<&Attachment> {
        self.attachments
            .iter()
            .find(|a| a.generated_file_name == generated_file_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub content_type: String,
    pub file_name: String,
    pub generated_file_name: String,
    pub content_id: String,
    pub size: u64,
    #[serde(skip)]
    pub transformed: bool,
}

/// SMTP-level transport facts, independent of what the headers claim
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub from: String,
    pub to: Vec<String>,
    pub host: String,
    pub remote_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailAddress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub address: String,
}

impl MailAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
        }
    }

    pub fn with_name(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            address: address.into(),
        }
    }
}

impl fmt::Display for MailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) if !name.is_empty() => write!(f, "\"{}\" <{}>", name, self.address),
            _ => write!(f, "<{}>", self.address),
        }
    }
}

/// A header seen once is kept as a string, a repeated header as the ordered list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Single(String),
    Multiple(Vec<String>),
}

impl HeaderValue {
    pub fn push(&mut self, value: String) {
        match self {
            HeaderValue::Single(first) => {
                let first = std::mem::take(first);
                *self = HeaderValue::Multiple(vec![first, value]);
            }
            HeaderValue::Multiple(values) => values.push(value),
        }
    }

    /// First occurrence
    pub fn first(&self) -> Option<&str> {
        match self {
            HeaderValue::Single(value) => Some(value),
            HeaderValue::Multiple(values) => values.first().map(String::as_str),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailStats {
    pub total: usize,
    pub unread: usize,
    pub read: usize,
    /// Count per `YYYY-MM-DD`
    pub by_date: BTreeMap<String, usize>,
}
