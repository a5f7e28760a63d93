use crate::model::Email;

/// Decoded bytes of one attachment, keyed by its generated filename
#[derive(Debug, Clone, Default)]
pub struct MimePart {
    pub generated_file_name: String,
    pub body: Vec<u8>,
}

/// Parser output: the message plus the attachment bytes the store may persist
#[derive(Debug, Clone, Default)]
pub struct ParsedEmail {
    pub email: Email,
    pub parts: Vec<MimePart>,
}
