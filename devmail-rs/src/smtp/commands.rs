use crate::error::{MailError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Quit,
    Noop,
    Starttls,
    /// Mechanism and optional initial response
    Auth(String, Option<String>),
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(MailError::SmtpProtocol("Empty command".to_string()));
        }

        let (command, args) = match line.split_once(' ') {
            Some((command, args)) => (command.to_uppercase(), args.trim()),
            None => (line.to_uppercase(), ""),
        };

        match command.as_str() {
            "HELO" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol("HELO requires domain".to_string()));
                }
                Ok(SmtpCommand::Helo(args.to_string()))
            }
            "EHLO" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol("EHLO requires domain".to_string()));
                }
                Ok(SmtpCommand::Ehlo(args.to_string()))
            }
            "MAIL" => Ok(SmtpCommand::MailFrom(Self::parse_path(args, "FROM:")?)),
            "RCPT" => {
                let to = Self::parse_path(args, "TO:")?;
                if to.is_empty() {
                    return Err(MailError::SmtpProtocol("Empty recipient".to_string()));
                }
                Ok(SmtpCommand::RcptTo(to))
            }
            "DATA" => Ok(SmtpCommand::Data),
            "RSET" => Ok(SmtpCommand::Rset),
            "QUIT" => Ok(SmtpCommand::Quit),
            "NOOP" => Ok(SmtpCommand::Noop),
            "STARTTLS" => Ok(SmtpCommand::Starttls),
            "AUTH" => {
                let mut parts = args.split_whitespace();
                let mechanism = parts
                    .next()
                    .ok_or_else(|| MailError::SmtpProtocol("AUTH requires mechanism".to_string()))?;
                let initial = parts.next().map(str::to_string);
                Ok(SmtpCommand::Auth(mechanism.to_uppercase(), initial))
            }
            _ => Ok(SmtpCommand::Unknown(command)),
        }
    }

    /// Address from `FROM:<addr> [params]` or `TO:<addr> [params]`
    ///
    /// ESMTP parameters such as `SIZE=` or `BODY=` are ignored.
    fn parse_path(args: &str, keyword: &str) -> Result<String> {
        let path = match args.get(..keyword.len()) {
            Some(prefix) if prefix.eq_ignore_ascii_case(keyword) => {
                args[keyword.len()..].trim_start()
            }
            _ => {
                return Err(MailError::SmtpProtocol(format!(
                    "Invalid syntax, expected {}",
                    keyword
                )))
            }
        };
        let address = match path.strip_prefix('<') {
            Some(rest) => rest
                .split_once('>')
                .map(|(address, _)| address)
                .ok_or_else(|| MailError::SmtpProtocol("Unterminated address".to_string()))?,
            None => path.split_whitespace().next().unwrap_or(""),
        };

        Ok(address.trim().to_string())
    }
}
