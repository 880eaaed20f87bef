use core::fmt::{self, Display, Formatter};

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
        })
    }
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum Command {
    Helo(HeloVariant),
    /// An empty sender is the `null reverse-path` from
    /// [RFC-5321](https://www.ietf.org/rfc/rfc5321.txt). The second field is
    /// the declared `SIZE`, if any.
    MailFrom(String, Option<usize>),
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Quit,
    /// A known verb with arguments that could not be parsed.
    Invalid(String),
    /// A verb this server does not implement.
    Unrecognized(String),
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(v @ (HeloVariant::Ehlo(id) | HeloVariant::Helo(id))) => {
                write!(fmt, "{v} {id}")
            }
            Self::MailFrom(from, None) => write!(fmt, "MAIL FROM:<{from}>"),
            Self::MailFrom(from, Some(size)) => write!(fmt, "MAIL FROM:<{from}> SIZE={size}"),
            Self::RcptTo(rcpt) => write!(fmt, "RCPT TO:<{rcpt}>"),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::Invalid(s) | Self::Unrecognized(s) => fmt.write_str(s),
        }
    }
}

/// Extracts the address from a path, with or without angle brackets.
fn parse_path(path: &str) -> Option<&str> {
    match (path.strip_prefix('<'), path.strip_suffix('>')) {
        (Some(_), Some(_)) if path.len() >= 2 => Some(&path[1..path.len() - 1]),
        (None, None) if !path.is_empty() => Some(path),
        _ => None,
    }
}

/// Parses the ESMTP parameters of a MAIL command, keeping only `SIZE`.
fn parse_size(params: &str) -> Result<Option<usize>, String> {
    let mut size = None;

    for token in params.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        if !key.eq_ignore_ascii_case("SIZE") {
            continue;
        }
        if size.is_some() {
            return Err(String::from("Duplicate parameter 'SIZE' not allowed"));
        }
        match value.parse::<usize>() {
            Ok(0) => return Err(String::from("SIZE=0 is not allowed")),
            Ok(declared) => size = Some(declared),
            Err(_) => return Err(format!("Invalid SIZE value: {value}")),
        }
    }

    Ok(size)
}

/// Splits `line` after a case-insensitive `prefix`.
fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &line[prefix.len()..])
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(command: &str) -> Result<Self, Self::Error> {
        let trimmed = command.trim();

        if let Some(rest) = strip_prefix_ignore_case(trimmed, "MAIL FROM:") {
            let rest = rest.trim();
            let (path, params) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));

            // `<>` is the null sender; anything else must hold an address
            let from = if path == "<>" {
                ""
            } else {
                parse_path(path)
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| Self::Invalid(format!("Invalid reverse-path: {path}")))?
            };

            let size = parse_size(params).map_err(Self::Invalid)?;
            Ok(Self::MailFrom(from.to_string(), size))
        } else if let Some(rest) = strip_prefix_ignore_case(trimmed, "RCPT TO:") {
            let rest = rest.trim();
            let path = rest.split_whitespace().next().unwrap_or_default();

            parse_path(path)
                .filter(|p| !p.is_empty())
                .map(|to| Self::RcptTo(to.to_string()))
                .ok_or_else(|| Self::Invalid(format!("Invalid forward-path: {path}")))
        } else {
            let (verb, argument) = trimmed
                .split_once(' ')
                .map_or((trimmed, ""), |(verb, arg)| (verb, arg.trim()));

            match verb.to_ascii_uppercase().as_str() {
                "EHLO" | "HELO" if argument.is_empty() => {
                    Err(Self::Invalid(format!("Expected hostname in {trimmed}")))
                }
                "EHLO" => Ok(Self::Helo(HeloVariant::Ehlo(argument.to_string()))),
                "HELO" => Ok(Self::Helo(HeloVariant::Helo(argument.to_string()))),
                "DATA" => Ok(Self::Data),
                "RSET" => Ok(Self::Rset),
                "NOOP" => Ok(Self::Noop),
                "QUIT" => Ok(Self::Quit),
                "MAIL" | "RCPT" => Err(Self::Invalid(format!("Syntax error in {trimmed}"))),
                _ => Err(Self::Unrecognized(trimmed.to_string())),
            }
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Self;

    fn try_from(command: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(command).map_or_else(
            |_| Err(Self::Invalid("Unable to interpret command".to_string())),
            Self::try_from,
        )
    }
}

impl TryFrom<String> for Command {
    type Error = Self;

    fn try_from(command: String) -> Result<Self, Self::Error> {
        Self::try_from(command.as_str())
    }
}
