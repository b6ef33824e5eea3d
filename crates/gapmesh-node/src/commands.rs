//! User text-stream commands and share deep links.
//!
//! Parsing only; the semantics are the application's business. Unknown
//! slash-commands are surfaced as such so the UI can answer with help text.

use url::Url;

/// A parsed slash command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/j <channel>`: join a channel
    Join(String),
    /// `/m <name> <text>`: private message
    Message {
        /// Target nickname
        name: String,
        /// Message body
        text: String,
    },
    /// `/w`: who is online
    Who,
    /// `/channels`: list known channels
    Channels,
    /// `/block <name>`
    Block(String),
    /// `/unblock <name>`
    Unblock(String),
    /// `/slap <name>`
    Slap(String),
    /// `/hug <name>`
    Hug(String),
    /// `/clear`
    Clear,
    /// Anything else starting with a slash
    Unknown(String),
}

/// Parse a line of user input. Returns `None` when the line is not a
/// command and should be sent as a message.
#[must_use]
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if !line.starts_with('/') {
        return None;
    }
    let mut parts = line.splitn(2, char::is_whitespace);
    let verb = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or("").trim();

    let one_arg = |rest: &str| -> Option<String> {
        (!rest.is_empty()).then(|| rest.split_whitespace().next().unwrap_or("").to_string())
    };

    Some(match verb {
        "/j" => match one_arg(rest) {
            Some(channel) => Command::Join(channel),
            None => Command::Unknown(line.to_string()),
        },
        "/m" => {
            let mut m = rest.splitn(2, char::is_whitespace);
            match (m.next().filter(|n| !n.is_empty()), m.next()) {
                (Some(name), Some(text)) => Command::Message {
                    name: name.to_string(),
                    text: text.trim().to_string(),
                },
                _ => Command::Unknown(line.to_string()),
            }
        }
        "/w" => Command::Who,
        "/channels" => Command::Channels,
        "/block" => match one_arg(rest) {
            Some(name) => Command::Block(name),
            None => Command::Unknown(line.to_string()),
        },
        "/unblock" => match one_arg(rest) {
            Some(name) => Command::Unblock(name),
            None => Command::Unknown(line.to_string()),
        },
        "/slap" => match one_arg(rest) {
            Some(name) => Command::Slap(name),
            None => Command::Unknown(line.to_string()),
        },
        "/hug" => match one_arg(rest) {
            Some(name) => Command::Hug(name),
            None => Command::Unknown(line.to_string()),
        },
        "/clear" => Command::Clear,
        _ => Command::Unknown(line.to_string()),
    })
}

/// Extract shared text from a `bitchat://share?content=...` or
/// `gap://share?content=...` deep link.
#[must_use]
pub fn parse_share_link(link: &str) -> Option<String> {
    let url = Url::parse(link).ok()?;
    if !matches!(url.scheme(), "bitchat" | "gap") {
        return None;
    }
    if url.host_str() != Some("share") {
        return None;
    }
    url.query_pairs()
        .find(|(key, _)| key == "content")
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(parse_command("hello there"), None);
        assert_eq!(parse_command("  leading spaces"), None);
    }

    #[test]
    fn join_and_private_message() {
        assert_eq!(parse_command("/j #rooftop"), Some(Command::Join("#rooftop".into())));
        assert_eq!(
            parse_command("/m alice meet at the gate"),
            Some(Command::Message {
                name: "alice".into(),
                text: "meet at the gate".into(),
            })
        );
    }

    #[test]
    fn nullary_commands() {
        assert_eq!(parse_command("/w"), Some(Command::Who));
        assert_eq!(parse_command("/channels"), Some(Command::Channels));
        assert_eq!(parse_command("/clear"), Some(Command::Clear));
    }

    #[test]
    fn name_commands() {
        assert_eq!(parse_command("/block mallory"), Some(Command::Block("mallory".into())));
        assert_eq!(parse_command("/unblock mallory"), Some(Command::Unblock("mallory".into())));
        assert_eq!(parse_command("/slap bob"), Some(Command::Slap("bob".into())));
        assert_eq!(parse_command("/hug carol"), Some(Command::Hug("carol".into())));
    }

    #[test]
    fn malformed_and_unknown() {
        assert_eq!(parse_command("/j"), Some(Command::Unknown("/j".into())));
        assert_eq!(parse_command("/m alice"), Some(Command::Unknown("/m alice".into())));
        assert_eq!(
            parse_command("/teleport home"),
            Some(Command::Unknown("/teleport home".into()))
        );
    }

    #[test]
    fn share_links() {
        assert_eq!(
            parse_share_link("bitchat://share?content=hello%20world"),
            Some("hello world".into())
        );
        assert_eq!(
            parse_share_link("gap://share?content=caf%C3%A9"),
            Some("café".into())
        );
        assert_eq!(parse_share_link("gap://other?content=x"), None);
        assert_eq!(parse_share_link("https://share?content=x"), None);
        assert_eq!(parse_share_link("gap://share"), None);
    }
}
