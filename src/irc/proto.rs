use std::collections::HashMap;

/// One parsed IRC line: `[@tags] [:prefix] <command> [params]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrcMessage {
    pub tags: Option<String>,
    pub prefix: Option<String>,
    pub command: Option<String>,
    pub params: Option<String>,
}

/// The `:name[!user][@host]` source of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prefix {
    pub name: String,
    pub user: Option<String>,
    pub host: Option<String>,
}

/// Split one raw line into its message sections. Never fails: lines that
/// carry no command parse to a message with `command == None` and are
/// dropped by the caller.
pub fn parse_message(line: &str) -> IrcMessage {
    let mut parsed = IrcMessage::default();
    let mut rest = line;

    if let Some(tagged) = rest.strip_prefix('@') {
        match tagged.split_once(' ') {
            Some((tags, tail)) => {
                parsed.tags = Some(tags.to_string());
                rest = tail;
            }
            None => {
                parsed.tags = Some(tagged.to_string());
                return parsed;
            }
        }
    }

    if let Some(prefixed) = rest.strip_prefix(':') {
        match prefixed.split_once(' ') {
            Some((prefix, tail)) => {
                parsed.prefix = Some(prefix.to_string());
                rest = tail;
            }
            None => {
                parsed.prefix = Some(prefixed.to_string());
                return parsed;
            }
        }
    }

    match rest.split_once(' ') {
        Some((command, params)) => {
            parsed.command = Some(command.to_string());
            parsed.params = Some(params.to_string());
        }
        None if !rest.is_empty() => parsed.command = Some(rest.to_string()),
        None => {}
    }

    parsed
}

/// Parse an IRCv3 tag string into a key/value map. Valueless tags map to an
/// empty string.
pub fn parse_tags(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter(|tag| !tag.is_empty())
        .filter_map(|tag| {
            let (key, value) = tag.split_once('=').unwrap_or((tag, ""));
            (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

pub fn parse_prefix(raw: &str) -> Prefix {
    let (rest, host) = match raw.rsplit_once('@') {
        Some((rest, host)) => (rest, Some(host.to_string())),
        None => (raw, None),
    };
    let (name, user) = match rest.rsplit_once('!') {
        Some((name, user)) => (name, Some(user.to_string())),
        None => (rest, None),
    };
    Prefix {
        name: name.to_string(),
        user,
        host,
    }
}

/// Split a params section into middle parameters and the trailing text
/// (after the first stand-alone `:`). The trailing is empty when absent.
pub fn parse_params(params: &str) -> (Vec<String>, String) {
    let mut middles = Vec::new();
    let mut rest = params;

    loop {
        rest = rest.trim_start_matches(' ');
        if rest.is_empty() {
            return (middles, String::new());
        }
        if let Some(trailing) = rest.strip_prefix(':') {
            return (middles, trailing.to_string());
        }
        match rest.split_once(' ') {
            Some((middle, tail)) => {
                middles.push(middle.to_string());
                rest = tail;
            }
            None => {
                middles.push(rest.to_string());
                return (middles, String::new());
            }
        }
    }
}
