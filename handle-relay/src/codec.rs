//! Line protocol spoken by relay connections and the admin console.
//!
//! Every function here is pure: it takes a received line (or pieces of one)
//! and returns a parsed request, or builds the bytes of an outbound frame.
//! Outbound frames do not carry the trailing newline; the session writer
//! appends it.

use thiserror::Error;

/// Separates the declared body length from the body in a `MSG` command.
pub const BODY_DELIMITER: &[u8] = b"//";

/// Acknowledgment written to a connection once its handle is registered.
pub const REGISTERED_ACK: &[u8] = b"Done!";

/// Console reply for anything that is not `CLIENTS` or `ALL`.
pub const CONSOLE_COMMAND_NOT_FOUND: &str = "Command not found";

/// Reasons an inbound line is rejected. The `Display` text is exactly what
/// follows `Error: ` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("nickname cannot be blank")]
    BlankHandle,
    #[error("nickname must be valid UTF-8")]
    InvalidHandle,
    #[error("recipient must be user ('@nickname')")]
    RecipientNotUser,
    #[error("recipient must have a nickname")]
    EmptyRecipient,
    #[error("no message body")]
    MissingLength,
    #[error("message body is empty")]
    EmptyBody,
    #[error("message body is shorter than its declared length")]
    BodyOutOfRange { declared: usize, available: usize },
    #[error("register first with 'REG <nickname>'")]
    NotRegistered,
    #[error("command not found")]
    CommandNotFound,
}

/// A length-prefixed message body. `content` always holds exactly `len` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub len: usize,
    pub content: Vec<u8>,
}

impl Message {
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        Self {
            len: content.len(),
            content,
        }
    }
}

/// Commands a client connection may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register(String),
    Unicast { recipient: String, message: Message },
}

/// Commands the operator console may issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    ListClients,
    Broadcast(Vec<u8>),
}

/// Decodes one line received from a client. Blank lines decode to `None`.
pub fn decode_request(line: &[u8]) -> Result<Option<Request>, ProtocolError> {
    let (command, args) = split_command(line);
    match command {
        b"" => Ok(None),
        b"REG" => parse_register(args).map(|handle| Some(Request::Register(handle))),
        b"MSG" => parse_unicast(args)
            .map(|(recipient, message)| Some(Request::Unicast { recipient, message })),
        _ => Err(ProtocolError::CommandNotFound),
    }
}

/// Decodes one console line. Blank lines decode to `None`.
pub fn decode_console(line: &[u8]) -> Result<Option<ConsoleCommand>, ProtocolError> {
    let (command, args) = split_command(line);
    match command {
        b"" => Ok(None),
        b"CLIENTS" => Ok(Some(ConsoleCommand::ListClients)),
        b"ALL" => Ok(Some(ConsoleCommand::Broadcast(args.trim_ascii_end().to_vec()))),
        _ => Err(ProtocolError::CommandNotFound),
    }
}

/// Splits a line into its command token and the rest of the line.
///
/// The line terminator and the whitespace around the token are removed.
/// Trailing whitespace of the rest is kept so that message bodies survive
/// intact; callers that treat the rest as text trim it themselves.
pub fn split_command(line: &[u8]) -> (&[u8], &[u8]) {
    let line = strip_line_ending(line).trim_ascii_start();
    let (command, rest) = split_token(line);
    (command, rest.trim_ascii_start())
}

/// Parses the argument of `REG`.
pub fn parse_register(args: &[u8]) -> Result<String, ProtocolError> {
    let handle = args.trim_ascii();
    if handle.is_empty() {
        return Err(ProtocolError::BlankHandle);
    }
    handle_text(handle)
}

/// Parses the arguments of `MSG`: `@<recipient> <len>//<body>`.
pub fn parse_unicast(args: &[u8]) -> Result<(String, Message), ProtocolError> {
    let args = args.trim_ascii_start();
    let Some(addressed) = args.strip_prefix(b"@") else {
        return Err(ProtocolError::RecipientNotUser);
    };

    let (recipient, framed) = split_token(addressed);
    if recipient.is_empty() {
        return Err(ProtocolError::EmptyRecipient);
    }

    let recipient = handle_text(recipient)?;
    let message = decode_body(framed.trim_ascii_start())?;
    Ok((recipient, message))
}

/// Decodes `<len>//<body>`. Bytes past the declared length are ignored.
pub fn decode_body(framed: &[u8]) -> Result<Message, ProtocolError> {
    let delimiter = framed
        .windows(BODY_DELIMITER.len())
        .position(|window| window == BODY_DELIMITER)
        .ok_or(ProtocolError::MissingLength)?;

    let declared = parse_length(&framed[..delimiter]).ok_or(ProtocolError::MissingLength)?;
    if declared == 0 {
        return Err(ProtocolError::EmptyBody);
    }

    let padding = delimiter + BODY_DELIMITER.len();
    let available = framed.len() - padding;
    if declared > available {
        return Err(ProtocolError::BodyOutOfRange {
            declared,
            available,
        });
    }

    Ok(Message::new(&framed[padding..padding + declared]))
}

/// Builds a complete `MSG` line, terminator included.
pub fn encode_unicast(recipient: &str, body: &[u8]) -> Vec<u8> {
    let mut line = format!("MSG @{recipient} {}", body.len()).into_bytes();
    line.extend_from_slice(BODY_DELIMITER);
    line.extend_from_slice(body);
    line.push(b'\n');
    line
}

/// Frames a delivered message: `@<sender> <body>`.
pub fn frame_delivery(sender: &str, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(sender.len() + body.len() + 2);
    frame.push(b'@');
    frame.extend_from_slice(sender.as_bytes());
    frame.push(b' ');
    frame.extend_from_slice(body);
    frame
}

/// Frames an error response: `Error: <description>`.
pub fn frame_error(error: &ProtocolError) -> Vec<u8> {
    format!("Error: {error}").into_bytes()
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn handle_text(handle: &[u8]) -> Result<String, ProtocolError> {
    std::str::from_utf8(handle)
        .map(str::to_owned)
        .map_err(|_| ProtocolError::InvalidHandle)
}

fn split_token(input: &[u8]) -> (&[u8], &[u8]) {
    match input.iter().position(u8::is_ascii_whitespace) {
        Some(end) => input.split_at(end),
        None => (input, &[]),
    }
}

fn parse_length(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}
