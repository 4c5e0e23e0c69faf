//! A minimal client for the IPsec daemon's VICI command socket: packet
//! framing, the key/value message encoding and the two request shapes the
//! connector needs (plain and event-streamed commands).

use std::path::Path;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

const CMD_REQUEST: u8 = 0;
const CMD_RESPONSE: u8 = 1;
const CMD_UNKNOWN: u8 = 2;
const EVENT_REGISTER: u8 = 3;
const EVENT_UNREGISTER: u8 = 4;
const EVENT_CONFIRM: u8 = 5;
const EVENT_UNKNOWN: u8 = 6;
const EVENT: u8 = 7;

const SECTION_START: u8 = 1;
const SECTION_END: u8 = 2;
const KEY_VALUE: u8 = 3;
const LIST_START: u8 = 4;
const LIST_ITEM: u8 = 5;
const LIST_END: u8 = 6;

// sanity bound; daemon messages stay far below this
const MAX_PACKET_LEN: u32 = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ViciError {
    #[error("The daemon socket failed! Reason: {}", .0)]
    Io(#[from] std::io::Error),
    #[error("The daemon sent a malformed packet! ({})", .0)]
    Protocol(String),
    #[error("The daemon doesn't know the command '{}'!", .0)]
    UnknownCommand(String),
    #[error("The daemon doesn't emit the event '{}'!", .0)]
    UnknownEvent(String),
    #[error("The command failed: {}", .0)]
    CommandFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    Value(String),
    List(Vec<String>),
    Section(Message),
}

/// An ordered key/element map, the daemon's message structure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    entries: Vec<(String, Element)>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.entries
            .push((key.to_owned(), Element::Value(value.into())));
        self
    }

    pub fn set_list(mut self, key: &str, values: impl IntoIterator<Item = String>) -> Self {
        self.entries
            .push((key.to_owned(), Element::List(values.into_iter().collect())));
        self
    }

    pub fn set_section(mut self, key: &str, section: Message) -> Self {
        self.entries
            .push((key.to_owned(), Element::Section(section)));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Element> {
        self.entries
            .iter()
            .find(|(entry_key, _)| entry_key == key)
            .map(|(_, element)| element)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            Element::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) {
        for (key, element) in &self.entries {
            match element {
                Element::Value(value) => {
                    buffer.push(KEY_VALUE);
                    push_name(buffer, key);
                    push_value(buffer, value);
                }
                Element::List(values) => {
                    buffer.push(LIST_START);
                    push_name(buffer, key);
                    for value in values {
                        buffer.push(LIST_ITEM);
                        push_value(buffer, value);
                    }
                    buffer.push(LIST_END);
                }
                Element::Section(section) => {
                    buffer.push(SECTION_START);
                    push_name(buffer, key);
                    section.encode(buffer);
                    buffer.push(SECTION_END);
                }
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, ViciError> {
        let mut cursor = Cursor { data, offset: 0 };
        let message = decode_section(&mut cursor, false)?;

        if cursor.offset != data.len() {
            return Err(ViciError::Protocol("trailing bytes in message".into()));
        }

        Ok(message)
    }
}

fn push_name(buffer: &mut Vec<u8>, name: &str) {
    buffer.push(name.len() as u8);
    buffer.extend_from_slice(name.as_bytes());
}

fn push_value(buffer: &mut Vec<u8>, value: &str) {
    buffer.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buffer.extend_from_slice(value.as_bytes());
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl Cursor<'_> {
    fn u8(&mut self) -> Result<u8, ViciError> {
        let byte = *self
            .data
            .get(self.offset)
            .ok_or_else(|| ViciError::Protocol("truncated message".into()))?;
        self.offset += 1;

        Ok(byte)
    }

    fn take(&mut self, len: usize) -> Result<&[u8], ViciError> {
        let end = self.offset + len;
        let slice = self
            .data
            .get(self.offset..end)
            .ok_or_else(|| ViciError::Protocol("truncated message".into()))?;
        self.offset = end;

        Ok(slice)
    }

    fn name(&mut self) -> Result<String, ViciError> {
        let len = self.u8()? as usize;

        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }

    fn value(&mut self) -> Result<String, ViciError> {
        let len = u16::from_be_bytes(self.take(2)?.try_into().unwrap()) as usize;

        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }

    fn done(&self) -> bool {
        self.offset >= self.data.len()
    }
}

fn decode_section(cursor: &mut Cursor<'_>, nested: bool) -> Result<Message, ViciError> {
    let mut message = Message::new();

    while !cursor.done() {
        match cursor.u8()? {
            KEY_VALUE => {
                let key = cursor.name()?;
                let value = cursor.value()?;
                message = message.set(&key, value);
            }
            LIST_START => {
                let key = cursor.name()?;
                let mut values = Vec::new();
                loop {
                    match cursor.u8()? {
                        LIST_ITEM => values.push(cursor.value()?),
                        LIST_END => break,
                        other => {
                            return Err(ViciError::Protocol(format!(
                                "unexpected element {other} in list"
                            )))
                        }
                    }
                }
                message = message.set_list(&key, values);
            }
            SECTION_START => {
                let key = cursor.name()?;
                let section = decode_section(cursor, true)?;
                message = message.set_section(&key, section);
            }
            SECTION_END if nested => return Ok(message),
            other => {
                return Err(ViciError::Protocol(format!(
                    "unexpected element {other} in message"
                )))
            }
        }
    }

    if nested {
        return Err(ViciError::Protocol("unterminated section".into()));
    }

    Ok(message)
}

/// One connection to the daemon's command socket. The connector is the only
/// writer; requests are strictly sequential.
pub struct ViciClient {
    stream: UnixStream,
}

impl ViciClient {
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self, ViciError> {
        Ok(Self {
            stream: UnixStream::connect(socket_path).await?,
        })
    }

    /// Fire a command, await its response message.
    pub async fn request(&mut self, command: &str, message: Message) -> Result<Message, ViciError> {
        self.send_packet(CMD_REQUEST, Some(command), Some(&message))
            .await?;

        loop {
            let (packet_type, payload) = self.read_packet().await?;
            match packet_type {
                CMD_RESPONSE => return Message::decode(&payload),
                CMD_UNKNOWN => return Err(ViciError::UnknownCommand(command.to_owned())),
                // unsolicited events are not interesting here
                EVENT => continue,
                other => {
                    return Err(ViciError::Protocol(format!(
                        "unexpected packet type {other}"
                    )))
                }
            }
        }
    }

    /// Fire a command whose results arrive as a stream of `event` packets,
    /// collecting them until the closing response.
    pub async fn streamed_request(
        &mut self,
        command: &str,
        event: &str,
        message: Message,
    ) -> Result<Vec<Message>, ViciError> {
        self.register(event, true).await?;

        let result = self.collect_events(command, message).await;

        // best effort; a failed unregister poisons nothing
        let _ = self.register(event, false).await;

        result
    }

    async fn collect_events(
        &mut self,
        command: &str,
        message: Message,
    ) -> Result<Vec<Message>, ViciError> {
        self.send_packet(CMD_REQUEST, Some(command), Some(&message))
            .await?;

        let mut items = Vec::new();
        loop {
            let (packet_type, payload) = self.read_packet().await?;
            match packet_type {
                EVENT => {
                    // skip the event name, keep its message
                    let mut cursor = Cursor {
                        data: &payload,
                        offset: 0,
                    };
                    let name_len = cursor.u8()? as usize;
                    cursor.take(name_len)?;
                    items.push(Message::decode(&payload[cursor.offset..])?);
                }
                CMD_RESPONSE => break,
                CMD_UNKNOWN => return Err(ViciError::UnknownCommand(command.to_owned())),
                other => {
                    return Err(ViciError::Protocol(format!(
                        "unexpected packet type {other}"
                    )))
                }
            }
        }

        Ok(items)
    }

    async fn register(&mut self, event: &str, on: bool) -> Result<(), ViciError> {
        let packet_type = if on { EVENT_REGISTER } else { EVENT_UNREGISTER };
        self.send_packet(packet_type, Some(event), None).await?;

        let (packet_type, _) = self.read_packet().await?;
        match packet_type {
            EVENT_CONFIRM => Ok(()),
            EVENT_UNKNOWN => Err(ViciError::UnknownEvent(event.to_owned())),
            other => Err(ViciError::Protocol(format!(
                "unexpected packet type {other}"
            ))),
        }
    }

    async fn send_packet(
        &mut self,
        packet_type: u8,
        name: Option<&str>,
        message: Option<&Message>,
    ) -> Result<(), ViciError> {
        let mut payload = vec![packet_type];
        if let Some(name) = name {
            push_name(&mut payload, name);
        }
        if let Some(message) = message {
            message.encode(&mut payload);
        }

        let mut packet = (payload.len() as u32).to_be_bytes().to_vec();
        packet.extend_from_slice(&payload);

        self.stream.write_all(&packet).await?;

        Ok(())
    }

    async fn read_packet(&mut self) -> Result<(u8, Vec<u8>), ViciError> {
        let mut length = [0u8; 4];
        self.stream.read_exact(&mut length).await?;
        let length = u32::from_be_bytes(length);

        if length == 0 || length > MAX_PACKET_LEN {
            return Err(ViciError::Protocol(format!("bad packet length {length}")));
        }

        let mut payload = vec![0u8; length as usize];
        self.stream.read_exact(&mut payload).await?;

        let packet_type = payload.remove(0);

        Ok((packet_type, payload))
    }
}

/// `load-conn`-style answers carry `success` plus `errmsg` on failure.
pub fn check_success(message: &Message) -> Result<(), ViciError> {
    match message.get_str("success") {
        Some("yes") | None => Ok(()),
        _ => Err(ViciError::CommandFailed(
            message.get_str("errmsg").unwrap_or("unknown error").to_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message::new()
            .set("version", "2")
            .set_list(
                "remote_addrs",
                ["203.0.113.7".to_owned(), "edge1.example.org".to_owned()],
            )
            .set_section(
                "children",
                Message::new().set_section(
                    "sh.edge1",
                    Message::new()
                        .set_list("local_ts", ["10.233.0.0/16".to_owned()])
                        .set_list("remote_ts", ["10.20.1.0/26".to_owned()]),
                ),
            )
    }

    #[test]
    fn messages_survive_an_encode_decode_roundtrip() {
        let message = sample();

        let mut buffer = Vec::new();
        message.encode(&mut buffer);

        assert_eq!(Message::decode(&buffer).unwrap(), message);
    }

    #[test]
    fn truncated_messages_are_rejected() {
        let mut buffer = Vec::new();
        sample().encode(&mut buffer);

        for cut in [1, 5, buffer.len() / 2] {
            assert!(Message::decode(&buffer[..buffer.len() - cut]).is_err());
        }
    }

    #[test]
    fn unterminated_sections_are_rejected() {
        let mut buffer = vec![SECTION_START, 1, b'a'];
        buffer.push(KEY_VALUE);
        push_name(&mut buffer, "k");
        push_value(&mut buffer, "v");

        assert!(Message::decode(&buffer).is_err());
    }

    #[test]
    fn success_fields_gate_command_results() {
        assert!(check_success(&Message::new()).is_ok());
        assert!(check_success(&Message::new().set("success", "yes")).is_ok());

        let failed = Message::new()
            .set("success", "no")
            .set("errmsg", "peer unreachable");
        let error = check_success(&failed).unwrap_err();
        assert!(error.to_string().contains("peer unreachable"));
    }

    #[test]
    fn lookups_find_nested_sections() {
        let message = sample();

        let Some(Element::Section(children)) = message.get("children") else {
            panic!("children section is missing");
        };
        assert_eq!(children.keys().collect::<Vec<_>>(), vec!["sh.edge1"]);
        assert_eq!(message.get_str("version"), Some("2"));
        assert!(message.get_str("children").is_none());
    }
}
