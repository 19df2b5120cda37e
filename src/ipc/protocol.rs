//! Message framing and command parsing for the Command Channel (§4.11, §6).
//!
//! Fields are delimited by the ASCII unit-separator (0x1F); records are
//! terminated by LF. A record exceeding [`MAX_RECORD_LEN`] is rejected
//! before it is even split into fields.

use crate::error::ProtocolError;

pub const FIELD_SEPARATOR: u8 = 0x1F;
pub const MAX_RECORD_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Register { name: String, pid: u32, uid: u32, session_hint: u64, version_info: String },
    CreatePublisher { service: String, instance: String, event: String, history_capacity: u32, node: String, port_config: String },
    CreateSubscriber { service: String, instance: String, event: String, history_capacity: u32, node: String, port_config: String },
    CreateServer { service: String, instance: String, event: String, history_capacity: u32, node: String, port_config: String },
    CreateClient { service: String, instance: String, event: String, history_capacity: u32, node: String, port_config: String },
    CreateConditionVariable,
    CreateInterface,
    CreateApplication,
    CreateNode,
    FindService { service: String, instance: String },
    Keepalive { name: String },
    Deregister { name: String },
    Termination,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    RegAck { session_id: u64, segment_id: u64 },
    RegErr { reason: String },
    Ack { fields: Vec<String> },
    Err { reason: String },
    None,
}

impl Reply {
    pub fn encode(&self) -> Vec<u8> {
        let fields: Vec<String> = match self {
            Reply::RegAck { session_id, segment_id } => {
                vec!["REG_ACK".into(), session_id.to_string(), segment_id.to_string()]
            }
            Reply::RegErr { reason } => vec!["REG_ERR".into(), reason.clone()],
            Reply::Ack { fields } => {
                let mut v = vec!["ACK".to_string()];
                v.extend(fields.iter().cloned());
                v
            }
            Reply::Err { reason } => vec!["ERR".into(), reason.clone()],
            Reply::None => return Vec::new(),
        };
        encode_record(&fields)
    }
}

pub fn encode_record(fields: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(FIELD_SEPARATOR);
        }
        out.extend_from_slice(field.as_bytes());
    }
    out.push(b'\n');
    out
}

fn split_fields(record: &[u8]) -> Vec<String> {
    record
        .split(|&b| b == FIELD_SEPARATOR)
        .map(|f| String::from_utf8_lossy(f).into_owned())
        .collect()
}

fn expect_fields<'a>(command: &str, fields: &'a [String], expected: usize) -> Result<&'a [String], ProtocolError> {
    if fields.len() != expected {
        return Err(ProtocolError::WrongFieldCount { command: command.to_string(), expected, got: fields.len() });
    }
    Ok(fields)
}

fn parse_u32(field: &str) -> Result<u32, ProtocolError> {
    field.parse().map_err(|_| ProtocolError::MalformedField(field.to_string()))
}

fn parse_u64(field: &str) -> Result<u64, ProtocolError> {
    field.parse().map_err(|_| ProtocolError::MalformedField(field.to_string()))
}

/// Parses one LF-terminated (LF already stripped) record into a [`Command`].
pub fn parse_record(record: &[u8]) -> Result<Command, ProtocolError> {
    if record.len() > MAX_RECORD_LEN {
        return Err(ProtocolError::RecordTooLong { max: MAX_RECORD_LEN });
    }
    let fields = split_fields(record);
    let (head, rest) = fields.split_first().ok_or(ProtocolError::UnknownCommand(String::new()))?;

    match head.as_str() {
        "REG" => {
            let f = expect_fields("REG", rest, 5)?;
            Ok(Command::Register {
                name: f[0].clone(),
                pid: parse_u32(&f[1])?,
                uid: parse_u32(&f[2])?,
                session_hint: parse_u64(&f[3])?,
                version_info: f[4].clone(),
            })
        }
        "CREATE_PUBLISHER" | "CREATE_SUBSCRIBER" | "CREATE_SERVER" | "CREATE_CLIENT" => {
            let f = expect_fields(head, rest, 6)?;
            let service = f[0].clone();
            let instance = f[1].clone();
            let event = f[2].clone();
            let history_capacity = parse_u32(&f[3])?;
            let node = f[4].clone();
            let port_config = f[5].clone();
            Ok(match head.as_str() {
                "CREATE_PUBLISHER" => Command::CreatePublisher { service, instance, event, history_capacity, node, port_config },
                "CREATE_SUBSCRIBER" => Command::CreateSubscriber { service, instance, event, history_capacity, node, port_config },
                "CREATE_SERVER" => Command::CreateServer { service, instance, event, history_capacity, node, port_config },
                _ => Command::CreateClient { service, instance, event, history_capacity, node, port_config },
            })
        }
        "CREATE_CONDITION_VARIABLE" => {
            expect_fields(head, rest, 0)?;
            Ok(Command::CreateConditionVariable)
        }
        "CREATE_INTERFACE" => {
            expect_fields(head, rest, 0)?;
            Ok(Command::CreateInterface)
        }
        "CREATE_APPLICATION" => {
            expect_fields(head, rest, 0)?;
            Ok(Command::CreateApplication)
        }
        "CREATE_NODE" => {
            expect_fields(head, rest, 0)?;
            Ok(Command::CreateNode)
        }
        "FIND_SERVICE" => {
            let f = expect_fields("FIND_SERVICE", rest, 2)?;
            Ok(Command::FindService { service: f[0].clone(), instance: f[1].clone() })
        }
        "KEEPALIVE" => {
            let f = expect_fields("KEEPALIVE", rest, 1)?;
            Ok(Command::Keepalive { name: f[0].clone() })
        }
        "DEREG" => {
            let f = expect_fields("DEREG", rest, 1)?;
            Ok(Command::Deregister { name: f[0].clone() })
        }
        "TERMINATION" => {
            expect_fields("TERMINATION", rest, 0)?;
            Ok(Command::Termination)
        }
        other => Err(ProtocolError::UnknownCommand(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fields: &[&str]) -> Vec<u8> {
        let owned: Vec<String> = fields.iter().map(|s| s.to_string()).collect();
        let mut bytes = encode_record(&owned);
        bytes.pop(); // strip trailing LF, parse_record expects it pre-stripped
        bytes
    }

    #[test]
    fn reg_round_trips() {
        let rec = record(&["REG", "appA", "4242", "1000", "0", "1.0.0"]);
        let cmd = parse_record(&rec).unwrap();
        assert_eq!(
            cmd,
            Command::Register {
                name: "appA".into(),
                pid: 4242,
                uid: 1000,
                session_hint: 0,
                version_info: "1.0.0".into(),
            }
        );
    }

    #[test]
    fn create_publisher_round_trips_and_carries_the_owning_node() {
        let rec = record(&["CREATE_PUBLISHER", "svc", "inst", "evt", "16", "appA", ""]);
        let cmd = parse_record(&rec).unwrap();
        assert_eq!(
            cmd,
            Command::CreatePublisher {
                service: "svc".into(),
                instance: "inst".into(),
                event: "evt".into(),
                history_capacity: 16,
                node: "appA".into(),
                port_config: "".into(),
            }
        );
    }

    #[test]
    fn wrong_field_count_is_reported() {
        let rec = record(&["REG", "appA"]);
        assert_eq!(
            parse_record(&rec),
            Err(ProtocolError::WrongFieldCount { command: "REG".into(), expected: 5, got: 1 })
        );
    }

    #[test]
    fn unknown_command_is_reported() {
        let rec = record(&["BOGUS"]);
        assert_eq!(parse_record(&rec), Err(ProtocolError::UnknownCommand("BOGUS".into())));
    }

    #[test]
    fn oversized_record_is_rejected() {
        let huge = vec![b'a'; MAX_RECORD_LEN + 1];
        assert_eq!(parse_record(&huge), Err(ProtocolError::RecordTooLong { max: MAX_RECORD_LEN }));
    }

    #[test]
    fn reg_ack_encodes_with_unit_separator() {
        let reply = Reply::RegAck { session_id: 1, segment_id: 0 };
        let encoded = reply.encode();
        assert_eq!(encoded, b"REG_ACK\x1F1\x1F0\n");
    }
}
