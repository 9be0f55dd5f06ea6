//! Wire protocol for the local query socket.
//!
//! Every message is a fixed 4-byte header `{msg_size: u16, pb_head_size:
//! u16}` in native byte order, followed by a bincode-encoded
//! [`MessageHead`] of `pb_head_size` bytes, followed by a bincode-encoded
//! body of `msg_size - pb_head_size` bytes. Requests and responses pair up
//! by message id; error responses carry a non-empty `error` field drawn from
//! the fixed strings below.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SymdbError};
use crate::schema::{LineCol, Location};

pub const DEFAULT_SOCK_PATH: &str = "/tmp/symdb.sock";

pub const ERR_PROJECT_NOT_FOUND: &str = "project not found";
pub const ERR_SYMBOL_NOT_FOUND: &str = "symbol not found";
pub const ERR_PROJ_HOME_NOT_EXISTS: &str = "project home not exists";
pub const ERR_INVALID_PROJ_NAME: &str =
    "invalid project name: only lower letters and underscore allowed";

/// Project names are plain identifiers.
pub fn is_valid_project_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageId {
    Invalid = 0,
    CreateProjectReq = 1,
    CreateProjectRsp = 2,
    UpdateProjectReq = 3,
    UpdateProjectRsp = 4,
    DeleteProjectReq = 5,
    DeleteProjectRsp = 6,
    ListProjectReq = 7,
    ListProjectRsp = 8,
    ListProjectFilesReq = 9,
    ListProjectFilesRsp = 10,
    GetSymbolDefinitionReq = 11,
    GetSymbolDefinitionRsp = 12,
    GetSymbolReferencesReq = 13,
    GetSymbolReferencesRsp = 14,
    ListFileSymbolsReq = 15,
    ListFileSymbolsRsp = 16,
    ListFileReferencesReq = 17,
    ListFileReferencesRsp = 18,
    RebuildFileReq = 19,
    RebuildFileRsp = 20,
}

impl MessageId {
    pub fn from_i32(value: i32) -> Option<Self> {
        use MessageId::*;
        Some(match value {
            1 => CreateProjectReq,
            2 => CreateProjectRsp,
            3 => UpdateProjectReq,
            4 => UpdateProjectRsp,
            5 => DeleteProjectReq,
            6 => DeleteProjectRsp,
            7 => ListProjectReq,
            8 => ListProjectRsp,
            9 => ListProjectFilesReq,
            10 => ListProjectFilesRsp,
            11 => GetSymbolDefinitionReq,
            12 => GetSymbolDefinitionRsp,
            13 => GetSymbolReferencesReq,
            14 => GetSymbolReferencesRsp,
            15 => ListFileSymbolsReq,
            16 => ListFileSymbolsRsp,
            17 => ListFileReferencesReq,
            18 => ListFileReferencesRsp,
            19 => RebuildFileReq,
            20 => RebuildFileRsp,
            _ => return None,
        })
    }
}

/// The 4-byte frame header, native byte order on the local machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub msg_size: u16,
    pub pb_head_size: u16,
}

impl FixedHeader {
    pub fn to_bytes(self) -> [u8; 4] {
        let mut out = [0u8; 4];
        out[..2].copy_from_slice(&self.msg_size.to_ne_bytes());
        out[2..].copy_from_slice(&self.pb_head_size.to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self {
            msg_size: u16::from_ne_bytes([bytes[0], bytes[1]]),
            pb_head_size: u16::from_ne_bytes([bytes[2], bytes[3]]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHead {
    pub msg_id: i32,
    pub body_size: i32,
}

// ---------------------------------------------------------------------------
// Message bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateProjectReq {
    pub proj_name: String,
    pub home_dir: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateProjectRsp {
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateProjectReq {
    pub proj_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateProjectRsp {
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteProjectReq {
    pub proj_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteProjectRsp {
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListProjectReq {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectBrief {
    pub name: String,
    pub home_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListProjectRsp {
    pub error: String,
    pub projects: Vec<ProjectBrief>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListProjectFilesReq {
    pub proj_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListProjectFilesRsp {
    pub error: String,
    pub home_path: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetSymbolDefinitionReq {
    pub proj_name: String,
    pub symbol: String,
    /// Optional hint: prefer the definition from the module owning this path.
    pub abs_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetSymbolDefinitionRsp {
    pub error: String,
    pub locations: Vec<Location>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetSymbolReferencesReq {
    pub proj_name: String,
    pub symbol: String,
    /// Optional hint: restrict to references from this path's module.
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetSymbolReferencesRsp {
    pub error: String,
    pub locations: Vec<Location>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFileSymbolsReq {
    pub proj_name: String,
    pub relative_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSymbol {
    pub name: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFileSymbolsRsp {
    pub error: String,
    pub symbols: Vec<FileSymbol>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFileReferencesReq {
    pub proj_name: String,
    pub relative_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRefSymbol {
    pub name: String,
    pub locations: Vec<LineCol>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFileReferencesRsp {
    pub error: String,
    pub symbols: Vec<FileRefSymbol>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebuildFileReq {
    pub proj_name: String,
    pub relative_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebuildFileRsp {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Typed request/response envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Request {
    CreateProject(CreateProjectReq),
    UpdateProject(UpdateProjectReq),
    DeleteProject(DeleteProjectReq),
    ListProject(ListProjectReq),
    ListProjectFiles(ListProjectFilesReq),
    GetSymbolDefinition(GetSymbolDefinitionReq),
    GetSymbolReferences(GetSymbolReferencesReq),
    ListFileSymbols(ListFileSymbolsReq),
    ListFileReferences(ListFileReferencesReq),
    RebuildFile(RebuildFileReq),
}

impl Request {
    /// Decodes a request body by message id.
    pub fn decode(msg_id: i32, body: &[u8]) -> Result<Self> {
        let id = MessageId::from_i32(msg_id)
            .ok_or_else(|| SymdbError::protocol(format!("unknown msg_id {msg_id}")))?;
        let request = match id {
            MessageId::CreateProjectReq => Request::CreateProject(decode_body(body)?),
            MessageId::UpdateProjectReq => Request::UpdateProject(decode_body(body)?),
            MessageId::DeleteProjectReq => Request::DeleteProject(decode_body(body)?),
            MessageId::ListProjectReq => Request::ListProject(decode_body(body)?),
            MessageId::ListProjectFilesReq => Request::ListProjectFiles(decode_body(body)?),
            MessageId::GetSymbolDefinitionReq => Request::GetSymbolDefinition(decode_body(body)?),
            MessageId::GetSymbolReferencesReq => Request::GetSymbolReferences(decode_body(body)?),
            MessageId::ListFileSymbolsReq => Request::ListFileSymbols(decode_body(body)?),
            MessageId::ListFileReferencesReq => Request::ListFileReferences(decode_body(body)?),
            MessageId::RebuildFileReq => Request::RebuildFile(decode_body(body)?),
            other => {
                return Err(SymdbError::protocol(format!(
                    "{other:?} is not a request id"
                )))
            }
        };
        Ok(request)
    }

    pub fn msg_id(&self) -> MessageId {
        match self {
            Request::CreateProject(_) => MessageId::CreateProjectReq,
            Request::UpdateProject(_) => MessageId::UpdateProjectReq,
            Request::DeleteProject(_) => MessageId::DeleteProjectReq,
            Request::ListProject(_) => MessageId::ListProjectReq,
            Request::ListProjectFiles(_) => MessageId::ListProjectFilesReq,
            Request::GetSymbolDefinition(_) => MessageId::GetSymbolDefinitionReq,
            Request::GetSymbolReferences(_) => MessageId::GetSymbolReferencesReq,
            Request::ListFileSymbols(_) => MessageId::ListFileSymbolsReq,
            Request::ListFileReferences(_) => MessageId::ListFileReferencesReq,
            Request::RebuildFile(_) => MessageId::RebuildFileReq,
        }
    }

    pub fn encode_body(&self) -> Result<Vec<u8>> {
        match self {
            Request::CreateProject(m) => encode_body(m),
            Request::UpdateProject(m) => encode_body(m),
            Request::DeleteProject(m) => encode_body(m),
            Request::ListProject(m) => encode_body(m),
            Request::ListProjectFiles(m) => encode_body(m),
            Request::GetSymbolDefinition(m) => encode_body(m),
            Request::GetSymbolReferences(m) => encode_body(m),
            Request::ListFileSymbols(m) => encode_body(m),
            Request::ListFileReferences(m) => encode_body(m),
            Request::RebuildFile(m) => encode_body(m),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Response {
    CreateProject(CreateProjectRsp),
    UpdateProject(UpdateProjectRsp),
    DeleteProject(DeleteProjectRsp),
    ListProject(ListProjectRsp),
    ListProjectFiles(ListProjectFilesRsp),
    GetSymbolDefinition(GetSymbolDefinitionRsp),
    GetSymbolReferences(GetSymbolReferencesRsp),
    ListFileSymbols(ListFileSymbolsRsp),
    ListFileReferences(ListFileReferencesRsp),
    RebuildFile(RebuildFileRsp),
}

impl Response {
    /// Decodes a response body by message id.
    pub fn decode(msg_id: i32, body: &[u8]) -> Result<Self> {
        let id = MessageId::from_i32(msg_id)
            .ok_or_else(|| SymdbError::protocol(format!("unknown msg_id {msg_id}")))?;
        let response = match id {
            MessageId::CreateProjectRsp => Response::CreateProject(decode_body(body)?),
            MessageId::UpdateProjectRsp => Response::UpdateProject(decode_body(body)?),
            MessageId::DeleteProjectRsp => Response::DeleteProject(decode_body(body)?),
            MessageId::ListProjectRsp => Response::ListProject(decode_body(body)?),
            MessageId::ListProjectFilesRsp => Response::ListProjectFiles(decode_body(body)?),
            MessageId::GetSymbolDefinitionRsp => Response::GetSymbolDefinition(decode_body(body)?),
            MessageId::GetSymbolReferencesRsp => Response::GetSymbolReferences(decode_body(body)?),
            MessageId::ListFileSymbolsRsp => Response::ListFileSymbols(decode_body(body)?),
            MessageId::ListFileReferencesRsp => Response::ListFileReferences(decode_body(body)?),
            MessageId::RebuildFileRsp => Response::RebuildFile(decode_body(body)?),
            other => {
                return Err(SymdbError::protocol(format!(
                    "{other:?} is not a response id"
                )))
            }
        };
        Ok(response)
    }

    pub fn msg_id(&self) -> MessageId {
        match self {
            Response::CreateProject(_) => MessageId::CreateProjectRsp,
            Response::UpdateProject(_) => MessageId::UpdateProjectRsp,
            Response::DeleteProject(_) => MessageId::DeleteProjectRsp,
            Response::ListProject(_) => MessageId::ListProjectRsp,
            Response::ListProjectFiles(_) => MessageId::ListProjectFilesRsp,
            Response::GetSymbolDefinition(_) => MessageId::GetSymbolDefinitionRsp,
            Response::GetSymbolReferences(_) => MessageId::GetSymbolReferencesRsp,
            Response::ListFileSymbols(_) => MessageId::ListFileSymbolsRsp,
            Response::ListFileReferences(_) => MessageId::ListFileReferencesRsp,
            Response::RebuildFile(_) => MessageId::RebuildFileRsp,
        }
    }

    pub fn encode_body(&self) -> Result<Vec<u8>> {
        match self {
            Response::CreateProject(m) => encode_body(m),
            Response::UpdateProject(m) => encode_body(m),
            Response::DeleteProject(m) => encode_body(m),
            Response::ListProject(m) => encode_body(m),
            Response::ListProjectFiles(m) => encode_body(m),
            Response::GetSymbolDefinition(m) => encode_body(m),
            Response::GetSymbolReferences(m) => encode_body(m),
            Response::ListFileSymbols(m) => encode_body(m),
            Response::ListFileReferences(m) => encode_body(m),
            Response::RebuildFile(m) => encode_body(m),
        }
    }

    /// The matching error-carrying response for a request, used when the
    /// request body itself cannot be decoded.
    pub fn error_for(request_id: MessageId, error: impl Into<String>) -> Option<Self> {
        let error = error.into();
        Some(match request_id {
            MessageId::CreateProjectReq => Response::CreateProject(CreateProjectRsp { error }),
            MessageId::UpdateProjectReq => Response::UpdateProject(UpdateProjectRsp { error }),
            MessageId::DeleteProjectReq => Response::DeleteProject(DeleteProjectRsp { error }),
            MessageId::ListProjectReq => Response::ListProject(ListProjectRsp {
                error,
                ..Default::default()
            }),
            MessageId::ListProjectFilesReq => Response::ListProjectFiles(ListProjectFilesRsp {
                error,
                ..Default::default()
            }),
            MessageId::GetSymbolDefinitionReq => {
                Response::GetSymbolDefinition(GetSymbolDefinitionRsp {
                    error,
                    ..Default::default()
                })
            }
            MessageId::GetSymbolReferencesReq => {
                Response::GetSymbolReferences(GetSymbolReferencesRsp {
                    error,
                    ..Default::default()
                })
            }
            MessageId::ListFileSymbolsReq => Response::ListFileSymbols(ListFileSymbolsRsp {
                error,
                ..Default::default()
            }),
            MessageId::ListFileReferencesReq => {
                Response::ListFileReferences(ListFileReferencesRsp {
                    error,
                    ..Default::default()
                })
            }
            MessageId::RebuildFileReq => Response::RebuildFile(RebuildFileRsp { error }),
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

pub fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| SymdbError::protocol(format!("encode body: {e}")))
}

pub fn decode_body<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| SymdbError::protocol(format!("decode body: {e}")))
}

/// Writes one framed message.
pub fn write_frame<W: Write>(writer: &mut W, id: MessageId, body: &[u8]) -> Result<()> {
    let head = MessageHead {
        msg_id: id as i32,
        body_size: body.len() as i32,
    };
    let head_bytes = encode_body(&head)?;

    let msg_size = head_bytes.len() + body.len();
    if msg_size > u16::MAX as usize {
        return Err(SymdbError::protocol(format!("message too large: {msg_size}")));
    }

    let fixed = FixedHeader {
        msg_size: msg_size as u16,
        pb_head_size: head_bytes.len() as u16,
    };
    writer.write_all(&fixed.to_bytes())?;
    writer.write_all(&head_bytes)?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

/// Reads one framed message; `Ok(None)` on a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<(MessageHead, Vec<u8>)>> {
    let mut fixed_bytes = [0u8; 4];
    match reader.read_exact(&mut fixed_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let fixed = FixedHeader::from_bytes(fixed_bytes);
    if fixed.pb_head_size > fixed.msg_size {
        return Err(SymdbError::protocol(format!(
            "head size {} exceeds message size {}",
            fixed.pb_head_size, fixed.msg_size
        )));
    }

    let mut payload = vec![0u8; fixed.msg_size as usize];
    reader.read_exact(&mut payload)?;

    let head: MessageHead = decode_body(&payload[..fixed.pb_head_size as usize])?;
    let body = payload[fixed.pb_head_size as usize..].to_vec();
    Ok(Some((head, body)))
}

pub fn write_request<W: Write>(writer: &mut W, request: &Request) -> Result<()> {
    write_frame(writer, request.msg_id(), &request.encode_body()?)
}

pub fn write_response<W: Write>(writer: &mut W, response: &Response) -> Result<()> {
    write_frame(writer, response.msg_id(), &response.encode_body()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_name_validation() {
        assert!(is_valid_project_name("my_project1"));
        assert!(is_valid_project_name("UPPER"));
        assert!(!is_valid_project_name(""));
        assert!(!is_valid_project_name("with-dash"));
        assert!(!is_valid_project_name("with space"));
    }

    #[test]
    fn fixed_header_round_trip() {
        let header = FixedHeader {
            msg_size: 300,
            pb_head_size: 12,
        };
        assert_eq!(FixedHeader::from_bytes(header.to_bytes()), header);
    }

    #[test]
    fn frame_round_trip() {
        let request = Request::GetSymbolDefinition(GetSymbolDefinitionReq {
            proj_name: "demo".to_string(),
            symbol: "c:@F@fn#".to_string(),
            abs_path: String::new(),
        });

        let mut wire = Vec::new();
        write_request(&mut wire, &request).unwrap();

        let (head, body) = read_frame(&mut wire.as_slice()).unwrap().unwrap();
        assert_eq!(head.msg_id, MessageId::GetSymbolDefinitionReq as i32);
        assert_eq!(head.body_size as usize, body.len());

        match Request::decode(head.msg_id, &body).unwrap() {
            Request::GetSymbolDefinition(req) => {
                assert_eq!(req.proj_name, "demo");
                assert_eq!(req.symbol, "c:@F@fn#");
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn eof_is_a_clean_end() {
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty).unwrap().is_none());
    }

    #[test]
    fn unknown_msg_id_is_rejected() {
        assert!(Request::decode(999, &[]).is_err());
        // A response id is not a request.
        assert!(Request::decode(MessageId::CreateProjectRsp as i32, &[]).is_err());
    }

    #[test]
    fn error_response_builder_matches_request() {
        let rsp = Response::error_for(MessageId::RebuildFileReq, ERR_PROJECT_NOT_FOUND).unwrap();
        assert_eq!(rsp.msg_id(), MessageId::RebuildFileRsp);
        match rsp {
            Response::RebuildFile(m) => assert_eq!(m.error, ERR_PROJECT_NOT_FOUND),
            other => panic!("unexpected response {other:?}"),
        }
    }
}
