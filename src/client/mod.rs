//! Client-side session: one request/response exchange at a time over the
//! daemon's local socket.

use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::error::{Result, SymdbError};
use crate::protocol::{
    self, CreateProjectReq, CreateProjectRsp, DeleteProjectReq, DeleteProjectRsp,
    GetSymbolDefinitionReq, GetSymbolDefinitionRsp, GetSymbolReferencesReq, GetSymbolReferencesRsp,
    ListFileReferencesReq, ListFileReferencesRsp, ListFileSymbolsReq, ListFileSymbolsRsp,
    ListProjectFilesReq, ListProjectFilesRsp, ListProjectReq, ListProjectRsp, RebuildFileReq,
    RebuildFileRsp, Request, Response, UpdateProjectReq, UpdateProjectRsp,
};

pub struct Client {
    stream: UnixStream,
}

macro_rules! call {
    ($self:ident, $request:expr, $variant:ident) => {{
        match $self.call($request)? {
            Response::$variant(rsp) => Ok(rsp),
            other => Err(SymdbError::protocol(format!(
                "unexpected response {:?}",
                other.msg_id()
            ))),
        }
    }};
}

impl Client {
    pub fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).map_err(|e| {
            SymdbError::protocol(format!("cannot connect to {}: {e}", socket_path.display()))
        })?;
        Ok(Self { stream })
    }

    fn call(&mut self, request: Request) -> Result<Response> {
        protocol::write_request(&mut self.stream, &request)?;
        let (head, body) = protocol::read_frame(&mut self.stream)?
            .ok_or_else(|| SymdbError::protocol("server closed the connection"))?;
        Response::decode(head.msg_id, &body)
    }

    pub fn create_project(&mut self, name: &str, home: &str) -> Result<CreateProjectRsp> {
        let request = Request::CreateProject(CreateProjectReq {
            proj_name: name.to_string(),
            home_dir: home.to_string(),
        });
        call!(self, request, CreateProject)
    }

    pub fn update_project(&mut self, name: &str) -> Result<UpdateProjectRsp> {
        let request = Request::UpdateProject(UpdateProjectReq {
            proj_name: name.to_string(),
        });
        call!(self, request, UpdateProject)
    }

    pub fn delete_project(&mut self, name: &str) -> Result<DeleteProjectRsp> {
        let request = Request::DeleteProject(DeleteProjectReq {
            proj_name: name.to_string(),
        });
        call!(self, request, DeleteProject)
    }

    pub fn list_projects(&mut self) -> Result<ListProjectRsp> {
        call!(self, Request::ListProject(ListProjectReq {}), ListProject)
    }

    pub fn list_project_files(&mut self, name: &str) -> Result<ListProjectFilesRsp> {
        let request = Request::ListProjectFiles(ListProjectFilesReq {
            proj_name: name.to_string(),
        });
        call!(self, request, ListProjectFiles)
    }

    pub fn symbol_definition(
        &mut self,
        project: &str,
        symbol: &str,
        abs_path: Option<&str>,
    ) -> Result<GetSymbolDefinitionRsp> {
        let request = Request::GetSymbolDefinition(GetSymbolDefinitionReq {
            proj_name: project.to_string(),
            symbol: symbol.to_string(),
            abs_path: abs_path.unwrap_or_default().to_string(),
        });
        call!(self, request, GetSymbolDefinition)
    }

    pub fn symbol_references(
        &mut self,
        project: &str,
        symbol: &str,
        path: Option<&str>,
    ) -> Result<GetSymbolReferencesRsp> {
        let request = Request::GetSymbolReferences(GetSymbolReferencesReq {
            proj_name: project.to_string(),
            symbol: symbol.to_string(),
            path: path.unwrap_or_default().to_string(),
        });
        call!(self, request, GetSymbolReferences)
    }

    pub fn file_symbols(&mut self, project: &str, rel_path: &str) -> Result<ListFileSymbolsRsp> {
        let request = Request::ListFileSymbols(ListFileSymbolsReq {
            proj_name: project.to_string(),
            relative_path: rel_path.to_string(),
        });
        call!(self, request, ListFileSymbols)
    }

    pub fn file_references(
        &mut self,
        project: &str,
        rel_path: &str,
    ) -> Result<ListFileReferencesRsp> {
        let request = Request::ListFileReferences(ListFileReferencesReq {
            proj_name: project.to_string(),
            relative_path: rel_path.to_string(),
        });
        call!(self, request, ListFileReferences)
    }

    pub fn rebuild_file(&mut self, project: &str, rel_path: &str) -> Result<RebuildFileRsp> {
        let request = Request::RebuildFile(RebuildFileReq {
            proj_name: project.to_string(),
            relative_path: rel_path.to_string(),
        });
        call!(self, request, RebuildFile)
    }
}
