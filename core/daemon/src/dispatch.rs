//! Maps protocol methods onto [`ScopeEngine`] operations.

use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;
use tracing::debug;

use winscope_core::{ScopeEngine, ScopeError, Trigger};
use winscope_daemon_protocol::{
    parse_params, AuditParams, ErrorInfo, LayoutParams, ListLayoutsParams, Method, Request,
    Response, ScratchpadParams, SwitchProjectParams, WindowChange, WindowEventParams,
    PROTOCOL_VERSION,
};

const DEFAULT_AUDIT_LIMIT: usize = 50;
const MAX_AUDIT_LIMIT: usize = 1000;

pub fn handle_request(engine: &mut ScopeEngine, request: Request) -> Response {
    let id = request.id.clone();
    match dispatch(engine, request) {
        Ok(data) => Response::ok(id, data),
        Err(err) => Response::error_with_info(id, err),
    }
}

fn dispatch(engine: &mut ScopeEngine, request: Request) -> Result<Value, ErrorInfo> {
    debug!(method = ?request.method, id = ?request.id, "Dispatching request");
    match request.method {
        Method::GetHealth => Ok(json!({
            "status": "ok",
            "pid": std::process::id(),
            "version": env!("CARGO_PKG_VERSION"),
            "protocol_version": PROTOCOL_VERSION,
            "active_project": engine.active_project(),
            "scratchpads": engine.scratchpads().len(),
            "audit_entries": engine.audit_len(),
        })),
        Method::SwitchProject => {
            let params: SwitchProjectParams = parse_params(request.params)?;
            params.validate()?;
            let report = engine
                .dispatch(Trigger::DirectSwitch {
                    project: params.project,
                })
                .map_err(ErrorInfo::from)?;
            to_value(&report)
        }
        Method::GetActiveProject => Ok(json!({ "project": engine.active_project() })),
        Method::WindowEvent => {
            let params: WindowEventParams = parse_params(request.params)?;
            params.validate()?;
            match params.change {
                WindowChange::Created => {
                    let report = engine
                        .dispatch(Trigger::WindowCreated {
                            window_id: params.window_id,
                            pid: params.pid,
                            marks: None,
                        })
                        .map_err(ErrorInfo::from)?;
                    to_value(&report)
                }
                WindowChange::Closed => {
                    let report = engine
                        .window_closed(params.window_id)
                        .map_err(ErrorInfo::from)?;
                    to_value(&report)
                }
            }
        }
        Method::ToggleScratchpad => {
            let params: ScratchpadParams = parse_params(request.params)?;
            params.validate()?;
            let outcome = engine
                .toggle_scratchpad(
                    &params.project,
                    params.working_directory.as_deref().map(Path::new),
                )
                .map_err(ErrorInfo::from)?;
            to_value(&outcome)
        }
        Method::CloseScratchpad => {
            let params: ScratchpadParams = parse_params(request.params)?;
            params.validate()?;
            let outcome = engine
                .close_scratchpad(&params.project)
                .map_err(ErrorInfo::from)?;
            to_value(&outcome)
        }
        Method::ListScratchpads => to_value(&engine.scratchpads()),
        Method::RestoreLayout => {
            let params: LayoutParams = parse_params(request.params)?;
            params.validate()?;
            let report = engine
                .restore_layout(&params.project, &params.layout)
                .map_err(ErrorInfo::from)?;
            to_value(&report)
        }
        Method::SaveLayout => {
            let params: LayoutParams = parse_params(request.params)?;
            params.validate()?;
            let summary = engine
                .save_layout(&params.project, &params.layout, params.include_global)
                .map_err(ErrorInfo::from)?;
            to_value(&summary)
        }
        Method::ListLayouts => {
            let params: ListLayoutsParams = parse_params(request.params)?;
            params.validate()?;
            let layouts = engine
                .list_layouts(&params.project)
                .map_err(ErrorInfo::from)?;
            Ok(json!({ "project": params.project, "layouts": layouts }))
        }
        Method::GetAudit => {
            let params: AuditParams = match request.params {
                Some(_) => parse_params(request.params)?,
                None => AuditParams::default(),
            };
            let limit = params
                .limit
                .unwrap_or(DEFAULT_AUDIT_LIMIT)
                .min(MAX_AUDIT_LIMIT);
            let entries = engine.audit(params.window_id, limit);
            Ok(json!({
                "total": engine.audit_len(),
                "entries": to_value(&entries)?,
            }))
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, ErrorInfo> {
    serde_json::to_value(value).map_err(|err| {
        ErrorInfo::new(
            "serialization_error",
            format!("failed to serialize response: {}", err),
        )
    })
}

/// Response for requests that arrive while the engine could not be built.
pub fn unavailable(id: Option<String>, err: &ScopeError) -> Response {
    Response::error(
        id,
        "engine_unavailable",
        format!("engine failed to start: {}", err),
    )
}
